//! # Full-State Sync
//!
//! When a peer joins, the node sends it the whole registry as a sequence of
//! [`NodeDataPage`]s, one JSON object per line, then closes the stream.
//!
//! The snapshot is taken once per send and sliced into pages, so all pages
//! of one transfer are mutually consistent: concatenating pages
//! `0..total_pages` reproduces the snapshot exactly. An empty registry
//! produces zero pages and an immediately closed stream.
//!
//! The receiver decodes each line independently. A malformed line is logged
//! with its raw content and skipped; the lines after it are still applied.

use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::framing::write_json_line;
use super::stats::{add, bump, NodeStats};
use crate::config;
use crate::error::ProtocolError;
use crate::network::{Host, PeerStream};
use crate::registry::{NodeData, NodeTracker};

/// One slice of a registry snapshot on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDataPage {
    /// Records of this page, in snapshot order.
    pub data: Vec<NodeData>,
    /// Zero-based index of this page.
    pub page_number: usize,
    /// Number of pages in the transfer.
    pub total_pages: usize,
    /// Number of records in the snapshot.
    pub total_records: usize,
}

/// Splits `snapshot` into pages of `page_size` records. The last page holds
/// the remainder. Zero records yield zero pages.
pub fn paginate(snapshot: &[NodeData], page_size: usize) -> Vec<NodeDataPage> {
    let page_size = page_size.max(1);
    let total_records = snapshot.len();
    let total_pages = total_records.div_ceil(page_size);

    snapshot
        .chunks(page_size)
        .enumerate()
        .map(|(page_number, chunk)| NodeDataPage {
            data: chunk.to_vec(),
            page_number,
            total_pages,
            total_records,
        })
        .collect()
}

/// Sends the current registry to `peer`. Returns the number of pages
/// written.
pub async fn send_node_data(
    host: &dyn Host,
    tracker: &NodeTracker,
    stats: &NodeStats,
    peer: PeerId,
    page_size: usize,
) -> Result<usize, ProtocolError> {
    let mut stream = host
        .new_stream(peer, config::NODE_DATA_SYNC_PROTOCOL)
        .await?;

    let snapshot = tracker.get_all_node_data();
    let pages = paginate(&snapshot, page_size);
    for page in &pages {
        write_json_line(&mut stream, page).await?;
        bump(&stats.sync_pages_sent);
    }
    stream.shutdown().await?;

    info!(
        peer = %peer,
        pages = pages.len(),
        records = snapshot.len(),
        "full sync sent"
    );
    Ok(pages.len())
}

/// Outcome of one inbound full sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReceipt {
    /// Pages decoded and applied.
    pub pages: usize,
    /// Records forwarded to the registry.
    pub records: usize,
    /// Lines that failed to decode.
    pub malformed: usize,
}

/// Reads pages from `stream` until the remote closes it, merging every
/// record into `tracker`.
pub async fn receive_node_data(
    stream: PeerStream,
    tracker: &NodeTracker,
    stats: &NodeStats,
) -> SyncReceipt {
    let peer = stream.remote_peer();
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut receipt = SyncReceipt::default();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(peer = %peer, error = %e, "error reading sync stream");
                break;
            }
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let page: NodeDataPage = match serde_json::from_slice(&line) {
            Ok(page) => page,
            Err(e) => {
                warn!(
                    peer = %peer,
                    error = %e,
                    raw = %String::from_utf8_lossy(&line).trim_end(),
                    "skipping malformed sync page"
                );
                receipt.malformed += 1;
                bump(&stats.sync_pages_malformed);
                continue;
            }
        };

        debug!(
            peer = %peer,
            page = page.page_number,
            total_pages = page.total_pages,
            records = page.data.len(),
            "sync page received"
        );
        receipt.pages += 1;
        receipt.records += page.data.len();
        bump(&stats.sync_pages_received);
        add(&stats.sync_records_received, page.data.len() as u64);
        for record in page.data {
            tracker.handle_node_data(record);
        }
    }

    info!(
        peer = %peer,
        pages = receipt.pages,
        records = receipt.records,
        malformed = receipt.malformed,
        "full sync received"
    );
    receipt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn records(n: usize) -> Vec<NodeData> {
        let now = Utc::now();
        (0..n)
            .map(|_| NodeData::joined(PeerId::random(), vec![], now))
            .collect()
    }

    #[test]
    fn pages_of_250_by_100() {
        let snapshot = records(250);
        let pages = paginate(&snapshot, 100);

        let sizes: Vec<usize> = pages.iter().map(|p| p.data.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        for (i, page) in pages.iter().enumerate() {
            assert_eq!(page.page_number, i);
            assert_eq!(page.total_pages, 3);
            assert_eq!(page.total_records, 250);
        }

        let rebuilt: Vec<NodeData> = pages.into_iter().flat_map(|p| p.data).collect();
        assert_eq!(rebuilt, snapshot);
    }

    #[test]
    fn exact_multiple_has_no_trailing_page() {
        let pages = paginate(&records(200), 100);
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| p.data.len() == 100));
    }

    #[test]
    fn empty_snapshot_has_no_pages() {
        assert!(paginate(&[], 100).is_empty());
    }

    #[test]
    fn wire_field_names() {
        let page = paginate(&records(1), 100).remove(0);
        let json = serde_json::to_value(&page).unwrap();
        let obj = json.as_object().unwrap();
        for key in ["data", "pageNumber", "totalPages", "totalRecords"] {
            assert!(obj.contains_key(key), "missing {key}");
        }
    }

    #[tokio::test]
    async fn corrupted_line_does_not_block_the_rest() {
        let (tx, rx) = tokio::io::duplex(64 * 1024);
        let peer = PeerId::random();
        let mut writer = PeerStream::new(peer, config::NODE_DATA_SYNC_PROTOCOL, tx);
        let reader = PeerStream::new(peer, config::NODE_DATA_SYNC_PROTOCOL, rx);

        let snapshot = records(5);
        let pages = paginate(&snapshot, 3);
        write_json_line(&mut writer, &pages[0]).await.unwrap();
        writer.write_all(b"{\"data\": [oops\n").await.unwrap();
        writer.write_all(b"\xff\xfe garbage\n").await.unwrap();
        write_json_line(&mut writer, &pages[1]).await.unwrap();
        writer.shutdown().await.unwrap();

        let (tracker, _changes) = NodeTracker::new();
        let stats = NodeStats::default();
        let receipt = receive_node_data(reader, &tracker, &stats).await;

        assert_eq!(
            receipt,
            SyncReceipt {
                pages: 2,
                records: 5,
                malformed: 2
            }
        );
        assert_eq!(tracker.get_all_node_data(), snapshot);
        assert_eq!(stats.snapshot().sync_pages_malformed, 2);
    }

    #[tokio::test]
    async fn send_over_memory_network() {
        use crate::network::{stream_handler, MemoryNetwork};
        use std::sync::Arc;
        use tokio::sync::mpsc;

        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();

        let (b_tracker, _) = NodeTracker::new();
        let b_tracker = Arc::new(b_tracker);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        {
            let tracker = Arc::clone(&b_tracker);
            b.set_stream_handler(
                config::NODE_DATA_SYNC_PROTOCOL,
                stream_handler(move |stream: PeerStream| {
                    let tracker = Arc::clone(&tracker);
                    let done_tx = done_tx.clone();
                    async move {
                        let receipt =
                            receive_node_data(stream, &tracker, &NodeStats::default()).await;
                        let _ = done_tx.send(receipt);
                    }
                }),
            )
            .unwrap();
        }

        let (a_tracker, _) = NodeTracker::new();
        for record in records(7) {
            a_tracker.handle_node_data(record);
        }
        let stats = NodeStats::default();
        let pages = send_node_data(&a, &a_tracker, &stats, b.local_peer_id(), 3)
            .await
            .unwrap();
        assert_eq!(pages, 3);
        assert_eq!(stats.snapshot().sync_pages_sent, 3);

        let receipt = done_rx.recv().await.unwrap();
        assert_eq!(receipt.records, 7);
        assert_eq!(b_tracker.get_all_node_data(), a_tracker.get_all_node_data());
    }

    #[tokio::test]
    async fn empty_registry_sends_zero_pages() {
        use crate::network::{stream_handler, MemoryNetwork};
        use tokio::sync::mpsc;

        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        b.set_stream_handler(
            config::NODE_DATA_SYNC_PROTOCOL,
            stream_handler(move |stream: PeerStream| {
                let done_tx = done_tx.clone();
                async move {
                    let (tracker, _) = NodeTracker::new();
                    let receipt =
                        receive_node_data(stream, &tracker, &NodeStats::default()).await;
                    let _ = done_tx.send((receipt, tracker.get_all_node_data().len()));
                }
            }),
        )
        .unwrap();

        let (tracker, _) = NodeTracker::new();
        let pages = send_node_data(&a, &tracker, &NodeStats::default(), b.local_peer_id(), 100)
            .await
            .unwrap();
        assert_eq!(pages, 0);

        let (receipt, stored) =
            tokio::time::timeout(std::time::Duration::from_secs(1), done_rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(receipt, SyncReceipt::default());
        assert_eq!(stored, 0);
    }
}
