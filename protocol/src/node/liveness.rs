//! # Liveness Protocol
//!
//! After a discovered peer is connected the node opens one liveness stream
//! to it. A writer sends `"<source>: Hello from <address>\n"` every
//! heartbeat interval; a reader echoes whatever non-blank lines come back.
//! When either side ends, the other is told to stop through a per-stream
//! signal, and both end on root cancellation through the task pool.
//!
//! The accepting side drains the heartbeats as they arrive and keeps only
//! counters, so a stream can stay open for the lifetime of the connection.
//!
//! Nothing here touches the registry. Stream errors stay local.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::oracle::NodeContext;
use super::stats::{bump, NodeStats};
use super::tasks::kind;
use crate::network::PeerStream;

/// The heartbeat line written on every tick.
pub fn heartbeat_line(source: &str, local_addr: &str) -> String {
    format!("{source}: Hello from {local_addr}\n")
}

/// Starts the writer and reader of an outbound liveness stream. The stream
/// is dropped if the pool has no room for its writer.
pub(crate) fn start(ctx: &Arc<NodeContext>, stream: PeerStream, source: &str) {
    let peer = stream.remote_peer();
    let line = heartbeat_line(source, &ctx.local_address());
    let interval = ctx.config.liveness_interval;
    bump(&ctx.stats.liveness_streams);

    let (read_half, write_half) = tokio::io::split(stream);
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    let writer = {
        let stop_tx = Arc::clone(&stop_tx);
        let stop_rx = stop_rx.clone();
        ctx.pool.spawn(kind::LIVENESS_WRITER, async move {
            let sent = run_writer(write_half, line, interval, stop_rx).await;
            debug!(peer = %peer, sent, "liveness writer finished");
            stop_tx.send_replace(true);
        })
    };
    if !writer {
        warn!(peer = %peer, "no room for liveness writer, stream dropped");
        return;
    }

    let reader = ctx.pool.spawn(kind::LIVENESS_READER, async move {
        let echoed = run_reader(read_half, peer, stop_rx).await;
        debug!(peer = %peer, echoed, "liveness reader finished");
        stop_tx.send_replace(true);
    });
    if !reader {
        warn!(peer = %peer, "no room for liveness reader, heartbeats sent unread");
    }

    info!(peer = %peer, "liveness stream open");
}

/// Writes `line` now and then once per `interval` until a write fails or
/// `stop` fires. Closes the write side on exit and returns the number of
/// lines written.
pub async fn run_writer<W>(
    mut writer: W,
    line: String,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> usize
where
    W: AsyncWrite + Unpin,
{
    let mut sent = 0;
    loop {
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(error = %e, "liveness write failed, closing stream");
            break;
        }
        sent += 1;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => break,
        }
    }
    let _ = writer.shutdown().await;
    sent
}

/// Echoes non-blank lines to the console until a blank line, end of
/// stream, a read error or `stop`. Returns the number of lines echoed.
pub async fn run_reader<R>(reader: R, peer: PeerId, mut stop: watch::Receiver<bool>) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut echoed = 0;
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {
                    debug!(peer = %peer, "blank liveness line, closing stream");
                    break;
                }
                Ok(Some(line)) => {
                    debug!(peer = %peer, %line, "liveness line");
                    println!("\x1b[32m{line}\x1b[0m");
                    echoed += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "liveness read failed, closing stream");
                    break;
                }
            },
            _ = stop.changed() => break,
        }
    }
    echoed
}

/// Consumes `reader` to the end without keeping what it read. Returns the
/// number of newline-terminated lines and of bytes seen.
pub async fn drain_heartbeats<R>(reader: R) -> io::Result<(usize, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut lines = 0;
    let mut bytes = 0u64;
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok((lines, bytes));
        }
        let len = chunk.len();
        lines += chunk.iter().filter(|b| **b == b'\n').count();
        bytes += len as u64;
        reader.consume(len);
    }
}

/// Inbound liveness streams: drain until the dialer closes, then log.
pub(crate) async fn handle_inbound(stream: PeerStream, stats: Arc<NodeStats>) {
    bump(&stats.liveness_streams);
    let peer = stream.remote_peer();
    match drain_heartbeats(stream).await {
        Ok((lines, bytes)) => info!(peer = %peer, lines, bytes, "inbound liveness stream closed"),
        Err(e) => warn!(peer = %peer, error = %e, "inbound liveness stream failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn heartbeat_format() {
        assert_eq!(
            heartbeat_line("bootstrap", "/ip4/10.0.0.1/tcp/4001"),
            "bootstrap: Hello from /ip4/10.0.0.1/tcp/4001\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn writer_repeats_on_interval_until_remote_goes_away() {
        let (local, remote) = tokio::io::duplex(1024);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let writer = tokio::spawn(run_writer(
            local,
            heartbeat_line("mdns", "/memory/1"),
            Duration::from_secs(30),
            stop_rx,
        ));

        let mut lines = BufReader::new(remote).lines();
        let start = Instant::now();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "mdns: Hello from /memory/1"
        );
        lines.next_line().await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));

        drop(lines);
        assert_eq!(writer.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn writer_stops_on_signal() {
        let (local, _remote) = tokio::io::duplex(1024);
        let (stop_tx, stop_rx) = watch::channel(false);
        let writer = tokio::spawn(run_writer(
            local,
            "x\n".to_string(),
            Duration::from_secs(3600),
            stop_rx,
        ));
        tokio::task::yield_now().await;
        stop_tx.send(true).unwrap();
        assert_eq!(writer.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reader_stops_at_blank_line() {
        let (mut remote, local) = tokio::io::duplex(1024);
        remote.write_all(b"one\ntwo\n\nthree\n").await.unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        assert_eq!(run_reader(local, PeerId::random(), stop_rx).await, 2);
    }

    #[tokio::test]
    async fn inbound_drain_outlasts_the_single_message_limit() {
        let (mut remote, local) = tokio::io::duplex(64 * 1024);
        let line = heartbeat_line("bootstrap", "/ip4/10.0.0.1/tcp/4001");
        let count = crate::config::MAX_SINGLE_MESSAGE_BYTES / line.len() + 100;

        let writer = tokio::spawn(async move {
            for _ in 0..count {
                remote.write_all(line.as_bytes()).await.unwrap();
            }
            remote.shutdown().await.unwrap();
        });

        let (lines, bytes) = drain_heartbeats(local).await.unwrap();
        writer.await.unwrap();
        assert_eq!(lines, count);
        assert!(bytes > crate::config::MAX_SINGLE_MESSAGE_BYTES as u64);
    }

    #[tokio::test]
    async fn reader_stops_on_signal() {
        let (_remote, local) = tokio::io::duplex(1024);
        let (stop_tx, stop_rx) = watch::channel(false);
        let reader = tokio::spawn(run_reader(local, PeerId::random(), stop_rx));
        stop_tx.send(true).unwrap();
        assert_eq!(reader.await.unwrap(), 0);
    }
}
