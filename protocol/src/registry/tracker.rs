//! # Node Tracker
//!
//! The authoritative in-memory table of per-peer state. All access goes
//! through `&self`; the table sits behind a `parking_lot::RwLock` so the
//! many per-peer tasks of the node can share one `Arc<NodeTracker>`
//! without any locking of their own.
//!
//! Local observations (`observe_*`, `record_local`) emit a change
//! notification on the channel returned by [`NodeTracker::new`]. Remote
//! data folded in with [`NodeTracker::handle_node_data`] never does, so a
//! record received by gossip is not gossiped again.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::node_data::{Activity, NodeData};

/// Receiving half of the tracker's change notifications.
pub type NodeDataReceiver = mpsc::UnboundedReceiver<NodeData>;

#[derive(Debug, Default)]
struct TrackerState {
    records: HashMap<PeerId, NodeData>,
    /// Insertion order, so snapshots are stable across calls.
    order: Vec<PeerId>,
    /// Peers this node itself holds a connection to. Kept apart from
    /// `is_active`, which may have been learned from other nodes.
    connected: HashSet<PeerId>,
    local_peer: Option<PeerId>,
}

impl TrackerState {
    fn upsert(&mut self, data: NodeData) {
        if !self.records.contains_key(&data.peer_id) {
            self.order.push(data.peer_id);
        }
        self.records.insert(data.peer_id, data);
    }
}

/// Thread-safe registry of [`NodeData`] records keyed by peer identity.
#[derive(Debug)]
pub struct NodeTracker {
    state: RwLock<TrackerState>,
    changes: mpsc::UnboundedSender<NodeData>,
}

impl NodeTracker {
    /// Creates an empty tracker and the receiver of its change notifications.
    pub fn new() -> (Self, NodeDataReceiver) {
        let (changes, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            state: RwLock::new(TrackerState::default()),
            changes,
        };
        (tracker, rx)
    }

    /// Records this node's own entry. Remote records about the local peer
    /// are ignored from now on.
    pub fn record_local(&self, data: NodeData) {
        {
            let mut state = self.state.write();
            state.local_peer = Some(data.peer_id);
            state.upsert(data.clone());
        }
        self.notify(data);
    }

    /// A connection to `peer_id` was established.
    ///
    /// Emits a `Joined` notification only when the peer was not already
    /// connected, so duplicate connection events produce a single join. A
    /// record learned from other nodes does not count as a connection.
    pub fn observe_connected(
        &self,
        peer_id: PeerId,
        multiaddrs: Vec<Multiaddr>,
    ) -> Option<NodeData> {
        let data = {
            let mut state = self.state.write();
            if !state.connected.insert(peer_id) {
                trace!(peer = %peer_id, "already connected, ignoring duplicate join");
                return None;
            }
            let now = Utc::now();
            let data = match state.records.get(&peer_id) {
                Some(existing) => {
                    let mut data = existing.clone();
                    let now = monotonic_after(now, data.last_updated);
                    data.activity = Activity::Joined;
                    data.is_active = true;
                    data.last_joined = now;
                    data.last_updated = now;
                    if !multiaddrs.is_empty() {
                        data.multiaddrs = multiaddrs;
                    }
                    data
                }
                None => NodeData::joined(peer_id, multiaddrs, now),
            };
            state.upsert(data.clone());
            data
        };

        debug!(peer = %peer_id, "peer joined");
        self.notify(data.clone());
        Some(data)
    }

    /// The connection to `peer_id` was lost.
    ///
    /// Emits a `Left` notification only for peers currently connected.
    pub fn observe_disconnected(&self, peer_id: PeerId) -> Option<NodeData> {
        let data = {
            let mut state = self.state.write();
            if !state.connected.remove(&peer_id) {
                return None;
            }
            let mut data = state.records.get(&peer_id)?.clone();
            let now = monotonic_after(Utc::now(), data.last_updated);
            data.activity = Activity::Left;
            data.is_active = false;
            data.last_left = Some(now);
            data.last_updated = now;
            state.upsert(data.clone());
            data
        };

        debug!(peer = %peer_id, "peer left");
        self.notify(data.clone());
        Some(data)
    }

    /// Merge entrypoint for records received from the network.
    ///
    /// Idempotent and order-independent. Returns `true` if the registry
    /// changed.
    pub fn handle_node_data(&self, data: NodeData) -> bool {
        let mut state = self.state.write();
        if state.local_peer == Some(data.peer_id) {
            trace!(peer = %data.peer_id, "ignoring remote record about the local node");
            return false;
        }

        match state.records.get_mut(&data.peer_id) {
            Some(existing) => existing.merge(&data),
            None => {
                trace!(peer = %data.peer_id, activity = %data.activity, "new peer record");
                state.upsert(data);
                true
            }
        }
    }

    /// Point-in-time snapshot of every record, in insertion order.
    pub fn get_all_node_data(&self) -> Vec<NodeData> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect()
    }

    /// Returns the record for `peer_id`, if any.
    pub fn get(&self, peer_id: &PeerId) -> Option<NodeData> {
        self.state.read().records.get(peer_id).cloned()
    }

    /// Number of tracked peers, including the local node.
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    /// Returns `true` if nothing is tracked yet.
    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    /// Number of tracked peers currently marked active.
    pub fn active_count(&self) -> usize {
        self.state
            .read()
            .records
            .values()
            .filter(|d| d.is_active)
            .count()
    }

    fn notify(&self, data: NodeData) {
        // The receiver only goes away once the node has shut down.
        if self.changes.send(data).is_err() {
            trace!("change receiver dropped, notification discarded");
        }
    }
}

/// Returns `now`, or one millisecond past `previous` if the clock has not
/// moved beyond it, so a local observation always supersedes the last one.
fn monotonic_after(now: DateTime<Utc>, previous: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}
