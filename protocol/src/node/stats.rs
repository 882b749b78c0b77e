//! Lock-free counters describing what the node has done since start.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters, shared by every task of one node.
#[derive(Debug, Default)]
pub struct NodeStats {
    pub(crate) gossip_published: AtomicU64,
    pub(crate) gossip_publish_failures: AtomicU64,
    pub(crate) gossip_received: AtomicU64,
    pub(crate) gossip_dropped: AtomicU64,
    pub(crate) syncs_sent: AtomicU64,
    pub(crate) sync_failures: AtomicU64,
    pub(crate) sync_pages_sent: AtomicU64,
    pub(crate) sync_pages_received: AtomicU64,
    pub(crate) sync_records_received: AtomicU64,
    pub(crate) sync_pages_malformed: AtomicU64,
    pub(crate) dial_failures: AtomicU64,
    pub(crate) liveness_streams: AtomicU64,
}

/// Point-in-time copy of [`NodeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub gossip_published: u64,
    pub gossip_publish_failures: u64,
    pub gossip_received: u64,
    pub gossip_dropped: u64,
    pub syncs_sent: u64,
    pub sync_failures: u64,
    pub sync_pages_sent: u64,
    pub sync_pages_received: u64,
    pub sync_records_received: u64,
    pub sync_pages_malformed: u64,
    pub dial_failures: u64,
    pub liveness_streams: u64,
    /// Per-peer tasks dropped because their kind was at its bound. Filled
    /// in from the task pool, not from [`NodeStats`].
    #[serde(default)]
    pub tasks_rejected: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    add(counter, 1);
}

pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl NodeStats {
    /// Reads every counter. Counters are independent, so the copy is not an
    /// atomic cut across all of them.
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            gossip_published: get(&self.gossip_published),
            gossip_publish_failures: get(&self.gossip_publish_failures),
            gossip_received: get(&self.gossip_received),
            gossip_dropped: get(&self.gossip_dropped),
            syncs_sent: get(&self.syncs_sent),
            sync_failures: get(&self.sync_failures),
            sync_pages_sent: get(&self.sync_pages_sent),
            sync_pages_received: get(&self.sync_pages_received),
            sync_records_received: get(&self.sync_records_received),
            sync_pages_malformed: get(&self.sync_pages_malformed),
            dial_failures: get(&self.dial_failures),
            liveness_streams: get(&self.liveness_streams),
            tasks_rejected: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = NodeStats::default();
        bump(&stats.gossip_received);
        bump(&stats.gossip_received);
        add(&stats.sync_records_received, 250);

        let snap = stats.snapshot();
        assert_eq!(snap.gossip_received, 2);
        assert_eq!(snap.sync_records_received, 250);
        assert_eq!(snap.gossip_dropped, 0);
    }
}
