//! # Protocol Configuration & Constants
//!
//! Every identifier and tunable the mesh agrees on lives here. Peers that
//! disagree on any of the protocol identifiers below simply cannot talk to
//! each other, so treat them as part of the wire format.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Identifiers
// ---------------------------------------------------------------------------

/// Version of this protocol family. Bumped whenever a wire format changes.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Stream protocol for the periodic liveness heartbeat.
pub const LIVENESS_PROTOCOL: &str = "/oracle/liveness/0.1.0";

/// Stream protocol for the paginated full-state transfer sent on join.
pub const NODE_DATA_SYNC_PROTOCOL: &str = "/oracle/node-data-sync/0.1.0";

/// Gossip identifier. Used both as the pub/sub topic and as the stream
/// protocol for single-record pushes outside the topic mesh.
pub const NODE_GOSSIP_TOPIC: &str = "/oracle/node-gossip/0.1.0";

/// Protocol version announced through identify. Peers check it before
/// trusting the listen addresses that come with it.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/oracle/id/0.1.0";

// ---------------------------------------------------------------------------
// Full Sync
// ---------------------------------------------------------------------------

/// Number of `NodeData` records carried by one full-sync page.
pub const PAGE_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Interval between two heartbeat lines on a liveness stream.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);

/// Gossipsub mesh maintenance period.
pub const GOSSIP_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// A connection with no open stream is closed after this long.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Resource Limits
// ---------------------------------------------------------------------------

/// Upper bound on concurrently running per-peer tasks of one kind (liveness
/// writers, sync senders, inbound gossip streams and so on). Each kind has
/// its own budget.
pub const MAX_CONCURRENT_PEER_TASKS: usize = 512;

/// Largest payload accepted by the single-message stream reader.
pub const MAX_SINGLE_MESSAGE_BYTES: usize = 1024 * 1024;

/// Buffer of the discovery feed channel.
pub const PEER_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Buffer of the host's connection notification channel.
pub const CONNECTION_EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Node Configuration
// ---------------------------------------------------------------------------

/// Runtime configuration of an [`OracleNode`](crate::node::OracleNode).
///
/// Defaults come from the constants above; tests shrink the intervals with
/// the `with_*` setters.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Records per full-sync page.
    pub page_size: usize,
    /// Heartbeat period on liveness streams.
    pub liveness_interval: Duration,
    /// Per-kind bound of the per-peer task pool.
    pub max_peer_tasks: usize,
    /// Whether this node has staked. Carried in its own registry record.
    pub is_staked: bool,
    /// Publisher signature. A node with a non-empty signature is a publisher.
    pub signature: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            liveness_interval: LIVENESS_INTERVAL,
            max_peer_tasks: MAX_CONCURRENT_PEER_TASKS,
            is_staked: false,
            signature: None,
        }
    }
}

impl NodeConfig {
    /// Sets the full-sync page size. Zero is clamped to one.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sets the liveness heartbeat interval.
    #[must_use]
    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Sets the per-kind task bound. Zero is clamped to one.
    #[must_use]
    pub fn with_max_peer_tasks(mut self, max: usize) -> Self {
        self.max_peer_tasks = max.max(1);
        self
    }

    /// Marks the node as staked.
    #[must_use]
    pub fn with_staked(mut self, is_staked: bool) -> Self {
        self.is_staked = is_staked;
        self
    }

    /// Sets the publisher signature.
    #[must_use]
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_identifiers_are_distinct() {
        assert_ne!(LIVENESS_PROTOCOL, NODE_DATA_SYNC_PROTOCOL);
        assert_ne!(LIVENESS_PROTOCOL, NODE_GOSSIP_TOPIC);
        assert_ne!(NODE_DATA_SYNC_PROTOCOL, NODE_GOSSIP_TOPIC);
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let config = NodeConfig::default()
            .with_page_size(0)
            .with_max_peer_tasks(0);
        assert_eq!(config.page_size, 1);
        assert_eq!(config.max_peer_tasks, 1);
    }
}
