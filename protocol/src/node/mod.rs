//! # Oracle Node
//!
//! The protocol core: reacting to discovery, the join-triggered full sync,
//! gossip propagation and the liveness heartbeat, all over the transport
//! traits of [`crate::network`].
//!
//! ## Architecture
//!
//! ```text
//! oracle.rs     OracleNode: wiring, start, join, accessors
//! discovery.rs  PeerEvent feed and the discovery reaction loop
//! liveness.rs   Heartbeat writer/reader and the inbound handler
//! sync.rs       NodeDataPage codec, full-sync send and receive
//! gossip.rs     Change dispatch loop, topic and stream gossip
//! framing.rs    Single-message reads, JSON line writes
//! tasks.rs      Bounded, cancellable per-peer task pool
//! stats.rs      Atomic counters for the status and metrics surfaces
//! ```
//!
//! ## Design Decisions
//!
//! - Full sync and gossip are redundant channels into the same registry.
//!   Neither retries; a record missed by one usually arrives by the other,
//!   which is why the registry merge has to be order-independent.
//! - Every per-peer task goes through the task pool and is raced against the
//!   root cancellation, so shutdown does not wait on silent peers.

pub mod discovery;
pub mod framing;
pub mod gossip;
pub mod liveness;
pub mod oracle;
pub mod stats;
pub mod sync;
pub mod tasks;

pub use discovery::{
    bootstrap_events, peer_event_channel, PeerAction, PeerEvent, PeerEventReceiver,
    PeerEventSender, BOOTSTRAP_SOURCE,
};
pub use oracle::OracleNode;
pub use stats::{NodeStats, StatsSnapshot};
pub use sync::{paginate, NodeDataPage, SyncReceipt};
pub use tasks::TaskPool;
