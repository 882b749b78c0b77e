//! # Network Module
//!
//! Everything below the oracle node: the transport boundary it programs
//! against and the two implementations shipped with the crate.
//!
//! ## Architecture
//!
//! ```text
//! transport.rs  Host / PubSub traits, PeerStream, connection events
//! memory.rs     In-process network for tests and simulations
//! swarm.rs      libp2p host (tcp, noise, yamux, gossipsub, identify)
//! address.rs    Multiaddr selection and parsing helpers
//! ```
//!
//! ## Design Decisions
//!
//! - The oracle node only sees trait objects, so the same protocol code runs
//!   over an in-memory duplex pipe in tests and over libp2p in production.
//! - Streams are negotiated per protocol identifier; an unknown identifier is
//!   refused at open time rather than surfacing later as garbage bytes.
//! - Connection lifecycle is exposed as a broadcast channel so several
//!   consumers (the registry feed, metrics) can follow it independently.

pub mod address;
pub mod memory;
pub mod swarm;
pub mod transport;

pub use address::{
    addr_infos, advertised_addrs, is_unspecified, priority_address, split_peer_id,
};
pub use memory::{MemoryHost, MemoryNetwork};
pub use swarm::SwarmHost;
pub use transport::{
    stream_handler, AddrInfo, ConnectionEvent, Host, MessageHandler, PeerStream, PubSub,
    PubSubMessage, StreamHandler,
};
