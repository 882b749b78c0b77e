// Copyright (c) 2026 Oracle Mesh Contributors. MIT License.
// See LICENSE for details.

//! # Oracle Protocol Core Library
//!
//! The protocol layer of an oracle mesh node. Each node keeps a directory of
//! the peers it knows about and the state they were last seen in, and keeps
//! it in step with everyone else without a central registry.
//!
//! ## Architecture
//!
//! - **registry**: The per-peer directory: change notifications, an
//!   order-independent merge and point-in-time snapshots.
//! - **network**: The transport boundary (`Host`, `PubSub`) plus an
//!   in-memory and a TCP implementation.
//! - **node**: The oracle node: discovery reaction, join-triggered full
//!   sync, gossip and the liveness heartbeat.
//! - **config**: Protocol identifiers, limits and `NodeConfig`.
//! - **error**: Error types.
//!
//! ## Consistency Model
//!
//! Records travel on two independent paths. Every local change is gossiped
//! as a single record, and every newly connected peer receives the whole
//! directory as a paginated transfer. Either path may lose data, and the
//! two interleave arbitrarily, so the registry merge is idempotent and
//! commutative: any delivery order converges to the same table.

pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod registry;

pub use config::NodeConfig;
pub use error::{ProtocolError, TransportError};
pub use node::{OracleNode, StatsSnapshot};
pub use registry::{Activity, NodeData, NodeTracker};
