//! # Registry
//!
//! The node's view of the mesh: one [`NodeData`] record per peer, held by
//! the thread-safe [`NodeTracker`].

pub mod node_data;
pub mod tracker;

pub use node_data::{Activity, NodeData};
pub use tracker::{NodeDataReceiver, NodeTracker};
