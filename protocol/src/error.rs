//! Error types for the oracle protocol.
//!
//! Two layers: [`TransportError`] for everything the host adapter can fail
//! at, and [`ProtocolError`] for the node itself. Only setup failures are
//! ever returned to the caller of [`OracleNode::start`](crate::node::OracleNode::start);
//! per-stream failures are logged where they happen.

use libp2p::PeerId;
use thiserror::Error;

/// Failures of the opaque transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dialing the peer failed.
    #[error("failed to dial {peer}: {reason}")]
    Dial {
        /// The peer we tried to reach.
        peer: PeerId,
        /// Human-readable cause.
        reason: String,
    },

    /// The peer has no known address and no open connection.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// The remote does not serve the requested protocol.
    #[error("protocol {protocol} not supported by {peer}")]
    ProtocolNotSupported {
        /// The remote peer.
        peer: PeerId,
        /// The protocol identifier that was requested.
        protocol: String,
    },

    /// A stream handler or topic subscription was registered twice.
    #[error("handler already registered for {0}")]
    AlreadyRegistered(String),

    /// A protocol identifier is not a valid stream protocol name.
    #[error("invalid protocol identifier: {0}")]
    InvalidProtocol(String),

    /// Publishing on a topic failed, typically because no peer subscribes.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The transport could not be built or could not listen.
    #[error("transport setup failed: {0}")]
    Setup(String),

    /// The transport has shut down.
    #[error("transport closed")]
    Closed,

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the node layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The node could not be started.
    #[error("setup failed: {0}")]
    Setup(String),

    /// Stream I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
