//! # Transport Boundary
//!
//! The node never touches sockets. It talks to a [`Host`] (addressing,
//! dialing, protocol-multiplexed streams, connection notifications) and a
//! [`PubSub`] fabric (topic broadcast). Both are implemented by
//! [`MemoryNetwork`](super::memory::MemoryNetwork) for tests and
//! simulations and by [`SwarmHost`](super::swarm::SwarmHost) for real
//! deployments.
//!
//! Implementations must be internally synchronized: every method takes
//! `&self` and is called concurrently from many tasks.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use libp2p::{Multiaddr, PeerId};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::broadcast;

use crate::error::TransportError;

// ---------------------------------------------------------------------------
// Addressing
// ---------------------------------------------------------------------------

/// A peer identity together with the addresses it can be reached at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    /// The peer's identity.
    pub peer_id: PeerId,
    /// Dialable addresses, best first.
    pub addrs: Vec<Multiaddr>,
}

impl AddrInfo {
    /// Creates an address record.
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }
}

impl fmt::Display for AddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}: [", self.peer_id)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", addr)?;
        }
        f.write_str("]}")
    }
}

/// Connection lifecycle notifications emitted by a [`Host`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection to `peer` was established, in either direction.
    Connected {
        /// The remote peer.
        peer: PeerId,
        /// The remote's advertised address, when the transport knows it.
        addr: Option<Multiaddr>,
    },
    /// The last connection to `peer` went away.
    Disconnected {
        /// The remote peer.
        peer: PeerId,
    },
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Byte pipe underneath a [`PeerStream`].
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// A bidirectional, ordered byte stream to one remote peer, negotiated for
/// one protocol identifier.
///
/// Shutting down the write side signals a clean end-of-stream to the remote.
pub struct PeerStream {
    remote: PeerId,
    protocol: String,
    io: Box<dyn StreamIo>,
}

impl PeerStream {
    /// Wraps a transport pipe.
    pub fn new(remote: PeerId, protocol: impl Into<String>, io: impl StreamIo + 'static) -> Self {
        Self {
            remote,
            protocol: protocol.into(),
            io: Box::new(io),
        }
    }

    /// The peer on the other end.
    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    /// The protocol this stream was opened for.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

impl fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerStream")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Callback invoked by the host for every inbound stream on a protocol.
pub type StreamHandler = Arc<dyn Fn(PeerStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Builds a [`StreamHandler`] from an async function.
pub fn stream_handler<F, Fut>(f: F) -> StreamHandler
where
    F: Fn(PeerStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stream: PeerStream| -> BoxFuture<'static, ()> { Box::pin(f(stream)) })
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Opaque transport: addressing, dialing and protocol-multiplexed streams.
#[async_trait]
pub trait Host: Send + Sync {
    /// This node's identity.
    fn local_peer_id(&self) -> PeerId;

    /// Addresses this node can be reached at.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Establishes a connection to `peer`. Connecting to an already
    /// connected peer succeeds without side effects.
    async fn connect(&self, peer: &AddrInfo) -> Result<(), TransportError>;

    /// Opens a new stream to `peer` negotiated for `protocol`.
    async fn new_stream(&self, peer: PeerId, protocol: &str) -> Result<PeerStream, TransportError>;

    /// Registers the handler for inbound streams on `protocol`.
    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler)
        -> Result<(), TransportError>;

    /// Subscribes to connection lifecycle notifications.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Peers with an open connection.
    fn connected_peers(&self) -> Vec<PeerId>;
}

// ---------------------------------------------------------------------------
// Pub/Sub
// ---------------------------------------------------------------------------

/// One message delivered on a topic.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Publisher of the message.
    pub source: PeerId,
    /// Opaque payload.
    pub data: Bytes,
}

/// Receiver of topic messages.
pub trait MessageHandler: Send + Sync {
    /// Called once per delivered message. Must not block.
    fn handle_message(&self, message: &PubSubMessage);
}

/// Topic-based broadcast. Delivery is at most once per hop with no ordering
/// across publishers.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publishes `data` on `topic`.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError>;

    /// Routes messages on `topic` to `handler`.
    fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>)
        -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn peer_stream_delegates_io() {
        let (a, b) = tokio::io::duplex(64);
        let peer = PeerId::random();
        let mut left = PeerStream::new(peer, "/test/1", a);
        let mut right = PeerStream::new(peer, "/test/1", b);

        left.write_all(b"ping").await.unwrap();
        left.shutdown().await.unwrap();

        let mut buf = Vec::new();
        right.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");
        assert_eq!(right.protocol(), "/test/1");
        assert_eq!(right.remote_peer(), peer);
    }

    #[test]
    fn addr_info_display_lists_addresses() {
        let peer = PeerId::random();
        let info = AddrInfo::new(
            peer,
            vec![
                "/ip4/10.0.0.1/tcp/4001".parse().unwrap(),
                "/ip4/127.0.0.1/tcp/4001".parse().unwrap(),
            ],
        );
        assert_eq!(
            info.to_string(),
            format!("{{{}: [/ip4/10.0.0.1/tcp/4001 /ip4/127.0.0.1/tcp/4001]}}", peer)
        );
    }
}
