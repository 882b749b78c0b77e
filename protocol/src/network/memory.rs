//! # In-Process Transport
//!
//! [`MemoryNetwork`] wires any number of [`MemoryHost`]s together inside
//! one process. Streams are `tokio::io::duplex` pipes and pub/sub delivers
//! every message to every other subscriber of the topic, which models a
//! fully converged mesh. Used by the integration tests and by the node
//! binary's `simulate` command.
//!
//! The network also counts opened streams per `(from, to, protocol)` so
//! tests can assert how often a protocol was exercised.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use super::transport::{
    AddrInfo, ConnectionEvent, Host, MessageHandler, PeerStream, PubSub, PubSubMessage,
    StreamHandler,
};
use crate::config;
use crate::error::TransportError;

/// Capacity of each in-memory stream pipe, in bytes.
const DUPLEX_CAPACITY: usize = 64 * 1024;

type StreamKey = (PeerId, PeerId, String);

#[derive(Default)]
struct NetworkState {
    hosts: HashMap<PeerId, Arc<HostState>>,
    next_port: u64,
    opened: HashMap<StreamKey, usize>,
}

struct HostState {
    peer_id: PeerId,
    addr: Multiaddr,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    subscriptions: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    connections: RwLock<HashSet<PeerId>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl HostState {
    fn emit(&self, event: ConnectionEvent) {
        // No subscriber yet is fine; the event has nobody to inform.
        let _ = self.events.send(event);
    }
}

/// A set of in-process hosts that can reach each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a host with a fresh random identity.
    pub fn add_host(&self) -> MemoryHost {
        self.add_host_with_id(PeerId::random())
    }

    /// Adds a host with the given identity, listening on a fresh
    /// `/memory/<port>` address.
    pub fn add_host_with_id(&self, peer_id: PeerId) -> MemoryHost {
        let mut state = self.state.lock();
        state.next_port += 1;
        let addr = Multiaddr::empty().with(Protocol::Memory(state.next_port));
        let (events, _) = broadcast::channel(config::CONNECTION_EVENT_CHANNEL_CAPACITY);

        let host = Arc::new(HostState {
            peer_id,
            addr,
            handlers: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashSet::new()),
            events,
        });
        state.hosts.insert(peer_id, Arc::clone(&host));
        debug!(peer = %peer_id, addr = %host.addr, "memory host added");

        MemoryHost {
            host,
            network: self.clone(),
        }
    }

    /// Number of streams `from` opened to `to` on `protocol` so far.
    pub fn streams_opened(&self, from: PeerId, to: PeerId, protocol: &str) -> usize {
        self.state
            .lock()
            .opened
            .get(&(from, to, protocol.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn host(&self, peer_id: &PeerId) -> Option<Arc<HostState>> {
        self.state.lock().hosts.get(peer_id).cloned()
    }
}

/// One node's handle on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryHost {
    host: Arc<HostState>,
    network: MemoryNetwork,
}

impl MemoryHost {
    /// The address other hosts dial this one at.
    pub fn addr(&self) -> Multiaddr {
        self.host.addr.clone()
    }

    /// Address record for dialing this host.
    pub fn addr_info(&self) -> AddrInfo {
        AddrInfo::new(self.host.peer_id, vec![self.addr()])
    }

    /// Tears down the connection to `peer` on both ends, emitting
    /// `Disconnected` on each side that was connected.
    pub fn disconnect(&self, peer: PeerId) {
        if self.host.connections.write().remove(&peer) {
            self.host.emit(ConnectionEvent::Disconnected { peer });
        }
        if let Some(remote) = self.network.host(&peer) {
            if remote.connections.write().remove(&self.host.peer_id) {
                remote.emit(ConnectionEvent::Disconnected {
                    peer: self.host.peer_id,
                });
            }
        }
    }

    fn link(&self, remote: &Arc<HostState>) {
        if self.host.connections.write().insert(remote.peer_id) {
            self.host.emit(ConnectionEvent::Connected {
                peer: remote.peer_id,
                addr: Some(remote.addr.clone()),
            });
        }
        if remote.connections.write().insert(self.host.peer_id) {
            remote.emit(ConnectionEvent::Connected {
                peer: self.host.peer_id,
                addr: Some(self.host.addr.clone()),
            });
        }
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn local_peer_id(&self) -> PeerId {
        self.host.peer_id
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        vec![self.addr()]
    }

    async fn connect(&self, peer: &AddrInfo) -> Result<(), TransportError> {
        let remote = self
            .network
            .host(&peer.peer_id)
            .ok_or_else(|| TransportError::Dial {
                peer: peer.peer_id,
                reason: "no such host on the memory network".to_string(),
            })?;

        if !peer.addrs.is_empty() && !peer.addrs.contains(&remote.addr) {
            return Err(TransportError::Dial {
                peer: peer.peer_id,
                reason: "address does not match".to_string(),
            });
        }

        self.link(&remote);
        Ok(())
    }

    async fn new_stream(&self, peer: PeerId, protocol: &str) -> Result<PeerStream, TransportError> {
        let remote = self
            .network
            .host(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;

        let handler = remote
            .handlers
            .read()
            .get(protocol)
            .cloned()
            .ok_or_else(|| TransportError::ProtocolNotSupported {
                peer,
                protocol: protocol.to_string(),
            })?;

        self.link(&remote);
        *self
            .network
            .state
            .lock()
            .opened
            .entry((self.host.peer_id, peer, protocol.to_string()))
            .or_default() += 1;

        let (local_io, remote_io) = tokio::io::duplex(DUPLEX_CAPACITY);
        let inbound = PeerStream::new(self.host.peer_id, protocol, remote_io);
        tokio::spawn(handler(inbound));
        trace!(from = %self.host.peer_id, to = %peer, protocol, "memory stream opened");

        Ok(PeerStream::new(peer, protocol, local_io))
    }

    fn set_stream_handler(
        &self,
        protocol: &str,
        handler: StreamHandler,
    ) -> Result<(), TransportError> {
        let mut handlers = self.host.handlers.write();
        if handlers.contains_key(protocol) {
            return Err(TransportError::AlreadyRegistered(protocol.to_string()));
        }
        handlers.insert(protocol.to_string(), handler);
        Ok(())
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.host.events.subscribe()
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.host.connections.read().iter().copied().collect()
    }
}

#[async_trait]
impl PubSub for MemoryHost {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let targets: Vec<Arc<dyn MessageHandler>> = {
            let state = self.network.state.lock();
            state
                .hosts
                .values()
                .filter(|h| h.peer_id != self.host.peer_id)
                .filter_map(|h| h.subscriptions.read().get(topic).cloned())
                .collect()
        };

        let message = PubSubMessage {
            topic: topic.to_string(),
            source: self.host.peer_id,
            data: Bytes::from(data),
        };
        for handler in targets {
            handler.handle_message(&message);
        }
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        let mut subscriptions = self.host.subscriptions.write();
        if subscriptions.contains_key(topic) {
            return Err(TransportError::AlreadyRegistered(topic.to_string()));
        }
        subscriptions.insert(topic.to_string(), handler);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::stream_handler;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    struct Collect(Mutex<Vec<PubSubMessage>>);

    impl MessageHandler for Collect {
        fn handle_message(&self, message: &PubSubMessage) {
            self.0.lock().push(message.clone());
        }
    }

    #[tokio::test]
    async fn connect_emits_events_once_on_both_sides() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();
        let mut a_events = a.connection_events();
        let mut b_events = b.connection_events();

        a.connect(&b.addr_info()).await.unwrap();
        a.connect(&b.addr_info()).await.unwrap();

        assert_eq!(
            a_events.recv().await.unwrap(),
            ConnectionEvent::Connected {
                peer: b.local_peer_id(),
                addr: Some(b.addr())
            }
        );
        assert!(matches!(
            b_events.recv().await.unwrap(),
            ConnectionEvent::Connected { peer, .. } if peer == a.local_peer_id()
        ));
        assert!(a_events.try_recv().is_err());

        a.disconnect(b.local_peer_id());
        assert_eq!(
            b_events.recv().await.unwrap(),
            ConnectionEvent::Disconnected {
                peer: a.local_peer_id()
            }
        );
        assert!(a.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn dial_unknown_host_fails() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let ghost = AddrInfo::new(PeerId::random(), vec![]);
        assert!(matches!(
            a.connect(&ghost).await,
            Err(TransportError::Dial { .. })
        ));
    }

    #[tokio::test]
    async fn streams_reach_the_registered_handler() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handler = stream_handler(move |mut stream: PeerStream| {
            let tx = tx.clone();
            async move {
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf).await.unwrap();
                tx.send((stream.remote_peer(), buf)).unwrap();
            }
        });
        b.set_stream_handler("/echo/1", handler).unwrap();

        let mut stream = a.new_stream(b.local_peer_id(), "/echo/1").await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.shutdown().await.unwrap();

        let (from, payload) = rx.recv().await.unwrap();
        assert_eq!(from, a.local_peer_id());
        assert_eq!(payload, b"hello");
        assert_eq!(net.streams_opened(a.local_peer_id(), b.local_peer_id(), "/echo/1"), 1);

        assert!(matches!(
            a.new_stream(b.local_peer_id(), "/missing/1").await,
            Err(TransportError::ProtocolNotSupported { .. })
        ));
    }

    #[tokio::test]
    async fn publish_skips_the_publisher() {
        let net = MemoryNetwork::new();
        let a = net.add_host();
        let b = net.add_host();
        let a_inbox = Arc::new(Collect(Mutex::new(Vec::new())));
        let b_inbox = Arc::new(Collect(Mutex::new(Vec::new())));
        a.subscribe("topic", a_inbox.clone()).unwrap();
        b.subscribe("topic", b_inbox.clone()).unwrap();
        assert!(b.subscribe("topic", b_inbox.clone()).is_err());

        a.publish("topic", b"x".to_vec()).await.unwrap();

        assert!(a_inbox.0.lock().is_empty());
        let received = b_inbox.0.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].source, a.local_peer_id());
        assert_eq!(&received[0].data[..], b"x");
    }
}
