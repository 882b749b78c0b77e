//! # libp2p Host
//!
//! [`SwarmHost`] implements [`Host`] and [`PubSub`] over a libp2p swarm:
//! TCP with noise and yamux for connections, gossipsub for the topic,
//! identify for learning how to dial peers back, and a raw stream behaviour
//! for the protocol-multiplexed streams the node protocols use.
//!
//! The swarm is owned by a single event-loop task. [`SwarmHost`] handles are
//! cheap clones that talk to it over a command channel and read the state it
//! publishes (listen addresses, connected peers, known peer addresses).
//!
//! ## Connection notifications
//!
//! A peer is reported [`ConnectionEvent::Connected`] once per connection
//! lifetime. On the dialing side that happens as soon as noise has
//! authenticated the remote, with the address we dialed. On the accepting
//! side it waits for the remote's identify info, so the event carries a
//! listen address the remote announced rather than its ephemeral source
//! port. [`ConnectionEvent::Disconnected`] follows when the last connection
//! closes. A dial that never connects emits nothing.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use libp2p::core::ConnectedPoint;
use libp2p::gossipsub::{self, IdentTopic, MessageAuthenticity, ValidationMode};
use libp2p::identify;
use libp2p::identity::Keypair;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{DialError, NetworkBehaviour, SwarmEvent};
use libp2p::{noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder};
use libp2p_stream::{Control, OpenStreamError};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info, trace, warn};

use super::address::{is_unspecified, priority_address, split_peer_id, tcp_multiaddr};
use super::transport::{
    AddrInfo, ConnectionEvent, Host, MessageHandler, PeerStream, PubSub, PubSubMessage,
    StreamHandler,
};
use crate::config;
use crate::error::TransportError;

// ---------------------------------------------------------------------------
// Behaviour
// ---------------------------------------------------------------------------

#[derive(NetworkBehaviour)]
struct OracleBehaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    streams: libp2p_stream::Behaviour,
}

impl OracleBehaviour {
    fn new(key: &Keypair) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let gossip_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(config::GOSSIP_HEARTBEAT_INTERVAL)
            .validation_mode(ValidationMode::Strict)
            .build()?;
        let gossipsub =
            gossipsub::Behaviour::new(MessageAuthenticity::Signed(key.clone()), gossip_config)?;

        let identify = identify::Behaviour::new(identify::Config::new(
            config::IDENTIFY_PROTOCOL_VERSION.to_string(),
            key.public(),
        ));

        Ok(Self {
            gossipsub,
            identify,
            streams: libp2p_stream::Behaviour::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Shared State
// ---------------------------------------------------------------------------

/// State written by the event loop and read by every handle.
struct Shared {
    local_peer: PeerId,
    external: Vec<Multiaddr>,
    listen: RwLock<Vec<Multiaddr>>,
    connected: RwLock<HashSet<PeerId>>,
    peer_addrs: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
    subscriptions: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn remember_addrs(&self, peer: PeerId, addrs: &[Multiaddr]) {
        let mut known = self.peer_addrs.write();
        let entry = known.entry(peer).or_default();
        for addr in addrs {
            if !entry.contains(addr) {
                entry.push(addr.clone());
            }
        }
    }
}

type DialReply = oneshot::Sender<Result<(), TransportError>>;

enum Command {
    Dial {
        info: AddrInfo,
        reply: DialReply,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Subscribe {
        topic: String,
    },
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Handle to a running libp2p swarm.
#[derive(Clone)]
pub struct SwarmHost {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    control: Control,
    shutdown: watch::Receiver<bool>,
}

impl SwarmHost {
    /// Builds the swarm for `keypair`, starts listening on `bind` and spawns
    /// the event loop. `external` addresses are advertised in addition to
    /// the interface addresses the listener reports.
    ///
    /// Returns once the listener is up. The event loop stops when
    /// `shutdown` fires.
    pub async fn bind(
        keypair: Keypair,
        bind: SocketAddr,
        external: Vec<Multiaddr>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, TransportError> {
        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| TransportError::Setup(e.to_string()))?
            .with_behaviour(OracleBehaviour::new)
            .map_err(|e| TransportError::Setup(e.to_string()))?
            .with_swarm_config(|c| {
                c.with_idle_connection_timeout(config::IDLE_CONNECTION_TIMEOUT)
            })
            .build();

        swarm
            .listen_on(tcp_multiaddr(bind))
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        for addr in &external {
            swarm.add_external_address(addr.clone());
        }

        let first = first_listen_addr(&mut swarm).await?;
        let local_peer = *swarm.local_peer_id();
        info!(peer = %local_peer, addr = %first, "swarm listening");

        let (events, _) = broadcast::channel(config::CONNECTION_EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            local_peer,
            external,
            listen: RwLock::new(vec![first]),
            connected: RwLock::new(HashSet::new()),
            peer_addrs: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            events,
        });

        let control = swarm.behaviour().streams.new_control();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let event_loop = EventLoop {
            swarm,
            commands: command_rx,
            shared: Arc::clone(&shared),
            pending_dials: HashMap::new(),
            announced: HashSet::new(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(event_loop.run());

        Ok(Self {
            shared,
            commands,
            control,
            shutdown,
        })
    }

    fn send(&self, command: Command) -> Result<(), TransportError> {
        self.commands.send(command).map_err(|_| TransportError::Closed)
    }
}

/// Drives a fresh swarm until its listener reports an address.
async fn first_listen_addr(
    swarm: &mut Swarm<OracleBehaviour>,
) -> Result<Multiaddr, TransportError> {
    loop {
        match swarm.select_next_some().await {
            SwarmEvent::NewListenAddr { address, .. } => return Ok(address),
            SwarmEvent::ListenerClosed { reason, .. } => {
                let reason = match reason {
                    Ok(()) => "listener closed".to_string(),
                    Err(e) => e.to_string(),
                };
                return Err(TransportError::Setup(reason));
            }
            SwarmEvent::ListenerError { error, .. } => {
                return Err(TransportError::Setup(error.to_string()));
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Host for SwarmHost {
    fn local_peer_id(&self) -> PeerId {
        self.shared.local_peer
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        let mut addrs = self.shared.external.clone();
        for addr in self.shared.listen.read().iter() {
            if !is_unspecified(addr) && !addrs.contains(addr) {
                addrs.push(addr.clone());
            }
        }
        addrs
    }

    async fn connect(&self, peer: &AddrInfo) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Dial {
            info: peer.clone(),
            reply,
        })?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn new_stream(&self, peer: PeerId, protocol: &str) -> Result<PeerStream, TransportError> {
        let name = StreamProtocol::try_from_owned(protocol.to_string())
            .map_err(|_| TransportError::InvalidProtocol(protocol.to_string()))?;

        if !self.shared.connected.read().contains(&peer) {
            let addrs = self
                .shared
                .peer_addrs
                .read()
                .get(&peer)
                .cloned()
                .ok_or(TransportError::UnknownPeer(peer))?;
            self.connect(&AddrInfo::new(peer, addrs)).await?;
        }

        let stream = self
            .control
            .clone()
            .open_stream(peer, name)
            .await
            .map_err(|e| match e {
                OpenStreamError::UnsupportedProtocol(_) => TransportError::ProtocolNotSupported {
                    peer,
                    protocol: protocol.to_string(),
                },
                OpenStreamError::Io(e) => TransportError::Io(e),
                other => TransportError::Dial {
                    peer,
                    reason: other.to_string(),
                },
            })?;
        trace!(peer = %peer, protocol, "stream opened");
        Ok(PeerStream::new(peer, protocol, stream.compat()))
    }

    fn set_stream_handler(
        &self,
        protocol: &str,
        handler: StreamHandler,
    ) -> Result<(), TransportError> {
        let name = StreamProtocol::try_from_owned(protocol.to_string())
            .map_err(|_| TransportError::InvalidProtocol(protocol.to_string()))?;
        let mut incoming = self
            .control
            .clone()
            .accept(name)
            .map_err(|_| TransportError::AlreadyRegistered(protocol.to_string()))?;

        let protocol = protocol.to_string();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = incoming.next() => match next {
                        Some((peer, stream)) => {
                            trace!(peer = %peer, protocol = %protocol, "inbound stream");
                            let stream = PeerStream::new(peer, protocol.clone(), stream.compat());
                            tokio::spawn(handler(stream));
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!(protocol = %protocol, "stream handler stopped");
        });
        Ok(())
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.connected.read().iter().copied().collect()
    }
}

#[async_trait]
impl PubSub for SwarmHost {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Publish {
            topic: topic.to_string(),
            data,
            reply,
        })?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        {
            let mut subscriptions = self.shared.subscriptions.write();
            if subscriptions.contains_key(topic) {
                return Err(TransportError::AlreadyRegistered(topic.to_string()));
            }
            subscriptions.insert(topic.to_string(), handler);
        }
        self.send(Command::Subscribe {
            topic: topic.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Event Loop
// ---------------------------------------------------------------------------

struct EventLoop {
    swarm: Swarm<OracleBehaviour>,
    commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    pending_dials: HashMap<PeerId, Vec<DialReply>>,
    /// Peers a `Connected` event went out for.
    announced: HashSet<PeerId>,
    shutdown: watch::Receiver<bool>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_event(event),
                _ = self.shutdown.changed() => break,
            }
        }
        info!(peer = %self.shared.local_peer, "swarm event loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { info, reply } => self.dial(info, reply),
            Command::Publish { topic, data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(IdentTopic::new(topic).hash(), data)
                    .map(|_| ())
                    .map_err(|e| TransportError::Publish(e.to_string()));
                let _ = reply.send(result);
            }
            Command::Subscribe { topic } => {
                let ident = IdentTopic::new(topic.as_str());
                if let Err(e) = self.swarm.behaviour_mut().gossipsub.subscribe(&ident) {
                    warn!(topic = %topic, error = %e, "gossipsub subscription failed");
                }
            }
        }
    }

    fn dial(&mut self, info: AddrInfo, reply: DialReply) {
        let peer = info.peer_id;
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }
        self.shared.remember_addrs(peer, &info.addrs);

        let opts = DialOpts::peer_id(peer)
            .addresses(info.addrs)
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .build();
        match self.swarm.dial(opts) {
            Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                self.pending_dials.entry(peer).or_default().push(reply);
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "dial refused");
                let _ = reply.send(Err(TransportError::Dial {
                    peer,
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<OracleBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "listening");
                let mut listen = self.shared.listen.write();
                if !listen.contains(&address) {
                    listen.push(address);
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!(addr = %address, "listen address expired");
                self.shared.listen.write().retain(|a| a != &address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                self.shared.connected.write().insert(peer_id);
                for reply in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = reply.send(Ok(()));
                }
                match endpoint {
                    ConnectedPoint::Dialer { address, .. } => {
                        let address = split_peer_id(&address)
                            .map(|(_, transport)| transport)
                            .unwrap_or(address);
                        self.announce(peer_id, Some(address));
                    }
                    ConnectedPoint::Listener { .. } => {
                        let known = self
                            .shared
                            .peer_addrs
                            .read()
                            .get(&peer_id)
                            .and_then(|addrs| priority_address(addrs));
                        if known.is_some() {
                            self.announce(peer_id, known);
                        }
                    }
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                cause,
                ..
            } => {
                if num_established > 0 {
                    return;
                }
                self.shared.connected.write().remove(&peer_id);
                if self.announced.remove(&peer_id) {
                    let cause = cause.map(|e| e.to_string());
                    debug!(peer = %peer_id, ?cause, "peer disconnected");
                    let _ = self
                        .shared
                        .events
                        .send(ConnectionEvent::Disconnected { peer: peer_id });
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer),
                error,
                ..
            } => {
                if self.swarm.is_connected(&peer) {
                    return;
                }
                let reason = error.to_string();
                debug!(peer = %peer, %reason, "dial failed");
                for reply in self.pending_dials.remove(&peer).unwrap_or_default() {
                    let _ = reply.send(Err(TransportError::Dial {
                        peer,
                        reason: reason.clone(),
                    }));
                }
            }
            SwarmEvent::ListenerClosed { addresses, reason, .. } => {
                let reason = reason.err().map(|e| e.to_string());
                warn!(addrs = ?addresses, ?reason, "listener closed");
                self.shared
                    .listen
                    .write()
                    .retain(|a| !addresses.contains(a));
            }
            SwarmEvent::Behaviour(OracleBehaviourEvent::Gossipsub(event)) => self.on_gossip(event),
            SwarmEvent::Behaviour(OracleBehaviourEvent::Identify(event)) => {
                self.on_identify(event)
            }
            _ => {}
        }
    }

    fn on_gossip(&mut self, event: gossipsub::Event) {
        match event {
            gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            } => {
                let topic = message.topic.into_string();
                let handler = self.shared.subscriptions.read().get(&topic).cloned();
                match handler {
                    Some(handler) => handler.handle_message(&PubSubMessage {
                        topic,
                        source: message.source.unwrap_or(propagation_source),
                        data: Bytes::from(message.data),
                    }),
                    None => trace!(topic = %topic, "message on a topic without handler"),
                }
            }
            gossipsub::Event::Subscribed { peer_id, topic } => {
                debug!(peer = %peer_id, topic = %topic, "peer subscribed");
            }
            _ => {}
        }
    }

    fn on_identify(&mut self, event: identify::Event) {
        match event {
            identify::Event::Received { peer_id, info, .. } => {
                let addrs: Vec<Multiaddr> = info
                    .listen_addrs
                    .into_iter()
                    .filter(|addr| !is_unspecified(addr))
                    .collect();
                for addr in &addrs {
                    self.swarm.add_peer_address(peer_id, addr.clone());
                }
                self.shared.remember_addrs(peer_id, &addrs);
                debug!(peer = %peer_id, addrs = addrs.len(), "identified peer");

                if self.shared.connected.read().contains(&peer_id) {
                    self.announce(peer_id, priority_address(&addrs));
                }
            }
            identify::Event::Error { peer_id, error, .. } => {
                debug!(peer = %peer_id, error = %error, "identify failed");
                if self.shared.connected.read().contains(&peer_id) {
                    self.announce(peer_id, None);
                }
            }
            _ => {}
        }
    }

    fn announce(&mut self, peer: PeerId, addr: Option<Multiaddr>) {
        if !self.announced.insert(peer) {
            return;
        }
        debug!(peer = %peer, addr = ?addr, "peer connected");
        let _ = self
            .shared
            .events
            .send(ConnectionEvent::Connected { peer, addr });
    }
}
