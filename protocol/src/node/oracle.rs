//! # Oracle Node
//!
//! Wires the registry, the transport and the three node protocols together.
//!
//! ```text
//! discovery feed ──> discovery loop ──> connect + liveness stream
//! host connection events ──> NodeTracker::observe_* ──> change feed
//! change feed ──> dispatch loop ──> gossip publish
//!                                └─> full sync (on Joined)
//! inbound sync / gossip ──> NodeTracker::handle_node_data
//! ```
//!
//! Long-lived loops run on their own tasks and stop on the root
//! cancellation. Per-peer work runs on the [`TaskPool`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::discovery::{self, PeerEventReceiver, PeerEventSender};
use super::gossip::{self, GossipHandler};
use super::liveness;
use super::stats::{NodeStats, StatsSnapshot};
use super::sync::receive_node_data;
use super::tasks::{kind, TaskPool};
use crate::config::{self, NodeConfig};
use crate::error::ProtocolError;
use crate::network::{
    advertised_addrs, priority_address, stream_handler, ConnectionEvent, Host, PeerStream,
    PubSub,
};
use crate::registry::{NodeData, NodeDataReceiver, NodeTracker};

/// State shared by every loop and per-peer task of one node.
pub(crate) struct NodeContext {
    pub(crate) host: Arc<dyn Host>,
    pub(crate) pubsub: Arc<dyn PubSub>,
    pub(crate) tracker: Arc<NodeTracker>,
    pub(crate) stats: Arc<NodeStats>,
    pub(crate) pool: Arc<TaskPool>,
    pub(crate) config: NodeConfig,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl NodeContext {
    /// The address advertised in heartbeats and in the local record.
    pub(crate) fn local_address(&self) -> String {
        priority_address(&self.host.listen_addrs())
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Receivers consumed by [`OracleNode::start`].
struct Pending {
    peer_events: PeerEventReceiver,
    changes: NodeDataReceiver,
}

/// One participant of the oracle mesh.
pub struct OracleNode {
    ctx: Arc<NodeContext>,
    peer_events: PeerEventSender,
    pending: Mutex<Option<Pending>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl OracleNode {
    /// Creates a node over `host` and `pubsub`. Nothing runs until
    /// [`start`](Self::start). Setting `shutdown` to `true` (or dropping its
    /// sender) stops every loop and per-peer task.
    pub fn new(
        host: Arc<dyn Host>,
        pubsub: Arc<dyn PubSub>,
        config: NodeConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tracker, changes) = NodeTracker::new();
        let (peer_events, peer_event_rx) = discovery::peer_event_channel();
        let pool = TaskPool::new(config.max_peer_tasks, shutdown.clone());

        let ctx = NodeContext {
            host,
            pubsub,
            tracker: Arc::new(tracker),
            stats: Arc::new(NodeStats::default()),
            pool: Arc::new(pool),
            config,
            shutdown,
        };

        Self {
            ctx: Arc::new(ctx),
            peer_events,
            pending: Mutex::new(Some(Pending {
                peer_events: peer_event_rx,
                changes,
            })),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Registers the protocol handlers, records the local node and starts
    /// the long-lived loops.
    ///
    /// Fails if a handler or subscription cannot be registered; the node is
    /// then unusable and should be dropped.
    pub async fn start(&self) -> Result<(), ProtocolError> {
        let pending = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| ProtocolError::Setup("node already started".to_string()))?;

        let ctx = &self.ctx;
        // Subscribe before anything can connect so no event is missed.
        let connection_events = ctx.host.connection_events();

        self.register_handlers().map_err(|e| {
            error!(error = %e, "failed to register protocol handlers");
            e
        })?;

        ctx.tracker.record_local(self.local_record());

        let mut loops = self.loops.lock();
        loops.push(tokio::spawn(connection_loop(
            Arc::clone(ctx),
            connection_events,
        )));
        loops.push(tokio::spawn(gossip::dispatch_loop(
            Arc::clone(ctx),
            pending.changes,
        )));
        loops.push(tokio::spawn(discovery::discovery_loop(
            Arc::clone(ctx),
            pending.peer_events,
        )));

        info!(
            peer = %self.local_peer_id(),
            addr = %ctx.local_address(),
            publisher = self.is_publisher(),
            staked = ctx.config.is_staked,
            "oracle node started"
        );
        Ok(())
    }

    fn register_handlers(&self) -> Result<(), ProtocolError> {
        let ctx = &self.ctx;

        let stats = Arc::clone(&ctx.stats);
        let pool = Arc::clone(&ctx.pool);
        ctx.host.set_stream_handler(
            config::LIVENESS_PROTOCOL,
            stream_handler(move |stream: PeerStream| {
                let stats = Arc::clone(&stats);
                let pool = Arc::clone(&pool);
                async move {
                    pool.spawn(kind::LIVENESS_INBOUND, liveness::handle_inbound(stream, stats));
                }
            }),
        )?;

        let (tracker, stats, pool) = self.shared();
        ctx.host.set_stream_handler(
            config::NODE_DATA_SYNC_PROTOCOL,
            stream_handler(move |stream: PeerStream| {
                let (tracker, stats, pool) =
                    (Arc::clone(&tracker), Arc::clone(&stats), Arc::clone(&pool));
                async move {
                    pool.spawn(kind::SYNC_RECEIVE, async move {
                        receive_node_data(stream, &tracker, &stats).await;
                    });
                }
            }),
        )?;

        let (tracker, stats, pool) = self.shared();
        ctx.host.set_stream_handler(
            config::NODE_GOSSIP_TOPIC,
            stream_handler(move |stream: PeerStream| {
                let (tracker, stats, pool) =
                    (Arc::clone(&tracker), Arc::clone(&stats), Arc::clone(&pool));
                async move {
                    pool.spawn(kind::GOSSIP_RECEIVE, async move {
                        gossip::receive_gossip_stream(stream, &tracker, &stats).await;
                    });
                }
            }),
        )?;

        ctx.pubsub.subscribe(
            config::NODE_GOSSIP_TOPIC,
            Arc::new(GossipHandler::new(
                Arc::clone(&ctx.tracker),
                Arc::clone(&ctx.stats),
            )),
        )?;
        Ok(())
    }

    fn shared(&self) -> (Arc<NodeTracker>, Arc<NodeStats>, Arc<TaskPool>) {
        (
            Arc::clone(&self.ctx.tracker),
            Arc::clone(&self.ctx.stats),
            Arc::clone(&self.ctx.pool),
        )
    }

    fn local_record(&self) -> NodeData {
        let multiaddrs = advertised_addrs(self.ctx.host.listen_addrs());
        let mut data = NodeData::joined(self.local_peer_id(), multiaddrs, Utc::now());
        data.is_staked = self.ctx.config.is_staked;
        data
    }

    /// Waits for the long-lived loops to stop, then aborts whatever per-peer
    /// tasks are still running. Call after firing the root cancellation.
    pub async fn join(&self) {
        let loops = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "node loop ended abnormally");
            }
        }
        self.ctx.pool.shutdown().await;
        info!(peer = %self.local_peer_id(), "oracle node stopped");
    }

    /// Sender for discovery events.
    pub fn peer_events(&self) -> PeerEventSender {
        self.peer_events.clone()
    }

    /// Sends `data` to `peer` over a direct gossip stream.
    pub async fn push_node_data(&self, peer: PeerId, data: &NodeData) -> Result<(), ProtocolError> {
        gossip::push_node_data(self.ctx.host.as_ref(), peer, data).await
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.ctx.host.local_peer_id()
    }

    /// Best advertised address of this node.
    pub fn priority_address(&self) -> Option<Multiaddr> {
        priority_address(&self.ctx.host.listen_addrs())
    }

    pub fn tracker(&self) -> &Arc<NodeTracker> {
        &self.ctx.tracker
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.ctx.host.connected_peers()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.ctx.stats.snapshot();
        snapshot.tasks_rejected = self.ctx.pool.rejected();
        snapshot
    }

    pub fn outstanding_tasks(&self) -> usize {
        self.ctx.pool.outstanding()
    }

    pub fn outstanding_tasks_by_kind(&self) -> BTreeMap<&'static str, usize> {
        self.ctx.pool.outstanding_by_kind()
    }

    /// A node is a publisher when it carries a non-empty signature.
    pub fn is_publisher(&self) -> bool {
        self.ctx
            .config
            .signature
            .as_deref()
            .is_some_and(|s| !s.is_empty())
    }

    pub fn is_staked(&self) -> bool {
        self.ctx.config.is_staked
    }
}

/// Feeds host connection notifications into the registry.
async fn connection_loop(ctx: Arc<NodeContext>, mut events: broadcast::Receiver<ConnectionEvent>) {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ConnectionEvent::Connected { peer, addr }) => {
                    ctx.tracker.observe_connected(peer, addr.into_iter().collect());
                }
                Ok(ConnectionEvent::Disconnected { peer }) => {
                    ctx.tracker.observe_disconnected(peer);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "connection events lagged, registry may miss transitions");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("host connection events closed");
                    return;
                }
            },
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{MemoryHost, MemoryNetwork};
    use crate::registry::Activity;

    fn node(host: &MemoryHost, config: NodeConfig, shutdown: &watch::Receiver<bool>) -> OracleNode {
        OracleNode::new(
            Arc::new(host.clone()),
            Arc::new(host.clone()),
            config,
            shutdown.clone(),
        )
    }

    #[tokio::test]
    async fn start_records_local_node() {
        let net = MemoryNetwork::new();
        let host = net.add_host();
        let (_tx, rx) = watch::channel(false);
        let node = node(&host, NodeConfig::default().with_staked(true), &rx);

        node.start().await.unwrap();

        let local = node.tracker().get(&host.local_peer_id()).unwrap();
        assert_eq!(local.activity, Activity::Joined);
        assert!(local.is_staked);
        assert_eq!(local.multiaddrs, vec![host.addr()]);
    }

    #[tokio::test]
    async fn second_start_is_a_setup_error() {
        let net = MemoryNetwork::new();
        let host = net.add_host();
        let (_tx, rx) = watch::channel(false);
        let node = node(&host, NodeConfig::default(), &rx);

        node.start().await.unwrap();
        assert!(matches!(node.start().await, Err(ProtocolError::Setup(_))));
    }

    #[tokio::test]
    async fn handler_conflict_fails_start() {
        let net = MemoryNetwork::new();
        let host = net.add_host();
        host.set_stream_handler(
            config::NODE_DATA_SYNC_PROTOCOL,
            stream_handler(|_stream: PeerStream| async {}),
        )
        .unwrap();

        let (_tx, rx) = watch::channel(false);
        let node = node(&host, NodeConfig::default(), &rx);
        assert!(matches!(
            node.start().await,
            Err(ProtocolError::Transport(_))
        ));
    }

    #[test]
    fn publisher_requires_non_empty_signature() {
        let net = MemoryNetwork::new();
        let host = net.add_host();
        let (_tx, rx) = watch::channel(false);

        assert!(!node(&host, NodeConfig::default(), &rx).is_publisher());
        assert!(!node(&host, NodeConfig::default().with_signature(""), &rx).is_publisher());
        assert!(node(&host, NodeConfig::default().with_signature("0xabc"), &rx).is_publisher());
    }

    #[tokio::test]
    async fn join_returns_after_shutdown() {
        let net = MemoryNetwork::new();
        let host = net.add_host();
        let (tx, rx) = watch::channel(false);
        let node = node(&host, NodeConfig::default(), &rx);
        node.start().await.unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), node.join())
            .await
            .unwrap();
    }
}
