//! End-to-end tests for the oracle protocol.
//!
//! Several `OracleNode`s run over one `MemoryNetwork` and are driven only
//! through their public surface: discovery events in, registry contents,
//! stream counters and stats out. Each test builds its own network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use libp2p::PeerId;
use tokio::sync::watch;

use oracle_protocol::config::{LIVENESS_PROTOCOL, NODE_DATA_SYNC_PROTOCOL, NODE_GOSSIP_TOPIC};
use oracle_protocol::network::{Host, MemoryHost, MemoryNetwork, MessageHandler, PubSub};
use oracle_protocol::node::PeerEvent;
use oracle_protocol::{Activity, NodeConfig, NodeData, OracleNode, TransportError};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

struct TestNode {
    host: MemoryHost,
    node: OracleNode,
}

impl TestNode {
    fn peer_id(&self) -> PeerId {
        self.host.local_peer_id()
    }

    async fn discover(&self, other: &MemoryHost) {
        self.node
            .peer_events()
            .send(PeerEvent::joined("test", other.addr_info()))
            .await
            .unwrap();
    }
}

async fn start_custom(
    net: &MemoryNetwork,
    shutdown: &watch::Receiver<bool>,
    config: NodeConfig,
    pubsub: Option<Arc<dyn PubSub>>,
) -> TestNode {
    let host = net.add_host();
    let pubsub = pubsub.unwrap_or_else(|| Arc::new(host.clone()));
    let node = OracleNode::new(Arc::new(host.clone()), pubsub, config, shutdown.clone());
    node.start().await.unwrap();
    TestNode { host, node }
}

async fn start_node(net: &MemoryNetwork, shutdown: &watch::Receiver<bool>) -> TestNode {
    start_custom(net, shutdown, NodeConfig::default(), None).await
}

/// A node whose pub/sub fabric reaches nobody, so only full sync moves data.
async fn start_node_without_gossip(
    net: &MemoryNetwork,
    shutdown: &watch::Receiver<bool>,
) -> TestNode {
    let isolated = MemoryNetwork::new().add_host();
    start_custom(net, shutdown, NodeConfig::default(), Some(Arc::new(isolated))).await
}

/// Pub/sub whose publishes all fail.
struct FailingPubSub;

#[async_trait]
impl PubSub for FailingPubSub {
    async fn publish(&self, _topic: &str, _data: Vec<u8>) -> Result<(), TransportError> {
        Err(TransportError::Publish("no peers subscribed".to_string()))
    }

    fn subscribe(
        &self,
        _topic: &str,
        _handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Pub/sub whose publishes never complete.
struct StalledPubSub;

#[async_trait]
impl PubSub for StalledPubSub {
    async fn publish(&self, _topic: &str, _data: Vec<u8>) -> Result<(), TransportError> {
        futures::future::pending().await
    }

    fn subscribe(
        &self,
        _topic: &str,
        _handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn seed(node: &OracleNode, n: usize) -> Vec<NodeData> {
    let now = Utc::now();
    (0..n)
        .map(|_| {
            let data = NodeData::joined(PeerId::random(), vec![], now);
            node.tracker().handle_node_data(data.clone());
            data
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Full sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_sync_alone_reconstructs_the_registry() {
    let net = MemoryNetwork::new();
    let (_tx, rx) = watch::channel(false);
    let a = start_node_without_gossip(&net, &rx).await;
    let b = start_node_without_gossip(&net, &rx).await;

    let seeded = seed(&a.node, 250);
    a.discover(&b.host).await;

    eventually("b to hold every seeded record", || {
        seeded
            .iter()
            .all(|r| b.node.tracker().get(&r.peer_id).as_ref() == Some(r))
    })
    .await;
    assert!(b.node.tracker().get(&a.peer_id()).is_some());
    assert_eq!(b.node.stats().gossip_received, 0);

    // 250 seeded + a + b, in pages of 100.
    eventually("b to count three pages from a", || {
        b.node.stats().sync_pages_received >= 3
    })
    .await;
    assert_eq!(b.node.stats().sync_pages_malformed, 0);
}

#[tokio::test]
async fn joined_event_triggers_exactly_one_sync() {
    let net = MemoryNetwork::new();
    let (_tx, rx) = watch::channel(false);
    let a = start_node(&net, &rx).await;
    let b = start_node(&net, &rx).await;

    a.discover(&b.host).await;
    a.discover(&b.host).await;

    eventually("both liveness streams", || {
        net.streams_opened(a.peer_id(), b.peer_id(), LIVENESS_PROTOCOL) == 2
    })
    .await;
    eventually("the sync to b", || a.node.stats().syncs_sent == 1).await;
    assert_eq!(
        net.streams_opened(a.peer_id(), b.peer_id(), NODE_DATA_SYNC_PROTOCOL),
        1
    );
}

#[tokio::test]
async fn left_event_triggers_no_sync() {
    let net = MemoryNetwork::new();
    let (_tx, rx) = watch::channel(false);
    let a = start_node(&net, &rx).await;
    let gone = start_node(&net, &rx).await;
    let marker = start_node(&net, &rx).await;

    let events = a.node.peer_events();
    events
        .send(PeerEvent::left("test", gone.host.addr_info()))
        .await
        .unwrap();
    // Events are handled in order; once the marker is connected the Left
    // has been processed.
    a.discover(&marker.host).await;
    eventually("the marker liveness stream", || {
        net.streams_opened(a.peer_id(), marker.peer_id(), LIVENESS_PROTOCOL) == 1
    })
    .await;

    assert_eq!(
        net.streams_opened(a.peer_id(), gone.peer_id(), NODE_DATA_SYNC_PROTOCOL),
        0
    );
    assert!(!a.node.connected_peers().contains(&gone.peer_id()));
}

// ---------------------------------------------------------------------------
// Gossip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn join_gossips_even_when_sync_fails() {
    let net = MemoryNetwork::new();
    let (_tx, rx) = watch::channel(false);
    let a = start_node(&net, &rx).await;
    let observer = start_node(&net, &rx).await;
    // Serves no protocols, so the full sync towards it is refused.
    let bare = net.add_host();

    a.discover(&bare).await;

    eventually("the failed sync", || a.node.stats().sync_failures == 1).await;
    eventually("the observer to hear about the bare host", || {
        observer
            .node
            .tracker()
            .get(&bare.local_peer_id())
            .is_some_and(|d| d.activity == Activity::Joined && d.is_active)
    })
    .await;
}

#[tokio::test]
async fn join_syncs_even_when_publish_fails() {
    let net = MemoryNetwork::new();
    let (_tx, rx) = watch::channel(false);
    let a = start_custom(&net, &rx, NodeConfig::default(), Some(Arc::new(FailingPubSub))).await;
    let b = start_node_without_gossip(&net, &rx).await;

    let seeded = seed(&a.node, 5);
    a.discover(&b.host).await;

    eventually("b to hold a's registry", || {
        seeded
            .iter()
            .all(|r| b.node.tracker().get(&r.peer_id).as_ref() == Some(r))
    })
    .await;
    eventually("the sync to b", || a.node.stats().syncs_sent == 1).await;
    eventually("the failed publishes to be counted", || {
        a.node.stats().gossip_publish_failures >= 1
    })
    .await;
    assert_eq!(a.node.stats().gossip_published, 0);
}

#[tokio::test]
async fn join_syncs_even_when_publish_hangs() {
    let net = MemoryNetwork::new();
    let (_tx, rx) = watch::channel(false);
    let a = start_custom(&net, &rx, NodeConfig::default(), Some(Arc::new(StalledPubSub))).await;
    let b = start_node_without_gossip(&net, &rx).await;
    let c = start_node_without_gossip(&net, &rx).await;

    a.discover(&b.host).await;
    eventually("the sync to b", || a.node.stats().syncs_sent == 1).await;
    // Publishes from the first join are still stuck; the next join must not
    // wait behind them.
    a.discover(&c.host).await;
    eventually("the sync to c", || a.node.stats().syncs_sent == 2).await;
    eventually("c to learn b through the sync", || {
        c.node.tracker().get(&b.peer_id()).is_some()
    })
    .await;

    assert!(a
        .node
        .outstanding_tasks_by_kind()
        .get("gossip-publish")
        .is_some_and(|n| *n >= 2));
}

#[tokio::test]
async fn bad_gossip_does_not_stop_processing() {
    let net = MemoryNetwork::new();
    let (_tx, rx) = watch::channel(false);
    let b = start_node(&net, &rx).await;
    let rogue = net.add_host();

    rogue
        .publish(NODE_GOSSIP_TOPIC, b"{\"peerId\": \"nope\"".to_vec())
        .await
        .unwrap();
    let good = NodeData::joined(PeerId::random(), vec![], Utc::now());
    rogue
        .publish(NODE_GOSSIP_TOPIC, serde_json::to_vec(&good).unwrap())
        .await
        .unwrap();

    assert_eq!(b.node.tracker().get(&good.peer_id), Some(good));
    assert_eq!(b.node.stats().gossip_dropped, 1);

    // The node keeps reacting to its own changes afterwards.
    let before = b.node.stats().gossip_published;
    let c = start_node(&net, &rx).await;
    b.discover(&c.host).await;
    eventually("b to gossip the new join", || {
        b.node.stats().gossip_published > before
    })
    .await;
}

#[tokio::test]
async fn stream_push_reaches_the_registry() {
    let net = MemoryNetwork::new();
    let (_tx, rx) = watch::channel(false);
    let a = start_node(&net, &rx).await;
    let b = start_node(&net, &rx).await;

    let record = NodeData::joined(PeerId::random(), vec![], Utc::now());
    a.node.push_node_data(b.peer_id(), &record).await.unwrap();

    eventually("b to merge the pushed record", || {
        b.node.tracker().get(&record.peer_id).as_ref() == Some(&record)
    })
    .await;
    assert_eq!(
        net.streams_opened(a.peer_id(), b.peer_id(), NODE_GOSSIP_TOPIC),
        1
    );
}

// ---------------------------------------------------------------------------
// Mesh behaviour
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chain_of_nodes_converges() {
    let net = MemoryNetwork::new();
    let (_tx, rx) = watch::channel(false);
    let mut nodes = Vec::new();
    for _ in 0..4 {
        nodes.push(start_node(&net, &rx).await);
    }
    for pair in nodes.windows(2) {
        pair[0].discover(&pair[1].host).await;
    }

    let ids: Vec<PeerId> = nodes.iter().map(TestNode::peer_id).collect();
    eventually("every registry to list every node", || {
        nodes.iter().all(|n| {
            ids.iter()
                .all(|id| n.node.tracker().get(id).is_some_and(|d| d.is_active))
        })
    })
    .await;
}

#[tokio::test]
async fn disconnect_is_gossiped_as_left() {
    let net = MemoryNetwork::new();
    let (_tx, rx) = watch::channel(false);
    let a = start_node(&net, &rx).await;
    let b = start_node(&net, &rx).await;
    let observer = start_node(&net, &rx).await;

    a.discover(&b.host).await;
    // Let every stream of the join settle so nothing re-links the pair.
    eventually("the join to settle", || {
        a.node.stats().syncs_sent == 1
            && b.node.stats().syncs_sent == 1
            && net.streams_opened(a.peer_id(), b.peer_id(), LIVENESS_PROTOCOL) == 1
    })
    .await;

    a.host.disconnect(b.peer_id());
    eventually("the observer to learn b left", || {
        observer
            .node
            .tracker()
            .get(&b.peer_id())
            .is_some_and(|d| d.activity == Activity::Left && !d.is_active)
    })
    .await;
}

#[tokio::test]
async fn saturated_liveness_does_not_block_join_sync() {
    let net = MemoryNetwork::new();
    let (_tx, rx) = watch::channel(false);
    let config = NodeConfig::default().with_max_peer_tasks(2);
    let a = start_custom(&net, &rx, config, None).await;
    let b = start_node(&net, &rx).await;
    let c = start_node(&net, &rx).await;
    let d = start_node(&net, &rx).await;

    a.discover(&b.host).await;
    a.discover(&c.host).await;
    eventually("a's liveness budget to fill", || {
        let kinds = a.node.outstanding_tasks_by_kind();
        kinds.get("liveness-writer") == Some(&2) && kinds.get("liveness-reader") == Some(&2)
    })
    .await;
    eventually("the syncs to b and c", || a.node.stats().syncs_sent == 2).await;

    a.discover(&d.host).await;

    eventually("the liveness writer for d to be refused", || {
        a.node.stats().tasks_rejected >= 1
    })
    .await;
    eventually("the sync to d", || {
        net.streams_opened(a.peer_id(), d.peer_id(), NODE_DATA_SYNC_PROTOCOL) == 1
    })
    .await;
    eventually("d to hold b and c", || {
        d.node.tracker().get(&b.peer_id()).is_some()
            && d.node.tracker().get(&c.peer_id()).is_some()
    })
    .await;
}

#[tokio::test]
async fn shutdown_reclaims_loops_and_stream_tasks() {
    let net = MemoryNetwork::new();
    let (tx, rx) = watch::channel(false);
    let a = start_node(&net, &rx).await;
    let b = start_node(&net, &rx).await;

    a.discover(&b.host).await;
    eventually("liveness tasks on both ends", || {
        a.node.outstanding_tasks() >= 2 && b.node.outstanding_tasks() >= 1
    })
    .await;

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        a.node.join().await;
        b.node.join().await;
    })
    .await
    .expect("nodes did not stop");
    assert_eq!(a.node.outstanding_tasks(), 0);
    assert_eq!(b.node.outstanding_tasks(), 0);
}
