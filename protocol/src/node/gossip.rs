//! # Gossip Propagation
//!
//! Every change notification of the registry is published as one JSON
//! [`NodeData`] on the gossip topic. A `Joined` change additionally starts a
//! full sync towards the joined peer. The two run as independent pool tasks,
//! so a failing publish never holds back the sync or the other way round.
//!
//! Inbound gossip, from the topic or from a direct stream push, is decoded
//! and merged. Undecodable payloads are logged and dropped.

use std::sync::Arc;

use libp2p::PeerId;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace, warn};

use super::framing::{read_single_message, write_json_line};
use super::oracle::NodeContext;
use super::stats::{bump, NodeStats};
use super::sync::send_node_data;
use super::tasks::kind;
use crate::config;
use crate::error::ProtocolError;
use crate::network::{Host, MessageHandler, PeerStream, PubSub, PubSubMessage};
use crate::registry::{Activity, NodeData, NodeDataReceiver, NodeTracker};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Runs until the root cancellation fires, turning registry changes into
/// gossip publishes and join-triggered full syncs.
pub(crate) async fn dispatch_loop(ctx: Arc<NodeContext>, mut changes: NodeDataReceiver) {
    let mut shutdown = ctx.shutdown.clone();
    info!("gossip dispatch loop started");

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Some(data) => dispatch_change(&ctx, data),
                None => {
                    info!("registry change feed closed, gossip dispatch loop exiting");
                    return;
                }
            },
            _ = shutdown.changed() => {
                info!("gossip dispatch loop shutting down");
                return;
            }
        }
    }
}

/// Hands the change to the pool without waiting: a kind at its bound drops
/// the task instead of holding up later changes.
fn dispatch_change(ctx: &Arc<NodeContext>, data: NodeData) {
    trace!(peer = %data.peer_id, activity = %data.activity, "registry change");

    match data.activity {
        Activity::Joined => schedule_full_sync(ctx, data.peer_id),
        Activity::Left | Activity::Updated | Activity::Unknown => {}
    }

    let task_ctx = Arc::clone(ctx);
    ctx.pool.spawn(kind::GOSSIP_PUBLISH, async move {
        publish_node_data(task_ctx.pubsub.as_ref(), &task_ctx.stats, &data).await;
    });
}

fn schedule_full_sync(ctx: &Arc<NodeContext>, peer: PeerId) {
    if peer == ctx.host.local_peer_id() {
        return;
    }

    let task_ctx = Arc::clone(ctx);
    let admitted = ctx.pool.spawn(kind::SYNC_SEND, async move {
        let ctx = task_ctx;
        match send_node_data(
            ctx.host.as_ref(),
            &ctx.tracker,
            &ctx.stats,
            peer,
            ctx.config.page_size,
        )
        .await
        {
            Ok(_) => bump(&ctx.stats.syncs_sent),
            Err(e) => {
                bump(&ctx.stats.sync_failures);
                warn!(peer = %peer, error = %e, "full sync failed");
            }
        }
    });
    if !admitted {
        bump(&ctx.stats.sync_failures);
    }
}

/// Publishes one record on the gossip topic. Failures are logged and
/// counted; there is no retry.
pub async fn publish_node_data(pubsub: &dyn PubSub, stats: &NodeStats, data: &NodeData) {
    let payload = match serde_json::to_vec(data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(peer = %data.peer_id, error = %e, "failed to encode gossip record");
            bump(&stats.gossip_publish_failures);
            return;
        }
    };

    match pubsub.publish(config::NODE_GOSSIP_TOPIC, payload).await {
        Ok(()) => {
            bump(&stats.gossip_published);
            debug!(peer = %data.peer_id, activity = %data.activity, "gossip published");
        }
        Err(e) => {
            bump(&stats.gossip_publish_failures);
            warn!(peer = %data.peer_id, error = %e, "gossip publish failed");
        }
    }
}

/// Sends one record directly to `peer` on a dedicated stream, bypassing the
/// topic mesh.
pub async fn push_node_data(
    host: &dyn Host,
    peer: PeerId,
    data: &NodeData,
) -> Result<(), ProtocolError> {
    let mut stream = host.new_stream(peer, config::NODE_GOSSIP_TOPIC).await?;
    write_json_line(&mut stream, data).await?;
    stream.shutdown().await?;
    debug!(to = %peer, peer = %data.peer_id, "gossip pushed over stream");
    Ok(())
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Decodes one gossip payload and merges it. Returns `true` if the registry
/// changed.
pub fn apply_gossip(tracker: &NodeTracker, stats: &NodeStats, from: PeerId, payload: &[u8]) -> bool {
    match serde_json::from_slice::<NodeData>(payload) {
        Ok(data) => {
            bump(&stats.gossip_received);
            trace!(from = %from, peer = %data.peer_id, activity = %data.activity, "gossip received");
            tracker.handle_node_data(data)
        }
        Err(e) => {
            bump(&stats.gossip_dropped);
            warn!(
                from = %from,
                error = %e,
                raw = %String::from_utf8_lossy(payload),
                "dropping malformed gossip"
            );
            false
        }
    }
}

/// Topic subscriber feeding the registry.
pub struct GossipHandler {
    tracker: Arc<NodeTracker>,
    stats: Arc<NodeStats>,
}

impl GossipHandler {
    pub fn new(tracker: Arc<NodeTracker>, stats: Arc<NodeStats>) -> Self {
        Self { tracker, stats }
    }
}

impl MessageHandler for GossipHandler {
    fn handle_message(&self, message: &PubSubMessage) {
        apply_gossip(&self.tracker, &self.stats, message.source, &message.data);
    }
}

/// Handles a direct gossip stream: one record per stream lifetime.
pub async fn receive_gossip_stream(mut stream: PeerStream, tracker: &NodeTracker, stats: &NodeStats) {
    let from = stream.remote_peer();
    if let Some(payload) = read_single_message(&mut stream).await {
        apply_gossip(tracker, stats, from, &payload);
    }
}
