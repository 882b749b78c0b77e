//! # Discovery Reaction
//!
//! Peer discovery (mDNS, DHT walks, static bootstrap lists) is external; it
//! hands the node [`PeerEvent`]s through a channel. The node reacts to one
//! event at a time:
//!
//! - `Joined`: connect, then open a liveness stream. A failed connect is
//!   logged and the loop moves on. There is no retry.
//! - `Left`: logged only. Departures reach the registry through the host's
//!   connection notifications, not through discovery.
//!
//! Events are not deduplicated here. A second `Joined` for a connected peer
//! opens another liveness stream but produces no second registry join.

use std::fmt;
use std::sync::Arc;

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::liveness;
use super::oracle::NodeContext;
use super::stats::bump;
use super::tasks::until_shutdown;
use crate::config;
use crate::network::{addr_infos, AddrInfo};

/// What discovery observed about a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerAction {
    Joined,
    Left,
}

impl fmt::Display for PeerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joined => f.write_str("joined"),
            Self::Left => f.write_str("left"),
        }
    }
}

/// One discovery observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    /// Name of the discovery mechanism that produced the event.
    pub source: String,
    pub action: PeerAction,
    pub addr: AddrInfo,
}

impl PeerEvent {
    pub fn joined(source: impl Into<String>, addr: AddrInfo) -> Self {
        Self {
            source: source.into(),
            action: PeerAction::Joined,
            addr,
        }
    }

    pub fn left(source: impl Into<String>, addr: AddrInfo) -> Self {
        Self {
            source: source.into(),
            action: PeerAction::Left,
            addr,
        }
    }
}

/// Sending half of the discovery feed.
pub type PeerEventSender = mpsc::Sender<PeerEvent>;

/// Receiving half of the discovery feed.
pub type PeerEventReceiver = mpsc::Receiver<PeerEvent>;

/// Creates the bounded channel discovery mechanisms feed events into.
pub fn peer_event_channel() -> (PeerEventSender, PeerEventReceiver) {
    mpsc::channel(config::PEER_EVENT_CHANNEL_CAPACITY)
}

/// Source name of events produced from the static bootstrap list.
pub const BOOTSTRAP_SOURCE: &str = "bootstrap";

/// Turns `/p2p/`-suffixed bootstrap addresses into `Joined` events, one
/// per peer. Addresses without a peer id are skipped.
pub fn bootstrap_events(addrs: &[Multiaddr]) -> Vec<PeerEvent> {
    addr_infos(addrs)
        .into_iter()
        .map(|info| PeerEvent::joined(BOOTSTRAP_SOURCE, info))
        .collect()
}

/// Consumes discovery events until the feed closes or the root
/// cancellation fires.
pub(crate) async fn discovery_loop(ctx: Arc<NodeContext>, mut events: PeerEventReceiver) {
    let mut shutdown = ctx.shutdown.clone();
    info!("discovery loop started");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if until_shutdown(ctx.shutdown.clone(), handle_peer_event(&ctx, event))
                        .await
                        .is_none()
                    {
                        info!("discovery loop shutting down");
                        return;
                    }
                }
                None => {
                    info!("discovery feed closed, discovery loop exiting");
                    return;
                }
            },
            _ = shutdown.changed() => {
                info!("discovery loop shutting down");
                return;
            }
        }
    }
}

async fn handle_peer_event(ctx: &Arc<NodeContext>, event: PeerEvent) {
    let peer = event.addr.peer_id;
    info!(peer = %peer, action = %event.action, source = %event.source, "peer event");

    match event.action {
        PeerAction::Left => {
            debug!(peer = %peer, "discovery reported departure, nothing to dial");
        }
        PeerAction::Joined => {
            if peer == ctx.host.local_peer_id() {
                debug!("discovery reported the local node, ignoring");
                return;
            }

            if let Err(e) = ctx.host.connect(&event.addr).await {
                bump(&ctx.stats.dial_failures);
                warn!(peer = %peer, addr = %event.addr, error = %e, "connection failed");
                return;
            }
            info!(peer = %peer, addr = %event.addr, "connected to peer");

            match ctx
                .host
                .new_stream(peer, config::LIVENESS_PROTOCOL)
                .await
            {
                Ok(stream) => liveness::start(ctx, stream, &event.source),
                Err(e) => warn!(peer = %peer, error = %e, "failed to open liveness stream"),
            }
        }
    }
}
