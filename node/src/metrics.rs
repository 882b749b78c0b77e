//! # Prometheus Metrics
//!
//! Exposes the node's counters in Prometheus text format at `/metrics`.
//!
//! The protocol crate keeps its own lock-free counters; this module mirrors
//! them into a dedicated [`prometheus::Registry`] on every scrape, so the
//! protocol layer never depends on Prometheus. Scrapes may run concurrently;
//! the copy into the counters is serialized so a delta is applied once.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use parking_lot::Mutex;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use oracle_protocol::{OracleNode, StatsSnapshot};

use crate::api::AppState;

/// Holds all Prometheus metric handles for the node.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Held while counters are advanced.
    refresh_lock: Arc<Mutex<()>>,
    pub registry_records: IntGauge,
    pub registry_active_records: IntGauge,
    pub connected_peers: IntGauge,
    pub outstanding_peer_tasks: IntGauge,
    pub gossip_published_total: IntCounter,
    pub gossip_publish_failures_total: IntCounter,
    pub gossip_received_total: IntCounter,
    pub gossip_dropped_total: IntCounter,
    pub syncs_sent_total: IntCounter,
    pub sync_failures_total: IntCounter,
    pub sync_pages_sent_total: IntCounter,
    pub sync_pages_received_total: IntCounter,
    pub sync_records_received_total: IntCounter,
    pub sync_pages_malformed_total: IntCounter,
    pub dial_failures_total: IntCounter,
    pub liveness_streams_total: IntCounter,
    pub tasks_rejected_total: IntCounter,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Moves `counter` forward to `value`. Counters never go backwards. Not
/// atomic on its own; callers hold `refresh_lock`.
fn advance(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let r = Registry::new_custom(Some("oracle".into()), None)?;

        Ok(Self {
            registry_records: gauge(&r, "registry_records", "Records in the peer registry")?,
            registry_active_records: gauge(
                &r,
                "registry_active_records",
                "Registry records currently marked active",
            )?,
            connected_peers: gauge(&r, "connected_peers", "Peers with an open connection")?,
            outstanding_peer_tasks: gauge(
                &r,
                "outstanding_peer_tasks",
                "Per-peer stream tasks currently running",
            )?,
            gossip_published_total: counter(
                &r,
                "gossip_published_total",
                "Registry changes published on the gossip topic",
            )?,
            gossip_publish_failures_total: counter(
                &r,
                "gossip_publish_failures_total",
                "Gossip publishes that failed",
            )?,
            gossip_received_total: counter(
                &r,
                "gossip_received_total",
                "Gossip records received and merged",
            )?,
            gossip_dropped_total: counter(
                &r,
                "gossip_dropped_total",
                "Gossip payloads dropped as undecodable",
            )?,
            syncs_sent_total: counter(&r, "syncs_sent_total", "Full syncs sent to joined peers")?,
            sync_failures_total: counter(&r, "sync_failures_total", "Full syncs that failed")?,
            sync_pages_sent_total: counter(&r, "sync_pages_sent_total", "Full-sync pages sent")?,
            sync_pages_received_total: counter(
                &r,
                "sync_pages_received_total",
                "Full-sync pages received",
            )?,
            sync_records_received_total: counter(
                &r,
                "sync_records_received_total",
                "Records received through full sync",
            )?,
            sync_pages_malformed_total: counter(
                &r,
                "sync_pages_malformed_total",
                "Full-sync lines skipped as undecodable",
            )?,
            dial_failures_total: counter(
                &r,
                "dial_failures_total",
                "Failed connection attempts to discovered peers",
            )?,
            liveness_streams_total: counter(
                &r,
                "liveness_streams_total",
                "Liveness streams opened or accepted",
            )?,
            tasks_rejected_total: counter(
                &r,
                "tasks_rejected_total",
                "Per-peer tasks dropped because their kind was at its bound",
            )?,
            registry: r,
            refresh_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Copies the node's current counters into the Prometheus handles.
    pub fn refresh(&self, node: &OracleNode) {
        let tracker = node.tracker();
        self.registry_records.set(tracker.len() as i64);
        self.registry_active_records.set(tracker.active_count() as i64);
        self.connected_peers.set(node.connected_peers().len() as i64);
        self.outstanding_peer_tasks.set(node.outstanding_tasks() as i64);

        self.record(&node.stats());
    }

    /// Advances every counter to the values in `stats`.
    pub fn record(&self, stats: &StatsSnapshot) {
        let _guard = self.refresh_lock.lock();
        advance(&self.gossip_published_total, stats.gossip_published);
        advance(&self.gossip_publish_failures_total, stats.gossip_publish_failures);
        advance(&self.gossip_received_total, stats.gossip_received);
        advance(&self.gossip_dropped_total, stats.gossip_dropped);
        advance(&self.syncs_sent_total, stats.syncs_sent);
        advance(&self.sync_failures_total, stats.sync_failures);
        advance(&self.sync_pages_sent_total, stats.sync_pages_sent);
        advance(&self.sync_pages_received_total, stats.sync_pages_received);
        advance(&self.sync_records_received_total, stats.sync_records_received);
        advance(&self.sync_pages_malformed_total, stats.sync_pages_malformed);
        advance(&self.dial_failures_total, stats.dial_failures);
        advance(&self.liveness_streams_total, stats.liveness_streams);
        advance(&self.tasks_rejected_total, stats.tasks_rejected);
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.refresh(&state.node);
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
