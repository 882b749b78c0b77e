//! # Status API
//!
//! Builds the axum router that exposes the node's HTTP interface. All
//! endpoints share application state through axum's `State` extractor and
//! are read-only views of the running [`OracleNode`].
//!
//! ## Endpoints
//!
//! | Method | Path               | Description                            |
//! |--------|--------------------|----------------------------------------|
//! | GET    | `/health`          | Health check                           |
//! | GET    | `/status`          | Node status summary                    |
//! | GET    | `/nodes`           | Every record in the peer registry      |
//! | GET    | `/nodes/:peer_id`  | One registry record                    |
//! | GET    | `/metrics`         | Prometheus metrics                     |

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use oracle_protocol::node::StatsSnapshot;
use oracle_protocol::{NodeData, OracleNode};

use crate::metrics::{metrics_handler, SharedMetrics};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The running node.
    pub node: Arc<OracleNode>,
    /// Prometheus handles, refreshed on scrape.
    pub metrics: SharedMetrics,
    /// The node's reported version string.
    pub version: String,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/nodes", get(nodes_handler))
        .route("/nodes/:peer_id", get(node_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub protocol_version: String,
    pub peer_id: String,
    /// Best advertised address, `"unknown"` when the host has none.
    pub address: String,
    /// Records in the registry.
    pub records: usize,
    /// Records currently marked active.
    pub active_records: usize,
    pub connected_peers: usize,
    /// Per-peer tasks still running.
    pub outstanding_tasks: usize,
    /// The same, by task kind.
    pub tasks: BTreeMap<String, usize>,
    pub is_publisher: bool,
    pub is_staked: bool,
    pub stats: StatsSnapshot,
    /// RFC 3339 timestamp of the response.
    pub timestamp: String,
}

/// Generic error body returned by REST endpoints on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let node = &state.node;
    let tracker = node.tracker();

    Json(StatusResponse {
        version: state.version.clone(),
        protocol_version: oracle_protocol::config::PROTOCOL_VERSION.to_string(),
        peer_id: node.local_peer_id().to_string(),
        address: node
            .priority_address()
            .map_or_else(|| "unknown".to_string(), |a| a.to_string()),
        records: tracker.len(),
        active_records: tracker.active_count(),
        connected_peers: node.connected_peers().len(),
        outstanding_tasks: node.outstanding_tasks(),
        tasks: node
            .outstanding_tasks_by_kind()
            .into_iter()
            .map(|(kind, n)| (kind.to_string(), n))
            .collect(),
        is_publisher: node.is_publisher(),
        is_staked: node.is_staked(),
        stats: node.stats(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// `GET /nodes` returns the registry ordered by peer id.
async fn nodes_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut records = state.node.tracker().get_all_node_data();
    records.sort_by_key(|d| d.peer_id.to_string());
    Json(records)
}

/// `GET /nodes/:peer_id`
async fn node_handler(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> axum::response::Response {
    let peer_id: PeerId = match peer_id.parse() {
        Ok(id) => id,
        Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid peer id: {e}")),
    };

    match state.node.tracker().get(&peer_id) {
        Some(data) => Json::<NodeData>(data).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("no record for {peer_id}")),
    }
}
