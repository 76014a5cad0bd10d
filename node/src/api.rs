//! # Status API
//!
//! The operator-facing HTTP surface of the daemon: a JSON status document
//! at `/status` and Prometheus metrics at `/metrics`. Deliberately small;
//! the overlay's real interface is the protocol, not HTTP.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use veil_protocol::data_service::DataService;
use veil_protocol::service_nodes::ServiceNodesByTransport;

use crate::metrics::{metrics_handler, SharedMetrics};

/// Application state shared across request handlers.
#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<ServiceNodesByTransport>,
    pub data_service: Arc<DataService>,
    pub metrics: SharedMetrics,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Per-transport status line in the `/status` document.
#[derive(Serialize)]
struct TransportStatus {
    state: String,
    address: Option<String>,
    connections: usize,
}

/// The `/status` response body.
#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: i64,
    identity: String,
    transports: BTreeMap<String, TransportStatus>,
    stored_entries: usize,
}

/// Build the axum router for the status API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut transports = BTreeMap::new();
    for transport_type in state.facade.transports() {
        let Some(service_node) = state.facade.service_node(transport_type) else {
            continue;
        };
        let (address, connections) = match service_node.default_node() {
            Some(node) => (
                node.my_address().map(|a| a.to_full()),
                node.connection_count(),
            ),
            None => (None, 0),
        };
        transports.insert(
            transport_type.to_string(),
            TransportStatus {
                state: format!("{:?}", service_node.state()),
                address,
                connections,
            },
        );
    }

    let identity = state.facade.default_network_id();
    Json(StatusResponse {
        version: veil_protocol::config::VERSION.to_string(),
        uptime_seconds: (chrono::Utc::now() - state.started_at).num_seconds(),
        identity: identity.pub_key.to_hex(),
        transports,
        stored_entries: state.data_service.storage().total_entries(),
    })
}
