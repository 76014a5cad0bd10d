//! # Prometheus Metrics
//!
//! Operational metrics for the overlay daemon, scraped at `/metrics`.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] so they do not
//! collide with any default global registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (prometheus handles wrap `Arc` internally) so it can be
/// shared across request handlers and background tasks.
#[derive(Clone)]
pub struct NodeMetrics {
    /// Registry that owns all metrics below.
    registry: Registry,
    /// Number of currently connected peers, summed over transports.
    pub connected_peers: IntGauge,
    /// Total entries across all data stores, tombstones included.
    pub stored_entries: IntGauge,
    /// Confidential messages sent by this node since startup.
    pub confidential_sent_total: IntCounter,
    /// Confidential messages delivered to this node since startup.
    pub confidential_received_total: IntCounter,
    /// Transports that finished initialization.
    pub initialized_transports: IntGauge,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("veil".into()), None)
            .expect("failed to create prometheus registry");

        let connected_peers =
            IntGauge::new("connected_peers", "Number of currently connected peers")
                .expect("metric creation");
        registry
            .register(Box::new(connected_peers.clone()))
            .expect("metric registration");

        let stored_entries = IntGauge::new(
            "stored_entries",
            "Total entries across all data stores, tombstones included",
        )
        .expect("metric creation");
        registry
            .register(Box::new(stored_entries.clone()))
            .expect("metric registration");

        let confidential_sent_total = IntCounter::new(
            "confidential_sent_total",
            "Confidential messages sent since startup",
        )
        .expect("metric creation");
        registry
            .register(Box::new(confidential_sent_total.clone()))
            .expect("metric registration");

        let confidential_received_total = IntCounter::new(
            "confidential_received_total",
            "Confidential messages received since startup",
        )
        .expect("metric creation");
        registry
            .register(Box::new(confidential_received_total.clone()))
            .expect("metric registration");

        let initialized_transports = IntGauge::new(
            "initialized_transports",
            "Transports that finished initialization",
        )
        .expect("metric creation");
        registry
            .register(Box::new(initialized_transports.clone()))
            .expect("metric registration");

        Self {
            registry,
            connected_peers,
            stored_entries,
            confidential_sent_total,
            confidential_received_total,
            initialized_transports,
        }
    }

    /// Encode all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler rendering `/metrics`.
pub async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<crate::api::AppState>,
) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_encode_without_error() {
        let metrics = NodeMetrics::new();
        metrics.connected_peers.set(3);
        metrics.stored_entries.set(42);
        metrics.confidential_sent_total.inc();

        let body = metrics.encode().unwrap();
        assert!(body.contains("veil_connected_peers 3"));
        assert!(body.contains("veil_stored_entries 42"));
        assert!(body.contains("veil_confidential_sent_total 1"));
    }
}
