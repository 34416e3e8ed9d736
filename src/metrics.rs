// src/metrics.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const ENV_METRICS_ENABLED: &str = "METRICS_ENABLED";

pub fn metrics_enabled() -> bool {
    std::env::var(ENV_METRICS_ENABLED).ok().as_deref() == Some("1")
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and describe the relay/poller series.
    /// Fails if a recorder is already installed, so descriptions run once.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;

        describe_gauge!(
            "relay_sessions_active",
            "Relay sessions currently holding an upstream connection."
        );
        describe_counter!("relay_sessions_total", "Relay sessions started.");
        describe_counter!("relay_bytes_total", "Audio bytes relayed downstream.");
        describe_counter!(
            "relay_upstream_failures_total",
            "Stream requests that failed before relaying (connect error or upstream status)."
        );
        describe_counter!("metadata_polls_total", "Metadata fetch attempts.");
        describe_counter!(
            "metadata_poll_failures_total",
            "Metadata fetches that failed (network, status, timeout, parse)."
        );
        describe_histogram!("metadata_poll_ms", "Metadata fetch time in milliseconds.");

        Ok(Self { handle })
    }

    /// `/metrics` in the Prometheus text exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || std::future::ready(handle.render())),
        )
    }
}
