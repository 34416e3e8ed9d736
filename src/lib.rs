// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod instance;
pub mod metadata;
pub mod metrics;
pub mod relay;
pub mod sensor;

// ---- Re-exports for stable public API ----
pub use crate::api::create_router;
pub use crate::config::{InstanceConfig, ProxyConfig};
pub use crate::instance::{InstanceHandle, InstanceOptions, Registry};
pub use crate::metadata::{normalize, MetadataPoller, TalkerRecord};
pub use crate::relay::StreamRelay;

/// Load config, start every instance and build the full router (metrics
/// included when `METRICS_ENABLED=1`).
pub async fn app(cfg: &ProxyConfig) -> anyhow::Result<(axum::Router, Registry)> {
    let registry = Registry::start_all(cfg).await?;
    let mut router = api::create_router(registry.clone());
    if crate::metrics::metrics_enabled() {
        let m = crate::metrics::Metrics::init()?;
        router = router.merge(m.router());
    }
    Ok((router, registry))
}
