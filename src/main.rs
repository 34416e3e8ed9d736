//! SDRTrunk proxy — binary entrypoint.
//! Boots the Axum HTTP server with one stream relay + metadata poller per
//! configured upstream.

use sdrtrunk_proxy::config;
use shuttle_axum::ShuttleAxum;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Compact logs by default, JSON when `LOG_FORMAT=json`.
/// A subscriber installed by the runtime takes precedence.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sdrtrunk_proxy=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let _ = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = config::load_default()?;
    if cfg.instances.is_empty() {
        warn!(
            "no instances configured; set {} or {}",
            config::ENV_CONFIG_PATH,
            config::ENV_STREAM_URL
        );
    }

    let (router, registry) = sdrtrunk_proxy::app(&cfg).await?;
    info!(instances = registry.len(), "sdrtrunk proxy ready");

    Ok(router.into())
}
