// src/api.rs
//! HTTP surface: per-instance stream relay, normalized metadata, sensor view
//! and poll diagnostics.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::instance::{InstanceHandle, Registry, API_PREFIX, LEGACY_PREFIX};
use crate::metadata::TalkerRecord;
use crate::sensor::TalkerSensor;

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unknown_instance(id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("unknown instance '{id}'"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

fn lookup(registry: &Registry, id: &str) -> Result<std::sync::Arc<InstanceHandle>, ApiError> {
    registry.get(id).ok_or_else(|| ApiError::unknown_instance(id))
}

pub fn create_router(registry: Registry) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route(&format!("{API_PREFIX}/instances"), get(list_instances))
        .route(&format!("{API_PREFIX}/{{id}}/stream"), get(stream))
        .route(&format!("{LEGACY_PREFIX}/{{id}}/stream"), get(stream))
        .route(&format!("{API_PREFIX}/{{id}}/metadata"), get(metadata))
        .route(&format!("{API_PREFIX}/{{id}}/sensor"), get(sensor))
        .route(&format!("{API_PREFIX}/{{id}}/status"), get(status))
        .layer(CorsLayer::very_permissive())
        .with_state(registry)
}

#[derive(Serialize)]
struct InstanceOut {
    id: String,
    name: String,
    stream_path: String,
    metadata_path: String,
    has_metadata: bool,
}

async fn list_instances(State(registry): State<Registry>) -> Json<Vec<InstanceOut>> {
    let out = registry
        .list()
        .into_iter()
        .map(|h| InstanceOut {
            id: h.id().to_string(),
            name: h.name().to_string(),
            stream_path: h.stream_path(),
            metadata_path: h.metadata_path(),
            has_metadata: !h.metadata_url().is_empty(),
        })
        .collect();
    Json(out)
}

/// GET .../{id}/stream — live relay of the upstream audio.
async fn stream(State(registry): State<Registry>, Path(id): Path<String>) -> Response {
    let relay = match lookup(&registry, &id) {
        Ok(h) => h.relay().clone(),
        Err(e) => return e.into_response(),
    };
    match relay.open().await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn metadata(
    State(registry): State<Registry>,
    Path(id): Path<String>,
) -> Result<Json<TalkerRecord>, ApiError> {
    let handle = lookup(&registry, &id)?;
    Ok(Json(handle.current()))
}

async fn sensor(
    State(registry): State<Registry>,
    Path(id): Path<String>,
) -> Result<Json<TalkerSensor>, ApiError> {
    let handle = lookup(&registry, &id)?;
    let snapshot = handle.snapshot();
    Ok(Json(TalkerSensor::from_snapshot(
        handle.id(),
        handle.name(),
        &snapshot,
    )))
}

#[derive(Serialize)]
struct RelayOut {
    active_sessions: usize,
    total_sessions: u64,
    bytes_relayed: u64,
}

#[derive(Serialize)]
struct StatusOut {
    id: String,
    name: String,
    polling: bool,
    talker: String,
    last_error: Option<String>,
    last_success_at: Option<DateTime<Utc>>,
    last_attempt_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    relay: RelayOut,
}

async fn status(
    State(registry): State<Registry>,
    Path(id): Path<String>,
) -> Result<Json<StatusOut>, ApiError> {
    let handle = lookup(&registry, &id)?;
    let snap = handle.snapshot();
    let stats = handle.relay_stats();
    Ok(Json(StatusOut {
        id: handle.id().to_string(),
        name: handle.name().to_string(),
        polling: handle.is_polling(),
        talker: snap
            .current
            .as_ref()
            .map(|r| r.talker.clone())
            .unwrap_or_else(|| TalkerRecord::idle().talker),
        last_error: snap
            .last_error
            .as_ref()
            .map(|e| format!("Unable to fetch metadata: {e}")),
        last_success_at: snap.last_success_at,
        last_attempt_at: snap.last_attempt_at,
        consecutive_failures: snap.consecutive_failures,
        relay: RelayOut {
            active_sessions: stats.active(),
            total_sessions: stats.total(),
            bytes_relayed: stats.bytes(),
        },
    }))
}
