// src/relay.rs
//! Live byte relay from an upstream audio origin (Icecast/SDRTrunk) to one
//! downstream client per session.
//!
//! Every request opens its own upstream connection; the body is copied in
//! bounded chunks and never buffered whole. Either side going away ends the
//! session quietly and releases both connections.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream, StreamExt};
use metrics::{counter, gauge};
use tracing::{debug, warn};

/// Reference copy granularity for the live stream.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
/// Used when the upstream does not declare a content type.
pub const DEFAULT_CONTENT_TYPE: &str = "audio/mpeg";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on how much of an upstream error body is forwarded.
const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// HTTP client for stream legs: bounded connect, no overall timeout.
pub fn stream_client(connect_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
}

/// Failures that happen before any audio byte is sent downstream.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to connect to upstream stream: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("Upstream stream returned HTTP {}", .status.as_u16())]
    Upstream {
        status: StatusCode,
        content_type: Option<HeaderValue>,
        body: Bytes,
    },
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match self {
            RelayError::Unreachable(_) => {
                (StatusCode::BAD_GATEWAY, self.to_string()).into_response()
            }
            RelayError::Upstream {
                status,
                content_type,
                body,
            } => {
                if body.is_empty() {
                    let text = format!("Upstream stream returned HTTP {}", status.as_u16());
                    return (status, text).into_response();
                }
                let content_type = content_type
                    .unwrap_or_else(|| HeaderValue::from_static("text/plain; charset=utf-8"));
                (status, [(CONTENT_TYPE, content_type)], body).into_response()
            }
        }
    }
}

/// How a copy loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Upstream signalled end of data.
    Eof,
    /// Upstream connection reset or read failure.
    UpstreamIo,
    /// Upstream sent something the client could not decode.
    UpstreamProtocol,
    /// Downstream client dropped the response body.
    DownstreamGone,
}

impl StreamEnd {
    fn classify(e: &reqwest::Error) -> Self {
        if e.is_decode() {
            StreamEnd::UpstreamProtocol
        } else {
            StreamEnd::UpstreamIo
        }
    }

    /// Normal for a live stream; not worth more than a debug line.
    pub fn is_expected(self) -> bool {
        !matches!(self, StreamEnd::UpstreamProtocol)
    }
}

/// Per-instance session bookkeeping.
#[derive(Debug, Default)]
pub struct RelayStats {
    active: AtomicUsize,
    total: AtomicU64,
    bytes: AtomicU64,
}

impl RelayStats {
    /// Sessions currently holding an upstream connection.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Lives exactly as long as the session's upstream connection.
struct SessionGuard {
    instance: String,
    id: u64,
    stats: Arc<RelayStats>,
    end: Option<StreamEnd>,
    sent: u64,
}

impl SessionGuard {
    fn open(instance: &str, stats: Arc<RelayStats>) -> Self {
        let id = stats.total.fetch_add(1, Ordering::SeqCst) + 1;
        stats.active.fetch_add(1, Ordering::SeqCst);
        counter!("relay_sessions_total").increment(1);
        gauge!("relay_sessions_active").increment(1.0);
        debug!(target: "relay", instance, session = id, "relay session started");
        Self {
            instance: instance.to_string(),
            id,
            stats,
            end: None,
            sent: 0,
        }
    }

    fn record(&mut self, n: usize) {
        self.sent += n as u64;
        self.stats.bytes.fetch_add(n as u64, Ordering::Relaxed);
        counter!("relay_bytes_total").increment(n as u64);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        gauge!("relay_sessions_active").decrement(1.0);

        let end = self.end.unwrap_or(StreamEnd::DownstreamGone);
        if end.is_expected() {
            debug!(
                target: "relay",
                instance = %self.instance,
                session = self.id,
                bytes = self.sent,
                end = ?end,
                "relay session closed"
            );
        } else {
            warn!(
                target: "relay",
                instance = %self.instance,
                session = self.id,
                bytes = self.sent,
                end = ?end,
                "relay session aborted by upstream"
            );
        }
    }
}

/// One downstream client bound to one upstream connection.
struct RelaySession {
    upstream: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    pending: Bytes,
    chunk_size: usize,
    guard: SessionGuard,
}

impl RelaySession {
    async fn next_chunk(&mut self) -> Option<Bytes> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(self.chunk_size);
                self.guard.record(n);
                return Some(self.pending.split_to(n));
            }
            let upstream = self.upstream.as_mut()?;
            match upstream.next().await {
                Some(Ok(bytes)) => self.pending = bytes,
                Some(Err(e)) => {
                    debug!(target: "relay", session = self.guard.id, error = %e, "upstream read failed");
                    self.finish(StreamEnd::classify(&e));
                    return None;
                }
                None => {
                    self.finish(StreamEnd::Eof);
                    return None;
                }
            }
        }
    }

    /// Drops the upstream connection right away, before the body is polled again.
    fn finish(&mut self, end: StreamEnd) {
        self.upstream = None;
        self.guard.end = Some(end);
    }

    fn into_stream(self) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        futures::stream::unfold(self, |mut session| async move {
            let chunk = session.next_chunk().await?;
            Some((Ok(chunk), session))
        })
    }
}

async fn read_bounded(mut resp: reqwest::Response, limit: usize) -> Bytes {
    let mut buf = BytesMut::new();
    while buf.len() < limit {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    buf.freeze()
}

/// Relay for one configured upstream stream URL. Cheap to clone; holds no
/// per-session state.
#[derive(Clone)]
pub struct StreamRelay {
    instance: String,
    stream_url: String,
    client: reqwest::Client,
    chunk_size: usize,
    default_content_type: Option<HeaderValue>,
    stats: Arc<RelayStats>,
}

impl StreamRelay {
    pub fn new(
        instance: impl Into<String>,
        stream_url: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            instance: instance.into(),
            stream_url: stream_url.into(),
            client,
            chunk_size: DEFAULT_CHUNK_SIZE,
            default_content_type: Some(HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// `None` (or an invalid header value) leaves Content-Type unset when the
    /// upstream omits it.
    pub fn with_default_content_type(mut self, content_type: Option<&str>) -> Self {
        self.default_content_type = content_type.and_then(|ct| HeaderValue::from_str(ct).ok());
        self
    }

    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Connect upstream and build the downstream response.
    ///
    /// Connect failures become 502, upstream statuses >= 400 are forwarded
    /// with their (bounded) body. Nothing is retried.
    pub async fn open(&self) -> Result<Response, RelayError> {
        let upstream = self
            .client
            .get(&self.stream_url)
            .header("Icy-MetaData", "0")
            .header(ACCEPT, "*/*")
            .send()
            .await
            .map_err(|e| {
                counter!("relay_upstream_failures_total").increment(1);
                warn!(target: "relay", instance = %self.instance, error = %e, "upstream stream unreachable");
                RelayError::Unreachable(e)
            })?;

        let status = upstream.status();
        if status.as_u16() >= 400 {
            counter!("relay_upstream_failures_total").increment(1);
            warn!(target: "relay", instance = %self.instance, status = %status, "upstream stream returned error");
            let content_type = upstream.headers().get(CONTENT_TYPE).cloned();
            let body = read_bounded(upstream, ERROR_BODY_LIMIT).await;
            return Err(RelayError::Upstream {
                status,
                content_type,
                body,
            });
        }

        let content_type = upstream
            .headers()
            .get(CONTENT_TYPE)
            .cloned()
            .or_else(|| self.default_content_type.clone());

        let session = RelaySession {
            upstream: Some(upstream.bytes_stream().boxed()),
            pending: Bytes::new(),
            chunk_size: self.chunk_size,
            guard: SessionGuard::open(&self.instance, Arc::clone(&self.stats)),
        };

        let mut resp = Response::new(Body::from_stream(session.into_stream()));
        *resp.status_mut() = StatusCode::OK;
        let headers = resp.headers_mut();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if let Some(ct) = content_type {
            headers.insert(CONTENT_TYPE, ct);
        }
        Ok(resp)
    }
}
