// tests/common/mod.rs
//
// In-process stand-in for an Icecast/SDRTrunk server, bound on 127.0.0.1:0.
#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use serde_json::json;

use sdrtrunk_proxy::config::ProxyConfig;
use sdrtrunk_proxy::instance::InstanceOptions;

#[derive(Clone, Default)]
pub struct Upstream {
    /// Live stream bodies the upstream is still producing.
    pub open_streams: Arc<AtomicUsize>,
    pub sessions: Arc<AtomicUsize>,
    pub last_icy: Arc<Mutex<Option<String>>>,
    pub last_accept: Arc<Mutex<Option<String>>>,
    pub status_fails: Arc<AtomicBool>,
    pub addr: Option<SocketAddr>,
}

impl Upstream {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr.expect("upstream bound"), path)
    }

    pub fn open(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Endless body; every chunk is filled with the session number.
async fn live(State(up): State<Upstream>, headers: HeaderMap) -> Response {
    *up.last_icy.lock().unwrap() = headers
        .get("icy-metadata")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *up.last_accept.lock().unwrap() = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let tag = (up.sessions.fetch_add(1, Ordering::SeqCst) + 1) as u8;
    up.open_streams.fetch_add(1, Ordering::SeqCst);
    let guard = LiveGuard(up.open_streams.clone());

    let stream = futures::stream::unfold(guard, move |g| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Some((Ok::<_, Infallible>(Bytes::from(vec![tag; 1024])), g))
    });
    (
        [(header::CONTENT_TYPE, "audio/aac")],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Two 100-byte chunks, then the body fails and the connection is cut.
async fn flaky(State(up): State<Upstream>) -> Response {
    up.open_streams.fetch_add(1, Ordering::SeqCst);
    let guard = LiveGuard(up.open_streams.clone());

    let stream = futures::stream::unfold((guard, 0u8), |(g, n)| async move {
        let item = match n {
            0 | 1 => Ok(Bytes::from(vec![b'a' + n; 100])),
            2 => Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "boom")),
            _ => return None,
        };
        Some((item, (g, n + 1)))
    });
    ([(header::CONTENT_TYPE, "audio/mpeg")], Body::from_stream(stream)).into_response()
}

async fn untyped() -> Response {
    let stream = futures::stream::iter(vec![Ok::<_, Infallible>(Bytes::from_static(b"ID3"))]);
    Response::new(Body::from_stream(stream))
}

async fn status_json(State(up): State<Upstream>) -> Response {
    if up.status_fails.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }
    // Icecast labels this as text/html.
    let body = json!({
        "icestats": {
            "source": [{ "title": "Unit 12 - Units 12,14,22", "genre": "Fire Dispatch", "server_name": "County" }]
        }
    });
    ([(header::CONTENT_TYPE, "text/html")], body.to_string()).into_response()
}

pub async fn spawn_upstream() -> Upstream {
    let mut up = Upstream::default();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    up.addr = Some(listener.local_addr().unwrap());

    let app = Router::new()
        .route("/stream", get(live))
        .route("/untyped", get(untyped))
        .route("/flaky", get(flaky))
        .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "Not Found") }))
        .route("/gone", get(|| async { StatusCode::GONE }))
        .route("/status-json.xsl", get(status_json))
        .route("/garbage", get(|| async { "<html>not json</html>" }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "{}"
            }),
        )
        .with_state(up.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    up
}

/// Serve `router` on an ephemeral port; returns the base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Options with a poll interval long enough that tests drive polls by hand.
pub fn test_options() -> InstanceOptions {
    let cfg = ProxyConfig {
        poll_interval_secs: 3600,
        metadata_timeout_secs: 2,
        ..ProxyConfig::default()
    };
    InstanceOptions::from_config(&cfg).unwrap()
}

/// Wait until `cond` holds, polling every 10ms for up to 5s.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
