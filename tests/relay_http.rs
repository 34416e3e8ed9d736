// tests/relay_http.rs
//
// Stream relay against a live in-process upstream.
//
// Covered:
// - upstream error status/body passthrough (oneshot, no relay socket)
// - 502 on connect failure
// - headers: Cache-Control, Content-Type forwarding + default, Icy-MetaData off
// - upstream connection released when the downstream client disconnects
// - upstream failing mid-copy ends the downstream body cleanly
// - concurrent sessions are independent
// - removing an instance leaves running sessions alone

mod common;

use std::time::Duration;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
};
use tower::ServiceExt as _; // for `oneshot`

use sdrtrunk_proxy::{create_router, InstanceConfig, Registry};

use common::{eventually, serve, spawn_upstream, test_options};

const BODY_LIMIT: usize = 1024 * 1024;

async fn registry_with(name: &str, stream_url: &str) -> Registry {
    let registry = Registry::new();
    registry
        .insert(&InstanceConfig::new(name, stream_url, ""), &test_options())
        .await
        .expect("insert instance");
    registry
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_404_is_forwarded_verbatim() {
    let up = spawn_upstream().await;
    let app = create_router(registry_with("Scanner", &up.url("/missing")).await);

    let req = Request::builder()
        .uri("/api/sdrtrunk_proxy/scanner/stream")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(&bytes[..], b"Not Found");
    assert_eq!(up.open(), 0, "no byte copy should have started");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_error_body_gets_synthesized_message() {
    let up = spawn_upstream().await;
    let app = create_router(registry_with("Scanner", &up.url("/gone")).await);

    let req = Request::builder()
        .uri("/sdrtrunk_proxy/scanner/stream")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::GONE);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(&bytes[..], b"Upstream stream returned HTTP 410");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_upstream_is_502() {
    let app = create_router(registry_with("Scanner", "http://127.0.0.1:1/stream").await);

    let req = Request::builder()
        .uri("/api/sdrtrunk_proxy/scanner/stream")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(
        text.starts_with("Failed to connect to upstream stream:"),
        "body: {text}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_instance_is_404_json() {
    let app = create_router(Registry::new());
    let req = Request::builder()
        .uri("/api/sdrtrunk_proxy/nope/stream")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert!(v["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_stream_headers_and_bytes() {
    let up = spawn_upstream().await;
    let registry = registry_with("Scanner", &up.url("/stream")).await;
    let base = serve(create_router(registry.clone())).await;

    let mut resp = reqwest::get(format!("{base}/api/sdrtrunk_proxy/scanner/stream"))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.headers()["cache-control"], "no-store");
    assert_eq!(resp.headers()["content-type"], "audio/aac");

    let chunk = resp.chunk().await.unwrap().expect("first chunk");
    assert!(!chunk.is_empty());
    assert!(chunk.iter().all(|b| *b == 1));

    assert_eq!(up.last_icy.lock().unwrap().as_deref(), Some("0"));
    assert_eq!(up.last_accept.lock().unwrap().as_deref(), Some("*/*"));
    assert_eq!(registry.get("scanner").unwrap().relay_stats().active(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_content_type_defaults_to_audio_mpeg() {
    let up = spawn_upstream().await;
    let base = serve(create_router(
        registry_with("Scanner", &up.url("/untyped")).await,
    ))
    .await;

    let resp = reqwest::get(format!("{base}/api/sdrtrunk_proxy/scanner/stream"))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "audio/mpeg");
    assert_eq!(&resp.bytes().await.unwrap()[..], b"ID3");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn downstream_disconnect_releases_upstream() {
    let up = spawn_upstream().await;
    let registry = registry_with("Scanner", &up.url("/stream")).await;
    let stats = registry.get("scanner").unwrap().relay_stats();
    let base = serve(create_router(registry.clone())).await;

    let mut resp = reqwest::get(format!("{base}/api/sdrtrunk_proxy/scanner/stream"))
        .await
        .unwrap();
    resp.chunk().await.unwrap().expect("first chunk");
    assert_eq!(up.open(), 1);
    assert_eq!(stats.active(), 1);

    drop(resp);

    assert!(
        eventually(|| stats.active() == 0).await,
        "relay session still active"
    );
    assert!(
        eventually(|| up.open() == 0).await,
        "upstream connection still open"
    );
    assert_eq!(stats.total(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_failure_mid_copy_ends_body_cleanly() {
    let up = spawn_upstream().await;
    let registry = registry_with("Scanner", &up.url("/flaky")).await;
    let stats = registry.get("scanner").unwrap().relay_stats();
    let base = serve(create_router(registry.clone())).await;

    let resp = reqwest::get(format!("{base}/api/sdrtrunk_proxy/scanner/stream"))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    // Relayed bytes arrive, then a normal end of body rather than an error.
    let body = tokio::time::timeout(Duration::from_secs(5), resp.bytes())
        .await
        .expect("body never ended")
        .expect("downstream body should end without error");
    assert_eq!(body.len(), 200);
    assert!(body[..100].iter().all(|b| *b == b'a'));
    assert!(body[100..].iter().all(|b| *b == b'b'));

    assert!(
        eventually(|| stats.active() == 0).await,
        "relay session still active"
    );
    assert!(
        eventually(|| up.open() == 0).await,
        "upstream connection still open"
    );
    assert_eq!(stats.total(), 1);
    assert_eq!(stats.bytes(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_are_independent() {
    let up = spawn_upstream().await;
    let registry = registry_with("Scanner", &up.url("/stream")).await;
    let stats = registry.get("scanner").unwrap().relay_stats();
    let base = serve(create_router(registry)).await;
    let url = format!("{base}/api/sdrtrunk_proxy/scanner/stream");

    let mut a = reqwest::get(&url).await.unwrap();
    let first_a = a.chunk().await.unwrap().unwrap();
    let mut b = reqwest::get(&url).await.unwrap();
    let first_b = b.chunk().await.unwrap().unwrap();

    assert_ne!(first_a[0], first_b[0], "each client gets its own upstream");
    assert!(eventually(|| up.open() == 2).await);

    drop(a);
    assert!(eventually(|| up.open() == 1).await);
    assert!(eventually(|| stats.active() == 1).await);

    // b keeps flowing after a is gone
    for _ in 0..5 {
        let chunk = tokio::time::timeout(Duration::from_secs(2), b.chunk())
            .await
            .expect("b stalled")
            .unwrap()
            .expect("b ended");
        assert!(chunk.iter().all(|x| *x == first_b[0]));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removing_instance_keeps_running_sessions() {
    let up = spawn_upstream().await;
    let registry = registry_with("Scanner", &up.url("/stream")).await;
    let base = serve(create_router(registry.clone())).await;
    let url = format!("{base}/api/sdrtrunk_proxy/scanner/stream");

    let mut resp = reqwest::get(&url).await.unwrap();
    resp.chunk().await.unwrap().unwrap();

    let removed = registry.remove("scanner").expect("was registered");
    assert!(!removed.is_polling());

    for _ in 0..3 {
        let chunk = tokio::time::timeout(Duration::from_secs(2), resp.chunk())
            .await
            .expect("stream stalled")
            .unwrap();
        assert!(chunk.is_some());
    }

    // New requests no longer find the instance
    let again = reqwest::get(&url).await.unwrap();
    assert_eq!(again.status(), reqwest::StatusCode::NOT_FOUND);
}
