//! Failure injection tests for the reverse proxy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;

use hotswap_proxy::config::ProxyConfig;
use hotswap_proxy::middleware::Registry;
use hotswap_proxy::store::{
    ConfigStore, Endpoint, Host, Listener, Location, LocationOptions, MemoryStore, Protocol, Upstream,
};

mod common;

/// Store with host `localhost` on `listen`, location `/` → `up1`, and the
/// given endpoints in `up1`.
fn topology(listen: SocketAddr, endpoints: &[(&str, SocketAddr)]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new(Registry::global()));
    store.add_upstream(Upstream::new("up1")).unwrap();
    for (id, addr) in endpoints {
        store
            .add_endpoint(Endpoint::new("up1", *id, format!("http://{}", addr)))
            .unwrap();
    }
    let mut host = Host::new("localhost");
    host.listeners
        .push(Listener::new("l1", Protocol::Http, listen.to_string()));
    store.add_host(host).unwrap();
    store.add_location(Location::new("localhost", "la", "/", "up1")).unwrap();
    store
}

fn counting_backend(count: Arc<AtomicU32>, status: u16, body: &'static str) -> impl Fn(String) -> std::future::Ready<(u16, String)> {
    move |_| {
        count.fetch_add(1, Ordering::SeqCst);
        std::future::ready((status, body.to_string()))
    }
}

#[tokio::test]
async fn test_retry_on_different_endpoint() {
    // e1 refuses connections, e2 answers.
    let dead = common::free_addr();
    let e2 = common::start_mock_backend("e2").await;
    let listen = common::free_addr();

    let mut config = ProxyConfig::default();
    config.retries.max_attempts = 2;
    let store = topology(listen, &[("e1", dead), ("e2", e2)]);
    let proxy = common::TestProxy::start(store, config).await;
    let client = common::client();

    // Whichever endpoint round-robin starts with, every request lands on e2.
    for _ in 0..4 {
        let res = client
            .get(format!("http://localhost:{}/", listen.port()))
            .send()
            .await
            .expect("Proxy unreachable");
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.text().await.unwrap(), "e2");
    }

    proxy.stop().await;
}

#[tokio::test]
async fn test_no_retry_with_request_body() {
    let dead = common::free_addr();
    let listen = common::free_addr();

    let store = topology(listen, &[("e1", dead)]);
    let proxy = common::TestProxy::start(store, ProxyConfig::default()).await;

    let res = common::client()
        .post(format!("http://localhost:{}/", listen.port()))
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(res.headers()["x-proxy-error"], "upstream-call-failure");

    proxy.stop().await;
}

#[tokio::test]
async fn test_no_available_backend() {
    let listen = common::free_addr();
    let store = topology(listen, &[]);
    let proxy = common::TestProxy::start(store, ProxyConfig::default()).await;

    let res = common::client()
        .get(format!("http://localhost:{}/", listen.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(res.headers()["x-proxy-error"], "no-available-backend");

    proxy.stop().await;
}

#[tokio::test]
async fn test_failing_endpoint_is_ejected() {
    let e1_calls = Arc::new(AtomicU32::new(0));
    let e2_calls = Arc::new(AtomicU32::new(0));
    let e1 = common::start_programmable_backend(counting_backend(Arc::clone(&e1_calls), 503, "down")).await;
    let e2 = common::start_programmable_backend(counting_backend(Arc::clone(&e2_calls), 200, "e2")).await;
    let listen = common::free_addr();

    let mut config = ProxyConfig::default();
    config.health.failure_threshold = 3;
    config.health.base_backoff_ms = 60_000;
    config.health.max_backoff_ms = 60_000;
    let store = topology(listen, &[("e1", e1), ("e2", e2)]);
    let proxy = common::TestProxy::start(store, config).await;
    let client = common::client();

    for _ in 0..12 {
        client
            .get(format!("http://localhost:{}/", listen.port()))
            .send()
            .await
            .unwrap();
    }

    // Strict alternation until e1's third consecutive failure, e2 only after.
    assert_eq!(e1_calls.load(Ordering::SeqCst), 3);
    assert_eq!(e2_calls.load(Ordering::SeqCst), 9);

    proxy.stop().await;
}

#[tokio::test]
async fn test_backend_status_passes_through() {
    let calls = Arc::new(AtomicU32::new(0));
    let backend = common::start_programmable_backend(counting_backend(Arc::clone(&calls), 500, "boom")).await;
    let listen = common::free_addr();

    let store = topology(listen, &[("e1", backend)]);
    let proxy = common::TestProxy::start(store, ProxyConfig::default()).await;

    let res = common::client()
        .get(format!("http://localhost:{}/", listen.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(res.headers().get("x-proxy-error").is_none());
    assert_eq!(res.text().await.unwrap(), "boom");
    assert_eq!(calls.load(Ordering::SeqCst), 1, "statuses are not retried");

    proxy.stop().await;
}

#[tokio::test]
async fn test_upstream_timeout() {
    let slow = common::start_slow_backend(Duration::from_secs(3), "late").await;
    let listen = common::free_addr();

    let store = topology(listen, &[("e1", slow)]);
    store
        .update_location_options(
            "localhost",
            "la",
            LocationOptions {
                read_timeout_ms: Some(200),
                ..Default::default()
            },
        )
        .unwrap();
    let proxy = common::TestProxy::start(store, ProxyConfig::default()).await;

    let start = std::time::Instant::now();
    let res = common::client()
        .get(format!("http://localhost:{}/", listen.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(res.headers()["x-proxy-error"], "upstream-timeout");
    assert!(start.elapsed() < Duration::from_secs(2));

    proxy.stop().await;
}
