//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use hotswap_proxy::config::ProxyConfig;
use hotswap_proxy::health::{HealthPolicy, HealthTracker};
use hotswap_proxy::http::Server;
use hotswap_proxy::lifecycle::Shutdown;
use hotswap_proxy::middleware::Registry;
use hotswap_proxy::routing::BuildContext;
use hotswap_proxy::store::MemoryStore;
use hotswap_proxy::supervisor::{ReconcileError, Supervisor, SupervisorSettings};

/// An address on loopback nobody is listening on (right now).
pub fn free_addr() -> SocketAddr {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

/// Read until the end of the request head; returns it as text.
async fn read_request_head(socket: &mut TcpStream) -> String {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        404 => "404 Not Found",
        429 => "429 Too Many Requests",
        500 => "500 Internal Server Error",
        502 => "502 Bad Gateway",
        503 => "503 Service Unavailable",
        _ => "200 OK",
    }
}

async fn write_response(socket: &mut TcpStream, status: u16, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line(status),
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// Start a programmable mock backend; `f` receives the request head.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = Arc::clone(&f);
            tokio::spawn(async move {
                let head = read_request_head(&mut socket).await;
                let (status, body) = f(head).await;
                write_response(&mut socket, status, &body).await;
            });
        }
    });
    addr
}

/// Start a mock backend that returns a fixed body.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    start_programmable_backend(move |_| async move { (200, response.to_string()) }).await
}

/// Start a mock backend that answers after `delay`.
pub async fn start_slow_backend(delay: Duration, response: &'static str) -> SocketAddr {
    start_programmable_backend(move |_| async move {
        tokio::time::sleep(delay).await;
        (200, response.to_string())
    })
    .await
}

/// Start a mock backend that echoes the request head it received.
pub async fn start_echo_backend() -> SocketAddr {
    start_programmable_backend(|head| async move { (200, head) }).await
}

/// Non-pooled client: every request opens a fresh connection.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Poll `condition` every 10ms until it holds or 5 seconds pass.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A supervisor running against a `MemoryStore`.
pub struct TestProxy {
    pub store: Arc<MemoryStore>,
    pub current: watch::Receiver<Option<Arc<Server>>>,
    pub errors: mpsc::UnboundedReceiver<ReconcileError>,
    shutdown: Shutdown,
    task: JoinHandle<Result<(), ReconcileError>>,
}

impl TestProxy {
    /// Seed nothing; the caller fills `store` before or after starting.
    pub async fn start(store: Arc<MemoryStore>, config: ProxyConfig) -> Self {
        let health = Arc::new(HealthTracker::new(HealthPolicy::from(&config.health)));
        let ctx = BuildContext::new(Registry::global(), health, config.retries.clone(), config.router.clone());
        let (errors_tx, errors) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(store.clone(), ctx, SupervisorSettings::from_config(&config))
            .with_error_channel(errors_tx);
        let mut current = supervisor.watch_current();

        let shutdown = Shutdown::new();
        let task = tokio::spawn(supervisor.run(shutdown.subscribe()));
        tokio::time::timeout(Duration::from_secs(5), current.wait_for(|s| s.is_some()))
            .await
            .expect("proxy did not start")
            .unwrap();

        Self {
            store,
            current,
            errors,
            shutdown,
            task,
        }
    }

    pub fn server(&self) -> Arc<Server> {
        self.current.borrow().clone().expect("no serving instance")
    }

    /// Wait until the serving instance runs snapshot `version` or later.
    pub async fn wait_for_version(&self, version: u64) -> Arc<Server> {
        wait_until(|| {
            self.current
                .borrow()
                .as_ref()
                .is_some_and(|s| s.snapshot().version() >= version)
        })
        .await;
        self.server()
    }

    /// Wait until an instance other than `id` is serving.
    pub async fn wait_for_replacement(&mut self, id: u64) -> Arc<Server> {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.current.wait_for(|s| s.as_ref().is_some_and(|s| s.id() != id)),
        )
        .await
        .expect("instance was not replaced")
        .unwrap();
        self.server()
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(10), self.task).await;
    }
}
