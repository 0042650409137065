//! HTTP server instance.
//!
//! # Responsibilities
//! - Create the Axum router that dispatches every request through the
//!   current routing snapshot
//! - Run one accept loop per owned listening socket
//! - Serve HTTP/1.1 and HTTP/2 (h2c, or ALPN over TLS) per connection
//! - Hand sockets back to the supervisor without closing them
//! - Drain: stop accepting, finish in-flight work, force close at a deadline
//!
//! # Lifecycle
//! ```text
//! Starting ── start() ──→ Serving ── drain() ──→ Draining ──→ Stopped
//!                            │
//!                            └── swap_snapshot() (no state change)
//! ```
//!
//! # Design Decisions
//! - Each request loads the snapshot exactly once and keeps that `Arc`
//!   until its response is produced
//! - An accept loop owns its `BoundListener` and returns it when stopped,
//!   so socket transfer is a move, never a copy
//! - Accepting is cancel safe: a stopped loop leaves pending connections in
//!   the kernel backlog for the next owner

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::Response,
    routing::any,
    Router,
};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::net::{BoundListener, ConnectionPermit, ConnectionTracker, DrainSignal};
use crate::routing::matcher::request_host;
use crate::routing::RoutingSnapshot;
use crate::store::{ListenerKey, Protocol};

/// Lifecycle state of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection finished before the deadline.
    Completed,
    /// The deadline elapsed; `remaining` connections were force closed.
    ForceClosed { remaining: u64 },
}

/// Per-instance settings.
#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    pub tls_handshake_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            tls_handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Application state injected into the dispatch handler.
#[derive(Clone)]
struct AppState {
    snapshot: Arc<ArcSwap<RoutingSnapshot>>,
}

struct AcceptLoop {
    stop: oneshot::Sender<()>,
    task: JoinHandle<BoundListener>,
}

/// Shared by the accept loops and connection tasks of one instance.
struct ConnectionContext {
    instance: u64,
    app: Router,
    snapshot: Arc<ArcSwap<RoutingSnapshot>>,
    tracker: ConnectionTracker,
    settings: ServerSettings,
}

/// One generation of the proxy: a routing snapshot plus the sockets it
/// accepts on.
pub struct Server {
    id: u64,
    snapshot: Arc<ArcSwap<RoutingSnapshot>>,
    state: watch::Sender<ServerState>,
    loops: Mutex<BTreeMap<ListenerKey, AcceptLoop>>,
    context: Arc<ConnectionContext>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .field("snapshot_version", &self.snapshot.load().version())
            .finish()
    }
}

impl Server {
    /// Create a server in the `Starting` state.
    pub fn new(id: u64, snapshot: Arc<RoutingSnapshot>, settings: ServerSettings) -> Self {
        let snapshot = Arc::new(ArcSwap::new(snapshot));
        let app = build_router(Arc::clone(&snapshot));
        let (state, _) = watch::channel(ServerState::Starting);
        Self {
            id,
            snapshot: Arc::clone(&snapshot),
            state,
            loops: Mutex::new(BTreeMap::new()),
            context: Arc::new(ConnectionContext {
                instance: id,
                app,
                snapshot,
                tracker: ConnectionTracker::new(id),
                settings,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Begin accepting on `listeners` and enter `Serving`.
    pub fn start(&self, listeners: Vec<BoundListener>) {
        let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners {
            let key = listener.key().clone();
            let (stop, stop_rx) = oneshot::channel();
            let task = tokio::spawn(accept_loop(listener, stop_rx, Arc::clone(&self.context)));
            loops.insert(key, AcceptLoop { stop, task });
        }
        drop(loops);

        self.state.send_replace(ServerState::Serving);
        tracing::info!(
            instance = self.id,
            snapshot_version = self.snapshot.load().version(),
            listeners = ?self.listener_keys(),
            "Server instance serving"
        );
    }

    /// Replace the routing snapshot. Requests already dispatched keep the
    /// snapshot they loaded.
    pub fn swap_snapshot(&self, snapshot: Arc<RoutingSnapshot>) {
        let version = snapshot.version();
        self.snapshot.store(snapshot);
        tracing::info!(instance = self.id, snapshot_version = version, "Routing snapshot swapped");
    }

    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.load_full()
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn active_connections(&self) -> u64 {
        self.context.tracker.active_count()
    }

    /// Sockets this instance currently accepts on.
    pub fn listener_keys(&self) -> BTreeSet<ListenerKey> {
        self.loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Stop accepting on `keys` and hand the sockets over, still open.
    pub async fn release(&self, keys: &BTreeSet<ListenerKey>) -> Vec<BoundListener> {
        let stopped: Vec<(ListenerKey, AcceptLoop)> = {
            let mut loops = self.loops.lock().unwrap_or_else(PoisonError::into_inner);
            keys.iter()
                .filter_map(|k| loops.remove(k).map(|l| (k.clone(), l)))
                .collect()
        };

        let mut released = Vec::with_capacity(stopped.len());
        for (key, accept) in stopped {
            // A closed receiver means the loop already ended.
            let _ = accept.stop.send(());
            match accept.task.await {
                Ok(listener) => released.push(listener),
                Err(e) => tracing::error!(instance = self.id, listener = %key, error = %e, "Accept loop failed"),
            }
        }
        tracing::debug!(instance = self.id, count = released.len(), "Listeners released");
        released
    }

    /// Stop accepting, let in-flight requests finish, and force close
    /// whatever is left after `deadline`.
    pub async fn drain(&self, deadline: Duration) -> DrainOutcome {
        let all = self.listener_keys();
        // Dropping the released listeners closes those sockets.
        drop(self.release(&all).await);

        self.state.send_replace(ServerState::Draining);
        let tracker = &self.context.tracker;
        tracing::info!(
            instance = self.id,
            active_connections = tracker.active_count(),
            deadline_secs = deadline.as_secs_f64(),
            "Draining server instance"
        );
        tracker.begin_drain();

        let outcome = match tokio::time::timeout(deadline, tracker.wait_idle()).await {
            Ok(()) => DrainOutcome::Completed,
            Err(_) => {
                let remaining = tracker.active_count();
                tracing::warn!(instance = self.id, remaining, "Drain deadline elapsed, force closing");
                tracker.force_close();
                let _ = tokio::time::timeout(Duration::from_secs(1), tracker.wait_idle()).await;
                DrainOutcome::ForceClosed { remaining }
            }
        };

        self.state.send_replace(ServerState::Stopped);
        tracing::info!(instance = self.id, outcome = ?outcome, "Server instance stopped");
        outcome
    }
}

/// Build the Axum router with all middleware layers.
fn build_router(snapshot: Arc<ArcSwap<RoutingSnapshot>>) -> Router {
    Router::new()
        .route("/{*path}", any(dispatch))
        .route("/", any(dispatch))
        .with_state(AppState { snapshot })
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Route the request through the snapshot current at arrival.
async fn dispatch(State(state): State<AppState>, request: Request<Body>) -> Response {
    let snapshot = state.snapshot.load_full();

    let Some(host) = request_host(&request) else {
        tracing::debug!(path = %request.uri().path(), "Request without host");
        return snapshot.not_found();
    };
    let Some(route) = snapshot.route(&host, request.uri().path()) else {
        tracing::debug!(host = %host, path = %request.uri().path(), "No route matched");
        return snapshot.not_found();
    };

    match route.service().oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

async fn accept_loop(
    listener: BoundListener,
    mut stop: oneshot::Receiver<()>,
    context: Arc<ConnectionContext>,
) -> BoundListener {
    let protocol = listener.key().protocol;
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer, permit)) => {
                    spawn_connection(stream, peer, permit, protocol, &context);
                }
                Err(e) => {
                    tracing::warn!(instance = context.instance, listener = %listener.key(), error = %e, "Accept failed");
                    // Usually fd exhaustion; give the process a moment.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    tracing::debug!(instance = context.instance, listener = %listener.key(), "Accept loop stopped");
    listener
}

/// Count the connection, then serve it on its own task.
///
/// The guard is taken before spawning so a drain that starts right after
/// the accept still waits for this connection.
fn spawn_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    permit: ConnectionPermit,
    protocol: Protocol,
    context: &Arc<ConnectionContext>,
) -> JoinHandle<()> {
    let guard = context.tracker.track();
    let signal = context.tracker.signal();
    let context = Arc::clone(context);
    tokio::spawn(async move {
        handle_connection(stream, peer, permit, protocol, &context, signal).await;
        tracing::trace!(connection_id = %guard.id(), peer_addr = %peer, "Connection finished");
    })
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    permit: ConnectionPermit,
    protocol: Protocol,
    context: &ConnectionContext,
    signal: watch::Receiver<DrainSignal>,
) {

    match protocol {
        Protocol::Http => serve_connection(stream, peer, protocol, context, signal).await,
        Protocol::Https => {
            let Some(config) = context.snapshot.load().tls_config() else {
                tracing::error!(peer_addr = %peer, "TLS listener without certificates, closing connection");
                return;
            };
            let acceptor = TlsAcceptor::from(config);
            let handshake = tokio::time::timeout(context.settings.tls_handshake_timeout, acceptor.accept(stream));
            match handshake.await {
                Ok(Ok(tls_stream)) => serve_connection(tls_stream, peer, protocol, context, signal).await,
                Ok(Err(e)) => tracing::debug!(peer_addr = %peer, error = %e, "TLS handshake failed"),
                Err(_) => tracing::debug!(peer_addr = %peer, "TLS handshake timed out"),
            }
        }
    }

    drop(permit);
}

async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    protocol: Protocol,
    context: &ConnectionContext,
    mut signal: watch::Receiver<DrainSignal>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let app = context.app.clone();
    let service = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(peer));
        req.extensions_mut().insert(protocol);
        app.clone().oneshot(req)
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    // A drain that began before this task ran must still be observed.
    if *signal.borrow() != DrainSignal::Running {
        signal.mark_changed();
    }

    let mut graceful_sent = false;
    loop {
        // Poll the connection first so bytes already received are parsed
        // before a graceful shutdown can cancel protocol detection.
        tokio::select! {
            biased;
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(peer_addr = %peer, error = %e, "Connection error");
                }
                return;
            }
            changed = signal.changed() => {
                if changed.is_err() {
                    // Tracker gone; nobody can ask us to stop any more.
                    let _ = conn.as_mut().await;
                    return;
                }
            }
        }

        let current = *signal.borrow_and_update();
        match current {
            DrainSignal::Force => {
                tracing::debug!(peer_addr = %peer, "Connection force closed");
                return;
            }
            DrainSignal::Graceful if !graceful_sent => {
                conn.as_mut().graceful_shutdown();
                graceful_sent = true;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, RouterConfig};
    use crate::health::{HealthPolicy, HealthTracker};
    use crate::middleware::Registry;
    use crate::routing::BuildContext;
    use crate::store::{Listener, Topology};

    fn server() -> Server {
        let ctx = BuildContext::new(
            Registry::global(),
            Arc::new(HealthTracker::new(HealthPolicy::default())),
            RetryConfig::default(),
            RouterConfig::default(),
        );
        let snapshot = RoutingSnapshot::build(&Topology::default(), &ctx, 1).unwrap();
        let settings = ServerSettings {
            tls_handshake_timeout: Duration::from_secs(5),
        };
        Server::new(1, Arc::new(snapshot), settings)
    }

    #[tokio::test]
    async fn accepted_connection_counts_before_its_task_runs() {
        let server = server();
        let key = Listener::new("l1", Protocol::Http, "127.0.0.1:0").key();
        let listener = BoundListener::bind(key, 4).await.unwrap();
        let _client = tokio::net::TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer, permit) = listener.accept().await.unwrap();

        // Single-threaded runtime: the connection task has not been polled yet.
        let task = spawn_connection(stream, peer, permit, Protocol::Http, &server.context);
        assert_eq!(server.active_connections(), 1);

        server.context.tracker.force_close();
        task.await.unwrap();
        assert_eq!(server.active_connections(), 0);
        assert_eq!(listener.available_permits(), 4);
    }
}
