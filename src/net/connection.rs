//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count live connections per server instance
//! - Broadcast the drain signal (graceful, then forced) to connection tasks
//! - Let the owner wait until every connection has closed

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What connection tasks should do with their connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainSignal {
    /// Keep serving.
    Running,
    /// Finish in-flight requests, accept no new ones, then close.
    Graceful,
    /// Close immediately.
    Force,
}

/// Tracks active connections for graceful shutdown.
///
/// Uses watch channels both for the live count and for the drain signal, so
/// waiting never polls.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    instance: u64,
    count: Arc<watch::Sender<u64>>,
    signal: Arc<watch::Sender<DrainSignal>>,
}

impl ConnectionTracker {
    /// Create a tracker for the server instance `instance`.
    pub fn new(instance: u64) -> Self {
        Self {
            instance,
            count: Arc::new(watch::Sender::new(0)),
            signal: Arc::new(watch::Sender::new(DrainSignal::Running)),
        }
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.count.send_modify(|c| *c += 1);
        metrics::record_active_connections(self.instance, *self.count.borrow());
        ConnectionGuard {
            tracker: self.clone(),
            id: ConnectionId::new(),
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        *self.count.borrow()
    }

    /// Receiver observing the drain signal.
    pub fn signal(&self) -> watch::Receiver<DrainSignal> {
        self.signal.subscribe()
    }

    /// Ask every connection to finish in-flight work and close.
    pub fn begin_drain(&self) {
        self.signal.send_if_modified(|s| {
            if *s == DrainSignal::Running {
                *s = DrainSignal::Graceful;
                true
            } else {
                false
            }
        });
    }

    /// Close every connection now.
    pub fn force_close(&self) {
        self.signal.send_replace(DrainSignal::Force);
    }

    /// Wait until no connection is left.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|c| *c == 0).await;
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.count.send_modify(|c| *c = c.saturating_sub(1));
        metrics::record_active_connections(self.tracker.instance, self.tracker.active_count());
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
