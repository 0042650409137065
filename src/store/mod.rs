//! Configuration store subsystem.
//!
//! # Data Flow
//! ```text
//! Mutation (bootstrap seeding, admin collaborators, tests)
//!     → ConfigStore CRUD (uniqueness + referential checks)
//!     → Change appended to the feed
//!     → Supervisor wakes, reads topology(), rebuilds the snapshot
//! ```
//!
//! # Design Decisions
//! - The store is the single writer of topology; router and servers only read
//! - Feed delivery is at-least-once; consumers recompute, never apply deltas
//! - A lagging subscriber gets a synthetic `Topology` change (resync)
//! - `MemoryStore` is the bundled implementation; other backends implement
//!   the same trait

pub mod memory;
pub mod model;

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::MemoryStore;
pub use model::{
    Address, Endpoint, Host, KeepAlive, KeyPair, Listener, ListenerKey, Location, LocationOptions,
    MiddlewareInstance, Protocol, Topology, Upstream, UpstreamOptions, UpstreamTimeouts,
};

/// Errors returned by store mutations and lookups.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: EntityKind, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} '{id}' is still referenced by {referenced_by}")]
    InUse {
        kind: EntityKind,
        id: String,
        referenced_by: String,
    },
}

impl StoreError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        StoreError::NotFound { kind, id: id.into() }
    }

    pub fn already_exists(kind: EntityKind, id: impl Into<String>) -> Self {
        StoreError::AlreadyExists { kind, id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

/// Kind of entity a change or error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Host,
    Listener,
    KeyPair,
    Location,
    Upstream,
    Endpoint,
    Middleware,
    MiddlewareType,
    /// Whole topology; used for resync notifications.
    Topology,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Host => "host",
            EntityKind::Listener => "listener",
            EntityKind::KeyPair => "key pair",
            EntityKind::Location => "location",
            EntityKind::Upstream => "upstream",
            EntityKind::Endpoint => "endpoint",
            EntityKind::Middleware => "middleware",
            EntityKind::MiddlewareType => "middleware type",
            EntityKind::Topology => "topology",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One entry of the change feed.
#[derive(Debug, Clone, Serialize)]
pub struct Change {
    /// Monotonic sequence number assigned by the store (0 for resync).
    pub seq: u64,
    pub kind: ChangeKind,
    pub entity: EntityKind,
    /// Slash separated path, e.g. `localhost/la` for a location.
    pub id: String,
    pub payload: Option<serde_json::Value>,
}

impl Change {
    /// Synthetic change telling the consumer to resynchronize everything.
    pub fn resync() -> Self {
        Self {
            seq: 0,
            kind: ChangeKind::Updated,
            entity: EntityKind::Topology,
            id: String::new(),
            payload: None,
        }
    }
}

/// Lazy, restartable sequence of changes.
///
/// Calling [`ConfigStore::subscribe`] again starts a fresh feed.
pub struct ChangeFeed {
    rx: broadcast::Receiver<Change>,
}

impl ChangeFeed {
    pub fn new(rx: broadcast::Receiver<Change>) -> Self {
        Self { rx }
    }

    /// Wait for the next change. Returns `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Change> {
        match self.rx.recv().await {
            Ok(change) => Some(change),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Change feed lagged, requesting resync");
                Some(Change::resync())
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

/// Contract required of the configuration store.
///
/// Every mutation is atomic: on error the store is left unchanged.
pub trait ConfigStore: Send + Sync {
    fn get_hosts(&self) -> Result<Vec<Host>, StoreError>;
    fn get_host(&self, name: &str) -> Result<Host, StoreError>;
    fn add_host(&self, host: Host) -> Result<Host, StoreError>;
    fn update_host_key_pair(&self, name: &str, key_pair: KeyPair) -> Result<Host, StoreError>;
    fn delete_host(&self, name: &str) -> Result<(), StoreError>;

    fn add_host_listener(&self, host: &str, listener: Listener) -> Result<Listener, StoreError>;
    fn delete_host_listener(&self, host: &str, listener_id: &str) -> Result<(), StoreError>;

    fn get_upstreams(&self) -> Result<Vec<Upstream>, StoreError>;
    fn get_upstream(&self, id: &str) -> Result<Upstream, StoreError>;
    fn add_upstream(&self, upstream: Upstream) -> Result<Upstream, StoreError>;
    fn update_upstream_options(&self, id: &str, options: UpstreamOptions) -> Result<Upstream, StoreError>;
    fn delete_upstream(&self, id: &str) -> Result<(), StoreError>;

    fn get_endpoint(&self, upstream_id: &str, id: &str) -> Result<Endpoint, StoreError>;
    fn add_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint, StoreError>;
    fn delete_endpoint(&self, upstream_id: &str, id: &str) -> Result<(), StoreError>;

    fn get_location(&self, host: &str, id: &str) -> Result<Location, StoreError>;
    fn add_location(&self, location: Location) -> Result<Location, StoreError>;
    fn update_location_upstream(&self, host: &str, id: &str, upstream_id: &str) -> Result<Location, StoreError>;
    fn update_location_options(&self, host: &str, id: &str, options: LocationOptions) -> Result<Location, StoreError>;
    fn delete_location(&self, host: &str, id: &str) -> Result<(), StoreError>;

    fn get_middleware(&self, host: &str, location: &str, id: &str) -> Result<MiddlewareInstance, StoreError>;
    fn add_middleware(
        &self,
        host: &str,
        location: &str,
        instance: MiddlewareInstance,
    ) -> Result<MiddlewareInstance, StoreError>;
    fn update_middleware(
        &self,
        host: &str,
        location: &str,
        instance: MiddlewareInstance,
    ) -> Result<MiddlewareInstance, StoreError>;
    fn delete_middleware(&self, host: &str, location: &str, id: &str) -> Result<(), StoreError>;

    /// Consistent copy of all hosts and upstreams.
    fn topology(&self) -> Result<Topology, StoreError>;

    fn subscribe(&self) -> ChangeFeed;
}
