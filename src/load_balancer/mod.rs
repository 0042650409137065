//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Location matched → upstream identified
//!     → pool.rs (endpoints of the upstream, pooled client)
//!     → round_robin.rs (rotate through available, untried endpoints)
//!     → backend.rs (endpoint URL + health record)
//!     → Return endpoint, or none (NoAvailableBackend)
//! ```
//!
//! # Design Decisions
//! - Load balancer is stateless apart from its cursor; health lives elsewhere
//! - Ejected endpoints are excluded from selection
//! - Endpoints already tried by the current request are skipped

pub mod backend;
pub mod pool;
pub mod round_robin;

use std::fmt::Debug;
use std::sync::Arc;

use backend::EndpointTarget;

pub use pool::{ClientCache, HttpClient, UpstreamPool};

/// Endpoint selection strategy.
pub trait LoadBalancer: Send + Sync + Debug {
    /// Pick an available endpoint whose id is not in `tried`.
    fn next_server(&self, endpoints: &[Arc<EndpointTarget>], tried: &[String]) -> Option<Arc<EndpointTarget>>;
}
