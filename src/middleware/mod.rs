//! Middleware contract, registry and chain composition.
//!
//! # Data Flow
//! ```text
//! MiddlewareInstance { type, priority, config }
//!     → registry.rs (look up the `MiddlewareSpec` for `type`)
//!     → MiddlewareSpec::instantiate(config) → Arc<dyn Middleware>
//!       (cache.rs hands back the previous instance when nothing changed)
//!     → chain.rs (stable sort by priority, fold wrap() around the proxy service)
//!     → ProxyService stored in the routing snapshot
//! ```
//!
//! # Design Decisions
//! - A middleware is a function from service to service (`wrap`)
//! - Lowest priority is outermost: ascending on requests, descending on responses
//! - Plugins may short-circuit by answering without calling the inner service
//! - The router never branches on plugin identity

pub mod cache;
pub mod chain;
pub mod registry;
pub mod source;

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tower::util::BoxCloneSyncService;

pub use cache::{MiddlewareCache, MiddlewareKey};
pub use chain::build_chain;
pub use registry::{Registry, RegistryError};
pub use source::RequestSource;

/// Type-erased request handler every middleware wraps.
pub type ProxyService = BoxCloneSyncService<Request<Body>, Response, Infallible>;

/// Runtime behaviour of a configured middleware.
pub trait Middleware: Send + Sync + fmt::Debug {
    /// Wrap `next`, returning the service that runs this middleware first.
    fn wrap(&self, next: ProxyService) -> ProxyService;
}

/// Validation and construction for one middleware type.
pub trait MiddlewareSpec: Send + Sync {
    /// Registry key, e.g. `connlimit`.
    fn type_name(&self) -> &'static str;

    /// Check a configuration payload without building anything.
    fn validate(&self, config: &serde_json::Value) -> Result<(), ValidationError> {
        self.instantiate(config).map(|_| ())
    }

    /// Build the runtime middleware from a payload.
    fn instantiate(&self, config: &serde_json::Value) -> Result<Arc<dyn Middleware>, ValidationError>;
}

/// A middleware payload failed its spec's validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid '{middleware}' configuration: {reason}")]
pub struct ValidationError {
    pub middleware: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(middleware: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            middleware: middleware.into(),
            reason: reason.into(),
        }
    }
}

/// Deserialize a payload into a typed config.
pub fn parse_config<T: DeserializeOwned>(
    middleware: &str,
    config: &serde_json::Value,
) -> Result<T, ValidationError> {
    serde_json::from_value(config.clone()).map_err(|e| ValidationError::new(middleware, e.to_string()))
}
