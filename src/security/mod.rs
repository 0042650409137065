//! Bundled traffic-control middleware.
//!
//! # Data Flow
//! ```text
//! Location chain (built by middleware::chain):
//!     → conn_limit.rs (cap concurrent requests per key)
//!     → rate_limit.rs (token bucket per key)
//!     → inner service (next plugin or the proxy)
//! ```
//!
//! # Design Decisions
//! - Fail closed: a request without the configured key is rejected
//! - Limiter state lives with the instance, which survives rebuilds while
//!   its configuration is unchanged
//! - Rejections answer `429` without touching the backend

pub mod conn_limit;
pub mod rate_limit;

use std::sync::Arc;

use crate::middleware::Registry;

/// Add every bundled plugin to `registry`.
pub fn register_builtins(registry: &mut Registry) {
    let specs: [Arc<dyn crate::middleware::MiddlewareSpec>; 2] = [
        Arc::new(conn_limit::ConnLimitSpec),
        Arc::new(rate_limit::RateLimitSpec),
    ];
    for spec in specs {
        if let Err(e) = registry.register(spec) {
            tracing::warn!(error = %e, "Skipping builtin middleware");
        }
    }
}
