//! Retry logic.
//!
//! # Responsibilities
//! - Decide how many endpoints a request may be tried on
//! - Determine if a request can be replayed (empty body only)
//!
//! # Design Decisions
//! - Bodies are streamed, never buffered: a request with a body gets exactly
//!   one attempt because its bytes cannot be sent twice
//! - Retries go to a different endpoint of the same upstream, immediately
//! - Backend status codes are returned as-is; only call failures retry

use axum::body::{Body, HttpBody};
use axum::http::Request;

use crate::config::RetryConfig;
use crate::store::LocationOptions;

/// Bound on endpoint attempts per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Location override, else the global setting.
    pub fn for_location(global: &RetryConfig, options: &LocationOptions) -> Self {
        Self::new(options.failover_attempts.unwrap_or(global.max_attempts))
    }

    /// Attempts allowed for `req`.
    pub fn attempts_for(&self, req: &Request<Body>) -> u32 {
        if is_replayable(req) {
            self.max_attempts
        } else {
            1
        }
    }
}

/// True when the request carries no body bytes.
pub fn is_replayable(req: &Request<Body>) -> bool {
    let body = req.body();
    body.is_end_stream() || body.size_hint().exact() == Some(0)
}
