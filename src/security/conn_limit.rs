//! `connlimit` middleware: caps concurrent requests per request key.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tower::ServiceExt;

use crate::middleware::{parse_config, Middleware, MiddlewareSpec, ProxyService, RequestSource, ValidationError};
use crate::observability::metrics;

pub const TYPE_NAME: &str = "connlimit";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnLimitConfig {
    /// Maximum simultaneous requests per key.
    pub connections: i64,
    pub variable: String,
}

#[derive(Debug)]
struct ConnLimitState {
    counts: DashMap<String, usize>,
    source: RequestSource,
    max_connections: usize,
}

/// Configured connection limiter.
#[derive(Debug, Clone)]
pub struct ConnLimiter {
    state: Arc<ConnLimitState>,
}

impl ConnLimiter {
    pub fn new(config: ConnLimitConfig) -> Result<Self, ValidationError> {
        if config.connections <= 0 {
            return Err(ValidationError::new(TYPE_NAME, "connections must be greater than zero"));
        }
        let source = config
            .variable
            .parse()
            .map_err(|e: String| ValidationError::new(TYPE_NAME, e))?;

        Ok(Self {
            state: Arc::new(ConnLimitState {
                counts: DashMap::new(),
                source,
                max_connections: config.connections as usize,
            }),
        })
    }

    /// Try to take a slot for `key`.
    /// Returns a guard releasing the slot on drop, or `None` at the limit.
    fn try_acquire(&self, key: String) -> Option<ConnSlot> {
        let mut count = self.state.counts.entry(key.clone()).or_insert(0);
        if *count >= self.state.max_connections {
            return None;
        }
        *count += 1;
        Some(ConnSlot {
            state: self.state.clone(),
            key,
        })
    }

    /// Current number of requests holding a slot for `key`.
    pub fn active(&self, key: &str) -> usize {
        self.state.counts.get(key).map(|c| *c).unwrap_or(0)
    }

    async fn handle(self, next: ProxyService, request: Request<Body>) -> Result<Response, Infallible> {
        let Some(key) = self.state.source.extract(&request) else {
            return Ok((StatusCode::BAD_REQUEST, "Missing connection limit key").into_response());
        };

        let Some(_slot) = self.try_acquire(key.clone()) else {
            tracing::warn!(
                client = %key,
                max_connections = self.state.max_connections,
                "Connection limit reached"
            );
            metrics::record_middleware_rejection(TYPE_NAME);
            return Ok((StatusCode::TOO_MANY_REQUESTS, "Connection limit reached").into_response());
        };

        next.oneshot(request).await
    }
}

/// Held for the lifetime of one admitted request.
struct ConnSlot {
    state: Arc<ConnLimitState>,
    key: String,
}

impl Drop for ConnSlot {
    fn drop(&mut self) {
        if let Some(mut count) = self.state.counts.get_mut(&self.key) {
            *count = count.saturating_sub(1);
        }
        self.state.counts.remove_if(&self.key, |_, count| *count == 0);
    }
}

impl Middleware for ConnLimiter {
    fn wrap(&self, next: ProxyService) -> ProxyService {
        let limiter = self.clone();
        ProxyService::new(tower::service_fn(move |request: Request<Body>| {
            limiter.clone().handle(next.clone(), request)
        }))
    }
}

pub struct ConnLimitSpec;

impl MiddlewareSpec for ConnLimitSpec {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn instantiate(&self, config: &serde_json::Value) -> Result<Arc<dyn Middleware>, ValidationError> {
        let config: ConnLimitConfig = parse_config(TYPE_NAME, config)?;
        Ok(Arc::new(ConnLimiter::new(config)?))
    }
}
