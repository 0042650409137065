//! `ratelimit` middleware: token bucket per request key.

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tower::ServiceExt;

use crate::middleware::{parse_config, Middleware, MiddlewareSpec, ProxyService, RequestSource, ValidationError};
use crate::observability::metrics;

pub const TYPE_NAME: &str = "ratelimit";

/// Checks between sweeps of refilled buckets.
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Requests admitted per `period_secs`.
    pub requests: u64,
    #[serde(default = "default_period")]
    pub period_secs: u64,
    /// Bucket capacity; defaults to `requests`.
    #[serde(default)]
    pub burst: Option<u64>,
    pub variable: String,
}

fn default_period() -> u64 {
    1
}

/// A simple token bucket rate limiter.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    /// A full bucket behaves exactly like a fresh one and can be dropped.
    fn is_full(&self, now: Instant, capacity: f64, refill_rate: f64) -> bool {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens + elapsed * refill_rate >= capacity
    }

    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    /// Take one token, or return how long until one is available.
    fn try_acquire(&mut self, capacity: f64, refill_rate: f64) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();

        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / refill_rate))
        }
    }
}

#[derive(Debug)]
struct RateLimiterState {
    buckets: DashMap<String, TokenBucket>,
    checks: AtomicU64,
    source: RequestSource,
    capacity: f64,
    refill_rate: f64,
}

impl RateLimiterState {
    fn check(&self, key: String) -> Result<(), Duration> {
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep();
        }
        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(self.capacity));
        bucket.try_acquire(self.capacity, self.refill_rate)
    }

    /// Drop buckets that have refilled completely.
    fn sweep(&self) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| !bucket.is_full(now, self.capacity, self.refill_rate));
    }
}

/// Configured rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    state: Arc<RateLimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, ValidationError> {
        if config.requests == 0 {
            return Err(ValidationError::new(TYPE_NAME, "requests must be greater than zero"));
        }
        if config.period_secs == 0 {
            return Err(ValidationError::new(TYPE_NAME, "period_secs must be greater than zero"));
        }
        let burst = config.burst.unwrap_or(config.requests);
        if burst == 0 {
            return Err(ValidationError::new(TYPE_NAME, "burst must be greater than zero"));
        }
        let source = config
            .variable
            .parse()
            .map_err(|e: String| ValidationError::new(TYPE_NAME, e))?;

        Ok(Self {
            state: Arc::new(RateLimiterState {
                buckets: DashMap::new(),
                checks: AtomicU64::new(0),
                source,
                capacity: burst as f64,
                refill_rate: config.requests as f64 / config.period_secs as f64,
            }),
        })
    }

    async fn handle(self, next: ProxyService, request: Request<Body>) -> Result<Response, Infallible> {
        let Some(key) = self.state.source.extract(&request) else {
            return Ok((StatusCode::BAD_REQUEST, "Missing rate limit key").into_response());
        };

        match self.state.check(key.clone()) {
            Ok(()) => next.oneshot(request).await,
            Err(wait) => {
                tracing::warn!(client = %key, retry_after = ?wait, "Rate limit exceeded");
                metrics::record_middleware_rejection(TYPE_NAME);
                let mut response = (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
                let secs = wait.as_secs_f64().ceil().max(1.0) as u64;
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                Ok(response)
            }
        }
    }
}

impl Middleware for RateLimiter {
    fn wrap(&self, next: ProxyService) -> ProxyService {
        let limiter = self.clone();
        ProxyService::new(tower::service_fn(move |request: Request<Body>| {
            limiter.clone().handle(next.clone(), request)
        }))
    }
}

pub struct RateLimitSpec;

impl MiddlewareSpec for RateLimitSpec {
    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn instantiate(&self, config: &serde_json::Value) -> Result<Arc<dyn Middleware>, ValidationError> {
        let config: RateLimitConfig = parse_config(TYPE_NAME, config)?;
        Ok(Arc::new(RateLimiter::new(config)?))
    }
}
