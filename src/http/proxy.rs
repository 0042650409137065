//! Forwarding service at the core of every location chain.
//!
//! # Responsibilities
//! - Select an endpoint of the location's upstream
//! - Forward method, headers and the streaming body under the read deadline
//! - Fail the call when the request body stalls past the write timeout
//! - Fail over to a different endpoint when the request is replayable
//! - Report call outcomes to passive health and metrics
//!
//! # Design Decisions
//! - The request body is never buffered; non-empty bodies get one attempt
//! - Backend statuses are passed through untouched (502/503/504 still count
//!   against the endpoint's health)
//! - Dropping the response future (client gone) cancels the backend call

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Version};
use axum::response::{IntoResponse, Response};
use tower::service_fn;
use tower::util::BoxCloneSyncService;

use crate::health::{CallOutcome, HealthTracker};
use crate::http::request::{forward_headers, ForwardedFor, X_REQUEST_ID};
use crate::http::response::{self, ProxyError};
use crate::load_balancer::UpstreamPool;
use crate::middleware::ProxyService;
use crate::observability::metrics;
use crate::resilience::retries::RetryPolicy;
use crate::resilience::timeouts::{with_deadline, CallError, IdleTimeoutBody};
use crate::store::{LocationOptions, Protocol};

/// Everything the forwarding service of one location needs.
#[derive(Debug)]
pub struct Forwarder {
    location: String,
    pool: Arc<UpstreamPool>,
    hostname: Option<String>,
    read_timeout: Duration,
    write_timeout: Duration,
    retry: RetryPolicy,
    health: Arc<HealthTracker>,
}

impl Forwarder {
    pub fn new(
        location: impl Into<String>,
        pool: Arc<UpstreamPool>,
        options: &LocationOptions,
        retry: RetryPolicy,
        health: Arc<HealthTracker>,
    ) -> Self {
        let read_timeout = options
            .read_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| pool.options().read_timeout());
        let write_timeout = pool.options().write_timeout();
        Self {
            location: location.into(),
            pool,
            hostname: options.hostname.clone(),
            read_timeout,
            write_timeout,
            retry,
            health,
        }
    }

    /// Wrap into the innermost service of a chain.
    pub fn into_service(self) -> ProxyService {
        let forwarder = Arc::new(self);
        BoxCloneSyncService::new(service_fn(move |req: Request<Body>| {
            let forwarder = Arc::clone(&forwarder);
            async move { Ok(forwarder.forward(req).await) }
        }))
    }

    async fn forward(&self, req: Request<Body>) -> Response {
        let start = Instant::now();
        let attempts = self.retry.attempts_for(&req);
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        let forwarded = ForwardedFor {
            client: req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0),
            protocol: req.extensions().get::<Protocol>().copied().unwrap_or(Protocol::Http),
            host: req.headers().get(axum::http::header::HOST).cloned(),
        };

        let (parts, body) = req.into_parts();
        let mut body = Some(Body::new(IdleTimeoutBody::new(body, self.write_timeout)));
        let mut tried: Vec<String> = Vec::new();
        let mut last_error = None;

        for attempt in 1..=attempts {
            let Some(endpoint) = self.pool.select(&tried) else {
                break;
            };
            tried.push(endpoint.id.clone());

            let uri = match endpoint.target_uri(&parts.uri) {
                Ok(uri) => uri,
                Err(e) => {
                    last_error = Some(ProxyError::UpstreamCall {
                        endpoint: endpoint.id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let mut upstream_req = Request::new(body.take().unwrap_or_else(Body::empty));
            *upstream_req.method_mut() = parts.method.clone();
            *upstream_req.uri_mut() = uri;
            *upstream_req.version_mut() = Version::HTTP_11;
            *upstream_req.headers_mut() = forward_headers(&parts.headers, &forwarded, self.hostname.as_deref());

            tracing::debug!(
                request_id = %request_id,
                location = %self.location,
                upstream = %self.pool.id(),
                endpoint = %endpoint.id,
                attempt,
                method = %parts.method,
                path = %parts.uri.path(),
                "Forwarding request"
            );

            match with_deadline(self.read_timeout, self.pool.client().request(upstream_req)).await {
                Ok(backend_response) => {
                    let status = backend_response.status();
                    self.health.observe(
                        self.pool.id(),
                        &endpoint.id,
                        &endpoint.health,
                        CallOutcome::from_status(status),
                    );
                    metrics::record_request(status.as_u16(), self.pool.id(), start);
                    return response::from_backend(backend_response);
                }
                Err(CallError::TimedOut(limit)) => {
                    tracing::warn!(
                        request_id = %request_id,
                        endpoint = %endpoint.id,
                        attempt,
                        timeout_ms = limit.as_millis() as u64,
                        "Upstream timed out"
                    );
                    self.health
                        .observe(self.pool.id(), &endpoint.id, &endpoint.health, CallOutcome::Failure);
                    last_error = Some(ProxyError::UpstreamTimeout {
                        endpoint: endpoint.id.clone(),
                    });
                }
                Err(CallError::Failed(e)) => {
                    tracing::warn!(
                        request_id = %request_id,
                        endpoint = %endpoint.id,
                        attempt,
                        error = %e,
                        "Upstream error"
                    );
                    self.health
                        .observe(self.pool.id(), &endpoint.id, &endpoint.health, CallOutcome::Failure);
                    last_error = Some(ProxyError::UpstreamCall {
                        endpoint: endpoint.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let error = last_error.unwrap_or_else(|| ProxyError::NoAvailableBackend {
            upstream: self.pool.id().to_string(),
        });
        tracing::warn!(request_id = %request_id, location = %self.location, error = %error, "Request failed");
        metrics::record_request(error.status().as_u16(), self.pool.id(), start);
        error.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthPolicy;
    use crate::load_balancer::ClientCache;
    use crate::store::{Endpoint, Upstream};
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[tokio::test]
    async fn empty_upstream_is_no_available_backend() {
        let health = Arc::new(HealthTracker::new(HealthPolicy::default()));
        let pool = Arc::new(UpstreamPool::new(&Upstream::new("up1"), &health, &ClientCache::new()).unwrap());
        let service =
            Forwarder::new("la", pool, &LocationOptions::default(), RetryPolicy::new(2), health).into_service();

        let response = service
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["x-proxy-error"], "no-available-backend");
    }

    #[tokio::test]
    async fn refused_connection_is_bad_gateway_and_counts_against_health() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let mut upstream = Upstream::new("up1");
        upstream
            .endpoints
            .push(Endpoint::new("up1", "e1", format!("http://127.0.0.1:{}", port)));
        let health = Arc::new(HealthTracker::new(HealthPolicy::default()));
        let pool = Arc::new(UpstreamPool::new(&upstream, &health, &ClientCache::new()).unwrap());
        let record = Arc::clone(&pool.endpoints()[0].health);
        let service =
            Forwarder::new("la", pool, &LocationOptions::default(), RetryPolicy::new(2), health).into_service();

        let response = service
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()["x-proxy-error"], "upstream-call-failure");
        assert_eq!(record.consecutive_failures(), 1);
    }
}
