//! Response handling and transformation.
//!
//! # Responsibilities
//! - Map proxy failures to gateway status codes
//! - Strip hop-by-hop headers from backend responses
//! - Render the configured not-found response
//!
//! # Design Decisions
//! - Streaming responses avoid buffering entire body
//! - Every proxy-generated error carries `x-proxy-error` so clients can tell
//!   it apart from a backend answering with the same status
//! - Backend timeouts result in 504 Gateway Timeout

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::http::request::strip_hop_by_hop;

pub const X_PROXY_ERROR: HeaderName = HeaderName::from_static("x-proxy-error");

/// Failures surfaced to the client by the forwarding service.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no available backend in upstream '{upstream}'")]
    NoAvailableBackend { upstream: String },

    #[error("call to endpoint '{endpoint}' failed: {reason}")]
    UpstreamCall { endpoint: String, reason: String },

    #[error("endpoint '{endpoint}' did not answer in time")]
    UpstreamTimeout { endpoint: String },
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoAvailableBackend { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamCall { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Value of the `x-proxy-error` header.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::NoAvailableBackend { .. } => "no-available-backend",
            ProxyError::UpstreamCall { .. } => "upstream-call-failure",
            ProxyError::UpstreamTimeout { .. } => "upstream-timeout",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.to_string()).into_response();
        response
            .headers_mut()
            .insert(X_PROXY_ERROR, HeaderValue::from_static(self.code()));
        response
    }
}

/// Convert a backend response for the client.
pub fn from_backend(response: hyper::Response<hyper::body::Incoming>) -> Response {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, Body::new(body))
}

/// Response for requests no host or location matches.
pub fn not_found(status: StatusCode, body: &str) -> Response {
    (status, body.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping() {
        let cases = [
            (
                ProxyError::NoAvailableBackend { upstream: "up1".into() },
                StatusCode::SERVICE_UNAVAILABLE,
                "no-available-backend",
            ),
            (
                ProxyError::UpstreamCall {
                    endpoint: "e1".into(),
                    reason: "refused".into(),
                },
                StatusCode::BAD_GATEWAY,
                "upstream-call-failure",
            ),
            (
                ProxyError::UpstreamTimeout { endpoint: "e1".into() },
                StatusCode::GATEWAY_TIMEOUT,
                "upstream-timeout",
            ),
        ];
        for (error, status, code) in cases {
            let response = error.into_response();
            assert_eq!(response.status(), status);
            assert_eq!(response.headers()[X_PROXY_ERROR], code);
        }
    }
}
