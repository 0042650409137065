//! Route matching logic.
//!
//! # Responsibilities
//! - Extract the virtual host a request is addressed to
//! - Match path prefix (case-sensitive)
//!
//! # Design Decisions
//! - Host matching is case-insensitive (per HTTP spec), port ignored
//! - HTTP/1 requests carry the host in the `Host` header; HTTP/2 requests
//!   may only carry it in the URI authority
//! - Path matching is case-sensitive
//! - No regex to guarantee O(n) matching

use axum::body::Body;
use axum::http::{header, Request};

/// Lowercase a host name and strip any `:port` suffix.
///
/// Bracketed IPv6 literals keep their brackets.
pub fn normalize_host(raw: &str) -> String {
    let raw = raw.trim();
    let host = if raw.starts_with('[') {
        match raw.find(']') {
            Some(end) => &raw[..=end],
            None => raw,
        }
    } else {
        match raw.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => raw,
        }
    };
    host.to_ascii_lowercase()
}

/// Host the request is addressed to, normalized.
pub fn request_host(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .filter(|h| !h.is_empty())
        .map(normalize_host)
}

/// Matches a literal request path prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    /// Create a new path prefix matcher.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    /// Prefix length; longer prefixes are more specific.
    pub fn specificity(&self) -> usize {
        self.prefix.len()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_host_from_header() {
        let req = Request::builder()
            .header("Host", "EXAMPLE.com:8080")
            .body(Body::default())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("example.com"));
    }

    #[test]
    fn test_request_host_from_authority() {
        let req = Request::builder()
            .uri("http://Example.com:443/api")
            .body(Body::default())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("example.com"));
    }

    #[test]
    fn test_request_host_missing() {
        let req = Request::builder().uri("/api").body(Body::default()).unwrap();
        assert_eq!(request_host(&req), None);
    }

    #[test]
    fn test_normalize_ipv6() {
        assert_eq!(normalize_host("[::1]:8080"), "[::1]");
        assert_eq!(normalize_host("localhost"), "localhost");
    }

    #[test]
    fn test_path_matcher() {
        let matcher = PathPrefixMatcher::new("/api");
        assert!(matcher.matches("/api/v1"));
        assert!(matcher.matches("/api"));
        assert!(!matcher.matches("/images"));
        assert!(!matcher.matches("/API"));
        assert_eq!(matcher.specificity(), 4);
    }
}
