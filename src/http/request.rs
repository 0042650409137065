//! Request handling and transformation.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers before forwarding
//! - Add `X-Forwarded-For`, `X-Forwarded-Proto`, `X-Forwarded-Host`
//! - Rewrite `Host` when the location overrides the hostname
//!
//! # Design Decisions
//! - Request ID added at the edge by tower-http and forwarded untouched
//! - Original headers preserved for retries; each attempt gets a copy

use std::net::SocketAddr;

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::store::Protocol;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including those named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Client facing facts about a request, captured before forwarding.
#[derive(Debug, Clone)]
pub struct ForwardedFor {
    pub client: Option<SocketAddr>,
    pub protocol: Protocol,
    pub host: Option<HeaderValue>,
}

/// Headers for one backend attempt.
pub fn forward_headers(original: &HeaderMap, forwarded: &ForwardedFor, hostname: Option<&str>) -> HeaderMap {
    let mut headers = original.clone();
    strip_hop_by_hop(&mut headers);

    if let Some(client) = forwarded.client {
        let ip = client.ip().to_string();
        let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, ip),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(match forwarded.protocol {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }),
    );
    if let Some(host) = &forwarded.host {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }

    match hostname.map(HeaderValue::from_str) {
        Some(Ok(value)) => {
            headers.insert(header::HOST, value);
        }
        Some(Err(_)) => tracing::warn!(hostname = ?hostname, "Ignoring invalid hostname override"),
        None => {
            if let Some(host) = &forwarded.host {
                headers.insert(header::HOST, host.clone());
            }
        }
    }
    headers
}
