//! Request variables used as limiter keys.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use std::net::SocketAddr;
use std::str::FromStr;

/// Where a limiter takes its key from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestSource {
    /// Peer IP address.
    ClientIp,
    /// Host header, port stripped.
    RequestHost,
    /// Value of a named header.
    Header(String),
}

impl FromStr for RequestSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client.ip" => Ok(RequestSource::ClientIp),
            "request.host" => Ok(RequestSource::RequestHost),
            other => match other.strip_prefix("request.header.") {
                Some(name) if !name.is_empty() => Ok(RequestSource::Header(name.to_ascii_lowercase())),
                _ => Err(format!(
                    "unsupported variable '{other}', expected client.ip, request.host or request.header.<name>"
                )),
            },
        }
    }
}

impl RequestSource {
    /// Extract the key, or `None` when the request does not carry it.
    pub fn extract(&self, req: &Request<Body>) -> Option<String> {
        match self {
            RequestSource::ClientIp => req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string()),
            RequestSource::RequestHost => crate::routing::matcher::request_host(req),
            RequestSource::Header(name) => req
                .headers()
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }
}
