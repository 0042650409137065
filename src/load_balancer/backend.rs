//! Endpoint abstraction.
//!
//! # Responsibilities
//! - Represent a single backend endpoint of an upstream
//! - Carry the shared health record used for selection
//! - Map a client request URI onto the endpoint URL

use std::sync::Arc;

use axum::http::uri::{InvalidUri, PathAndQuery, Uri};
use url::Url;

use crate::health::EndpointHealth;

/// A single backend endpoint, as seen by one snapshot.
#[derive(Debug)]
pub struct EndpointTarget {
    pub id: String,
    pub upstream_id: String,
    /// Pre-parsed base URL.
    pub url: Url,
    pub health: Arc<EndpointHealth>,
}

impl EndpointTarget {
    pub fn new(id: impl Into<String>, upstream_id: impl Into<String>, url: Url, health: Arc<EndpointHealth>) -> Self {
        Self {
            id: id.into(),
            upstream_id: upstream_id.into(),
            url,
            health,
        }
    }

    pub fn is_available(&self) -> bool {
        self.health.is_available()
    }

    /// `scheme://authority` of the endpoint plus the request path, prefixed
    /// by the endpoint URL's own path.
    pub fn target_uri(&self, original: &Uri) -> Result<Uri, InvalidUri> {
        let prefix = self.url.path().trim_end_matches('/');
        let path_and_query = original
            .path_and_query()
            .map(PathAndQuery::as_str)
            .unwrap_or("/");

        let authority = match self.url.port() {
            Some(port) => format!("{}:{}", self.url.host_str().unwrap_or_default(), port),
            None => self.url.host_str().unwrap_or_default().to_string(),
        };
        format!("{}://{}{}{}", self.url.scheme(), authority, prefix, path_and_query).parse()
    }
}
