//! Upstream pool management.
//!
//! # Responsibilities
//! - Hold the endpoints of one upstream for one snapshot
//! - Apply the load balancing algorithm to select an endpoint
//! - Provide the pooled HTTP client configured with the upstream's options
//!
//! # Design Decisions
//! - Pools are rebuilt with every snapshot; health records and HTTP
//!   clients are shared from long-lived caches so neither resets
//! - A client is reused while the upstream's options stay equal

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use dashmap::DashMap;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use url::Url;

use crate::health::HealthTracker;
use crate::load_balancer::{backend::EndpointTarget, round_robin::RoundRobin, LoadBalancer};
use crate::store::{Upstream, UpstreamOptions};

pub type HttpClient = Client<HttpConnector, Body>;

#[derive(Debug, Error)]
#[error("endpoint {upstream}/{endpoint} has invalid url: {source}")]
pub struct PoolError {
    pub upstream: String,
    pub endpoint: String,
    #[source]
    pub source: url::ParseError,
}

/// Build a client honoring dial timeout and keep-alive options.
fn build_client(options: &UpstreamOptions) -> HttpClient {
    let keep_alive = Duration::from_secs(options.keep_alive.period_secs);

    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(options.dial_timeout()));
    connector.set_keepalive(Some(keep_alive));
    connector.set_nodelay(true);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(keep_alive)
        .pool_max_idle_per_host(options.keep_alive.max_idle_per_host)
        .build(connector)
}

/// HTTP clients per upstream, kept across snapshots.
#[derive(Debug, Default)]
pub struct ClientCache {
    clients: DashMap<String, (UpstreamOptions, HttpClient)>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client for `upstream`; rebuilt when its options changed.
    pub fn client_for(&self, upstream: &Upstream) -> HttpClient {
        let mut slot = self
            .clients
            .entry(upstream.id.clone())
            .or_insert_with(|| (upstream.options.clone(), build_client(&upstream.options)));
        if slot.0 != upstream.options {
            tracing::debug!(upstream = %upstream.id, "Upstream options changed, new client");
            *slot = (upstream.options.clone(), build_client(&upstream.options));
        }
        slot.1.clone()
    }

    /// Drop clients of upstreams no longer present.
    pub fn retain(&self, live: &HashSet<String>) {
        self.clients.retain(|id, _| live.contains(id));
    }
}

/// Endpoints of one upstream and the strategy choosing between them.
#[derive(Debug)]
pub struct UpstreamPool {
    id: String,
    endpoints: Vec<Arc<EndpointTarget>>,
    balancer: Box<dyn LoadBalancer>,
    options: UpstreamOptions,
    client: HttpClient,
}

impl UpstreamPool {
    pub fn new(upstream: &Upstream, health: &HealthTracker, clients: &ClientCache) -> Result<Self, PoolError> {
        let mut endpoints = Vec::with_capacity(upstream.endpoints.len());
        for endpoint in &upstream.endpoints {
            let url = Url::parse(&endpoint.url).map_err(|source| PoolError {
                upstream: upstream.id.clone(),
                endpoint: endpoint.id.clone(),
                source,
            })?;
            let record = health.entry(&upstream.id, &endpoint.id, &endpoint.url);
            endpoints.push(Arc::new(EndpointTarget::new(
                endpoint.id.clone(),
                upstream.id.clone(),
                url,
                record,
            )));
        }

        Ok(Self {
            id: upstream.id.clone(),
            endpoints,
            balancer: Box::new(RoundRobin::new()),
            options: upstream.options.clone(),
            client: clients.client_for(upstream),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &UpstreamOptions {
        &self.options
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    pub fn endpoints(&self) -> &[Arc<EndpointTarget>] {
        &self.endpoints
    }

    /// Select an available endpoint not in `tried`.
    pub fn select(&self, tried: &[String]) -> Option<Arc<EndpointTarget>> {
        let selected = self.balancer.next_server(&self.endpoints, tried);
        if selected.is_none() {
            tracing::debug!(
                upstream = %self.id,
                endpoint_count = self.endpoints.len(),
                tried = tried.len(),
                "No available endpoint in upstream"
            );
        }
        selected
    }
}
