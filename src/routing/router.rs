//! Routing snapshot: the immutable view every request is served from.
//!
//! # Responsibilities
//! - Compile a `Topology` into host and location lookup tables
//! - Prebuild one middleware chain per location, reusing unchanged instances
//! - Derive the listener set and the TLS configuration
//! - Look up the matching location, or answer not-found
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(1) host lookup via HashMap
//! - O(n) path prefix scan over locations pre-sorted by specificity
//!   (longest prefix first, ties by location id)
//! - Explicit NoMatch rather than silent default
//! - A build either fully succeeds or leaves nothing behind

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::Response;
use rustls::ServerConfig;
use thiserror::Error;

use crate::config::{RetryConfig, RouterConfig};
use crate::health::HealthTracker;
use crate::http::proxy::Forwarder;
use crate::http::response;
use crate::load_balancer::pool::PoolError;
use crate::load_balancer::{ClientCache, UpstreamPool};
use crate::middleware::chain::ChainError;
use crate::middleware::{MiddlewareCache, ProxyService, Registry};
use crate::net::tls::{self, TlsError};
use crate::resilience::retries::RetryPolicy;
use crate::routing::matcher::{normalize_host, PathPrefixMatcher};
use crate::store::{ListenerKey, Protocol, Topology};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("location {host}/{location} references unknown upstream '{upstream}'")]
    DanglingUpstream {
        host: String,
        location: String,
        upstream: String,
    },

    #[error("location {host}/{location}: {source}")]
    Chain {
        host: String,
        location: String,
        #[source]
        source: ChainError,
    },

    #[error("address {address} is configured as both http and https")]
    ListenerConflict { address: String },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("tls: {0}")]
    Tls(#[from] TlsError),
}

/// Long-lived inputs shared by every snapshot build.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub registry: &'static Registry,
    pub health: Arc<HealthTracker>,
    pub clients: Arc<ClientCache>,
    pub middlewares: Arc<MiddlewareCache>,
    pub retries: RetryConfig,
    pub router: RouterConfig,
}

impl BuildContext {
    pub fn new(registry: &'static Registry, health: Arc<HealthTracker>, retries: RetryConfig, router: RouterConfig) -> Self {
        Self {
            registry,
            health,
            clients: Arc::new(ClientCache::new()),
            middlewares: Arc::new(MiddlewareCache::new()),
            retries,
            router,
        }
    }
}

/// A compiled location.
#[derive(Clone)]
pub struct Route {
    pub host: String,
    pub location_id: String,
    pub upstream_id: String,
    matcher: PathPrefixMatcher,
    service: ProxyService,
}

impl Route {
    /// The location's chain, ready to serve one request.
    pub fn service(&self) -> ProxyService {
        self.service.clone()
    }

    pub fn path(&self) -> &str {
        self.matcher.prefix()
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("host", &self.host)
            .field("location_id", &self.location_id)
            .field("path", &self.matcher.prefix())
            .field("upstream_id", &self.upstream_id)
            .finish()
    }
}

/// Everything needed to route requests for one version of the topology.
pub struct RoutingSnapshot {
    version: u64,
    /// Lowercase host name → routes sorted by precedence.
    hosts: HashMap<String, Vec<Route>>,
    listeners: BTreeSet<ListenerKey>,
    tls: Option<Arc<ServerConfig>>,
    not_found_status: StatusCode,
    not_found_body: String,
}

impl std::fmt::Debug for RoutingSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingSnapshot")
            .field("version", &self.version)
            .field("hosts", &self.hosts.keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl RoutingSnapshot {
    /// Compile `topology`.
    pub fn build(topology: &Topology, ctx: &BuildContext, version: u64) -> Result<Self, SnapshotError> {
        let listeners = listener_set(topology)?;

        let needs_tls = listeners.iter().any(|k| k.protocol == Protocol::Https);
        let tls = if needs_tls {
            let key_pairs = topology
                .hosts
                .iter()
                .filter_map(|h| h.key_pair.as_ref().map(|kp| (h.name.as_str(), kp)));
            Some(tls::build_server_config(key_pairs)?)
        } else {
            None
        };

        let mut pools = HashMap::with_capacity(topology.upstreams.len());
        for upstream in &topology.upstreams {
            let pool = UpstreamPool::new(upstream, &ctx.health, &ctx.clients)?;
            pools.insert(upstream.id.as_str(), Arc::new(pool));
        }

        let mut middlewares = ctx.middlewares.session();
        let mut hosts = HashMap::with_capacity(topology.hosts.len());
        for host in &topology.hosts {
            let mut routes = Vec::with_capacity(host.locations.len());
            for location in &host.locations {
                let pool = pools
                    .get(location.upstream_id.as_str())
                    .ok_or_else(|| SnapshotError::DanglingUpstream {
                        host: host.name.clone(),
                        location: location.id.clone(),
                        upstream: location.upstream_id.clone(),
                    })?;

                let forwarder = Forwarder::new(
                    location.id.clone(),
                    Arc::clone(pool),
                    &location.options,
                    RetryPolicy::for_location(&ctx.retries, &location.options),
                    Arc::clone(&ctx.health),
                );
                let service = middlewares
                    .build_chain(
                        &host.name,
                        &location.id,
                        &location.middlewares,
                        ctx.registry,
                        forwarder.into_service(),
                    )
                    .map_err(|source| SnapshotError::Chain {
                        host: host.name.clone(),
                        location: location.id.clone(),
                        source,
                    })?;

                routes.push(Route {
                    host: host.name.clone(),
                    location_id: location.id.clone(),
                    upstream_id: location.upstream_id.clone(),
                    matcher: PathPrefixMatcher::new(location.path.clone()),
                    service,
                });
            }
            routes.sort_by(|a, b| {
                b.matcher
                    .specificity()
                    .cmp(&a.matcher.specificity())
                    .then_with(|| a.location_id.cmp(&b.location_id))
            });
            hosts.insert(normalize_host(&host.name), routes);
        }

        let live_endpoints: HashSet<(String, String)> = topology
            .upstreams
            .iter()
            .flat_map(|u| u.endpoints.iter().map(move |e| (u.id.clone(), e.id.clone())))
            .collect();
        ctx.health.retain(&live_endpoints);
        middlewares.commit();
        ctx.clients
            .retain(&topology.upstreams.iter().map(|u| u.id.clone()).collect());

        let not_found_status = StatusCode::from_u16(ctx.router.not_found_status).unwrap_or(StatusCode::NOT_FOUND);

        Ok(Self {
            version,
            hosts,
            listeners,
            tls,
            not_found_status,
            not_found_body: ctx.router.not_found_body.clone(),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Find the location serving `path` on `host` (already normalized).
    pub fn route(&self, host: &str, path: &str) -> Option<&Route> {
        self.hosts.get(host)?.iter().find(|r| r.matcher.matches(path))
    }

    pub fn listener_keys(&self) -> &BTreeSet<ListenerKey> {
        &self.listeners
    }

    pub fn tls_config(&self) -> Option<Arc<ServerConfig>> {
        self.tls.clone()
    }

    pub fn not_found(&self) -> Response {
        response::not_found(self.not_found_status, &self.not_found_body)
    }
}

/// Distinct listening sockets across all hosts.
fn listener_set(topology: &Topology) -> Result<BTreeSet<ListenerKey>, SnapshotError> {
    let mut by_address: BTreeMap<&str, Protocol> = BTreeMap::new();
    let mut keys = BTreeSet::new();
    for listener in topology.hosts.iter().flat_map(|h| h.listeners.iter()) {
        let address = listener.address.address.as_str();
        match by_address.get(address) {
            Some(protocol) if *protocol != listener.protocol => {
                return Err(SnapshotError::ListenerConflict {
                    address: address.to_string(),
                });
            }
            _ => {
                by_address.insert(address, listener.protocol);
            }
        }
        keys.insert(listener.key());
    }
    Ok(keys)
}
