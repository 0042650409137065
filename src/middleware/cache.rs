//! Built middleware kept across snapshot builds.
//!
//! # Responsibilities
//! - Hand the same `Arc<dyn Middleware>` to every build while an instance's
//!   type and configuration stay the same
//! - Forget instances the latest successful build no longer uses
//!
//! # Design Decisions
//! - Keyed by (host, location, instance id); priority changes keep the instance
//! - A build stages what it used and commits only on success, so a rejected
//!   topology never evicts state the serving snapshot still relies on
//! - Old and new snapshots share stateful plugins (limiter buckets and
//!   counters) while a swap is in progress

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::middleware::chain::{compose, instantiate, ChainError};
use crate::middleware::{Middleware, ProxyService, Registry};
use crate::store::MiddlewareInstance;

/// Identity of one middleware instance within the topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MiddlewareKey {
    pub host: String,
    pub location: String,
    pub id: String,
}

#[derive(Debug)]
struct Built {
    type_name: String,
    config: serde_json::Value,
    middleware: Arc<dyn Middleware>,
}

impl Built {
    fn matches(&self, instance: &MiddlewareInstance) -> bool {
        self.type_name == instance.type_name && self.config == instance.config
    }
}

#[derive(Debug, Default)]
pub struct MiddlewareCache {
    entries: DashMap<MiddlewareKey, Built>,
}

impl MiddlewareCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start staging the instances of one snapshot build.
    pub fn session(&self) -> CacheSession<'_> {
        CacheSession {
            cache: self,
            used: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Instances used by one build. Dropped without `commit`, it changes nothing.
pub struct CacheSession<'a> {
    cache: &'a MiddlewareCache,
    used: HashMap<MiddlewareKey, Built>,
}

impl CacheSession<'_> {
    /// Compose the chain of `host`/`location`, reusing cached instances.
    pub fn build_chain(
        &mut self,
        host: &str,
        location: &str,
        instances: &[MiddlewareInstance],
        registry: &Registry,
        base: ProxyService,
    ) -> Result<ProxyService, ChainError> {
        compose(instances, base, |instance| {
            let key = MiddlewareKey {
                host: host.to_string(),
                location: location.to_string(),
                id: instance.id.clone(),
            };
            let cached = self
                .cache
                .entries
                .get(&key)
                .filter(|built| built.matches(instance))
                .map(|built| Arc::clone(&built.middleware));
            let middleware = match cached {
                Some(middleware) => middleware,
                None => instantiate(registry, instance)?,
            };
            self.used.insert(
                key,
                Built {
                    type_name: instance.type_name.clone(),
                    config: instance.config.clone(),
                    middleware: Arc::clone(&middleware),
                },
            );
            Ok(middleware)
        })
    }

    /// Make this build's instances the cache contents.
    pub fn commit(self) {
        let used = self.used;
        self.cache.entries.retain(|key, _| used.contains_key(key));
        for (key, built) in used {
            self.cache.entries.insert(key, built);
        }
    }
}
