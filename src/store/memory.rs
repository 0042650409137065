//! In-process configuration store.
//!
//! # Responsibilities
//! - Hold the topology behind one lock so every read is a consistent copy
//! - Enforce uniqueness and referential integrity on every mutation
//! - Validate payloads (endpoint URLs, PEM key pairs, middleware configs)
//! - Publish one `Change` per successful mutation
//!
//! # Design Decisions
//! - Checks run before anything is written: a failed call changes nothing
//! - Sequence numbers are assigned and published while the write lock is
//!   held, so feed order equals mutation order
//! - Host names are matched case-insensitively, ids are exact

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tokio::sync::broadcast;
use url::Url;

use crate::middleware::{Registry, RegistryError};
use crate::net::tls;
use crate::store::{
    Change, ChangeFeed, ChangeKind, ConfigStore, Endpoint, EntityKind, Host, KeyPair, Listener,
    Location, LocationOptions, MiddlewareInstance, StoreError, Topology, Upstream, UpstreamOptions,
};

const DEFAULT_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct State {
    /// Keyed by lowercase host name.
    hosts: BTreeMap<String, Host>,
    upstreams: BTreeMap<String, Upstream>,
}

impl State {
    fn host(&self, name: &str) -> Result<&Host, StoreError> {
        self.hosts
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| StoreError::not_found(EntityKind::Host, name))
    }

    fn host_mut(&mut self, name: &str) -> Result<&mut Host, StoreError> {
        self.hosts
            .get_mut(&name.to_ascii_lowercase())
            .ok_or_else(|| StoreError::not_found(EntityKind::Host, name))
    }

    fn upstream(&self, id: &str) -> Result<&Upstream, StoreError> {
        self.upstreams
            .get(id)
            .ok_or_else(|| StoreError::not_found(EntityKind::Upstream, id))
    }

    fn location(&self, host: &str, id: &str) -> Result<&Location, StoreError> {
        self.host(host)?
            .locations
            .iter()
            .find(|l| l.id == id)
            .ok_or_else(|| StoreError::not_found(EntityKind::Location, format!("{}/{}", host, id)))
    }

    fn location_mut(&mut self, host: &str, id: &str) -> Result<&mut Location, StoreError> {
        self.host_mut(host)?
            .locations
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| StoreError::not_found(EntityKind::Location, format!("{}/{}", host, id)))
    }
}

/// `ConfigStore` kept entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    registry: &'static Registry,
    state: RwLock<State>,
    seq: AtomicU64,
    changes: broadcast::Sender<Change>,
}

impl MemoryStore {
    /// Empty store validating middleware against `registry`.
    pub fn new(registry: &'static Registry) -> Self {
        Self::with_feed_capacity(registry, DEFAULT_FEED_CAPACITY)
    }

    /// Empty store whose change feed buffers at most `capacity` entries per
    /// subscriber before the subscriber is told to resync.
    pub fn with_feed_capacity(registry: &'static Registry, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            registry,
            state: RwLock::new(State::default()),
            seq: AtomicU64::new(0),
            changes,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a change. Must be called with the write lock held.
    fn publish<T: Serialize>(&self, kind: ChangeKind, entity: EntityKind, id: String, payload: Option<&T>) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let change = Change {
            seq,
            kind,
            entity,
            id,
            payload: payload.and_then(|p| serde_json::to_value(p).ok()),
        };
        tracing::debug!(
            seq,
            kind = ?change.kind,
            entity = %change.entity,
            id = %change.id,
            "Store change"
        );
        // No subscribers is fine; they read `topology()` on subscribe.
        let _ = self.changes.send(change);
    }

    fn validate_middleware(&self, instance: &MiddlewareInstance) -> Result<(), StoreError> {
        if instance.id.is_empty() {
            return Err(StoreError::Validation("middleware id must not be empty".into()));
        }
        let spec = self.registry.get_spec(&instance.type_name).map_err(|e| match e {
            RegistryError::NotFound(name) => StoreError::not_found(EntityKind::MiddlewareType, name),
            other => StoreError::Validation(other.to_string()),
        })?;
        spec.validate(&instance.config)
            .map_err(|e| StoreError::Validation(e.to_string()))
    }

    /// Checks a location against `state` without inserting it.
    fn validate_location(&self, state: &State, location: &Location) -> Result<(), StoreError> {
        if location.id.is_empty() {
            return Err(StoreError::Validation("location id must not be empty".into()));
        }
        if !location.path.starts_with('/') {
            return Err(StoreError::Validation(format!(
                "location path '{}' must start with '/'",
                location.path
            )));
        }
        state.upstream(&location.upstream_id)?;
        let mut seen = Vec::with_capacity(location.middlewares.len());
        for instance in &location.middlewares {
            if seen.contains(&instance.id.as_str()) {
                return Err(StoreError::already_exists(EntityKind::Middleware, instance.id.clone()));
            }
            seen.push(instance.id.as_str());
            self.validate_middleware(instance)?;
        }
        Ok(())
    }
}

fn validate_listener(listener: &Listener) -> Result<(), StoreError> {
    if listener.id.is_empty() {
        return Err(StoreError::Validation("listener id must not be empty".into()));
    }
    if listener.address.network != "tcp" {
        return Err(StoreError::Validation(format!(
            "unsupported network '{}'",
            listener.address.network
        )));
    }
    if listener.address.address.is_empty() {
        return Err(StoreError::Validation("listener address must not be empty".into()));
    }
    Ok(())
}

fn validate_key_pair(key_pair: &KeyPair) -> Result<(), StoreError> {
    tls::parse_key_pair(key_pair)
        .map(|_| ())
        .map_err(|e| StoreError::Validation(format!("key pair: {}", e)))
}

fn validate_upstream_options(options: &UpstreamOptions) -> Result<(), StoreError> {
    let t = &options.timeouts;
    for (name, value) in [("dial_ms", t.dial_ms), ("read_ms", t.read_ms), ("write_ms", t.write_ms)] {
        if value == 0 {
            return Err(StoreError::Validation(format!("timeouts.{} must be greater than 0", name)));
        }
    }
    Ok(())
}

fn validate_endpoint_url(raw: &str) -> Result<(), StoreError> {
    let url = Url::parse(raw).map_err(|e| StoreError::Validation(format!("endpoint url '{}': {}", raw, e)))?;
    if url.scheme() != "http" {
        return Err(StoreError::Validation(format!(
            "endpoint url '{}': only http backends are supported",
            raw
        )));
    }
    if url.host_str().is_none() {
        return Err(StoreError::Validation(format!("endpoint url '{}': missing host", raw)));
    }
    Ok(())
}

impl ConfigStore for MemoryStore {
    fn get_hosts(&self) -> Result<Vec<Host>, StoreError> {
        Ok(self.read().hosts.values().cloned().collect())
    }

    fn get_host(&self, name: &str) -> Result<Host, StoreError> {
        self.read().host(name).cloned()
    }

    fn add_host(&self, mut host: Host) -> Result<Host, StoreError> {
        if host.name.is_empty() {
            return Err(StoreError::Validation("host name must not be empty".into()));
        }
        let mut state = self.write();
        let key = host.name.to_ascii_lowercase();
        if state.hosts.contains_key(&key) {
            return Err(StoreError::already_exists(EntityKind::Host, host.name));
        }
        if let Some(kp) = &host.key_pair {
            validate_key_pair(kp)?;
        }
        let mut listener_ids = Vec::new();
        for listener in &host.listeners {
            validate_listener(listener)?;
            if listener_ids.contains(&listener.id.as_str()) {
                return Err(StoreError::already_exists(EntityKind::Listener, listener.id.clone()));
            }
            listener_ids.push(listener.id.as_str());
        }
        let mut location_ids = Vec::new();
        for location in &mut host.locations {
            location.host = host.name.clone();
            self.validate_location(&state, location)?;
            if location_ids.contains(&location.id) {
                return Err(StoreError::already_exists(EntityKind::Location, location.id.clone()));
            }
            location_ids.push(location.id.clone());
        }

        state.hosts.insert(key, host.clone());
        self.publish(ChangeKind::Created, EntityKind::Host, host.name.clone(), Some(&host.name));
        Ok(host)
    }

    fn update_host_key_pair(&self, name: &str, key_pair: KeyPair) -> Result<Host, StoreError> {
        let mut state = self.write();
        state.host(name)?;
        validate_key_pair(&key_pair)?;

        let host = state.host_mut(name)?;
        host.key_pair = Some(key_pair);
        let host = host.clone();
        self.publish::<()>(ChangeKind::Updated, EntityKind::KeyPair, host.name.clone(), None);
        Ok(host)
    }

    fn delete_host(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.write();
        let host = state
            .hosts
            .remove(&name.to_ascii_lowercase())
            .ok_or_else(|| StoreError::not_found(EntityKind::Host, name))?;
        self.publish::<()>(ChangeKind::Deleted, EntityKind::Host, host.name, None);
        Ok(())
    }

    fn add_host_listener(&self, host: &str, listener: Listener) -> Result<Listener, StoreError> {
        let mut state = self.write();
        validate_listener(&listener)?;
        let h = state.host_mut(host)?;
        if h.listeners.iter().any(|l| l.id == listener.id) {
            return Err(StoreError::already_exists(EntityKind::Listener, listener.id));
        }
        h.listeners.push(listener.clone());
        let id = format!("{}/{}", h.name, listener.id);
        self.publish(ChangeKind::Created, EntityKind::Listener, id, Some(&listener));
        Ok(listener)
    }

    fn delete_host_listener(&self, host: &str, listener_id: &str) -> Result<(), StoreError> {
        let mut state = self.write();
        let h = state.host_mut(host)?;
        let index = h
            .listeners
            .iter()
            .position(|l| l.id == listener_id)
            .ok_or_else(|| StoreError::not_found(EntityKind::Listener, listener_id))?;
        h.listeners.remove(index);
        let id = format!("{}/{}", h.name, listener_id);
        self.publish::<()>(ChangeKind::Deleted, EntityKind::Listener, id, None);
        Ok(())
    }

    fn get_upstreams(&self) -> Result<Vec<Upstream>, StoreError> {
        Ok(self.read().upstreams.values().cloned().collect())
    }

    fn get_upstream(&self, id: &str) -> Result<Upstream, StoreError> {
        self.read().upstream(id).cloned()
    }

    fn add_upstream(&self, mut upstream: Upstream) -> Result<Upstream, StoreError> {
        if upstream.id.is_empty() {
            return Err(StoreError::Validation("upstream id must not be empty".into()));
        }
        validate_upstream_options(&upstream.options)?;
        let mut state = self.write();
        if state.upstreams.contains_key(&upstream.id) {
            return Err(StoreError::already_exists(EntityKind::Upstream, upstream.id));
        }
        let mut endpoint_ids = Vec::new();
        for endpoint in &mut upstream.endpoints {
            endpoint.upstream_id = upstream.id.clone();
            validate_endpoint_url(&endpoint.url)?;
            if endpoint_ids.contains(&endpoint.id) {
                return Err(StoreError::already_exists(EntityKind::Endpoint, endpoint.id.clone()));
            }
            endpoint_ids.push(endpoint.id.clone());
        }

        state.upstreams.insert(upstream.id.clone(), upstream.clone());
        self.publish(ChangeKind::Created, EntityKind::Upstream, upstream.id.clone(), Some(&upstream));
        Ok(upstream)
    }

    fn update_upstream_options(&self, id: &str, options: UpstreamOptions) -> Result<Upstream, StoreError> {
        validate_upstream_options(&options)?;
        let mut state = self.write();
        let upstream = state
            .upstreams
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(EntityKind::Upstream, id))?;
        upstream.options = options;
        let upstream = upstream.clone();
        self.publish(ChangeKind::Updated, EntityKind::Upstream, upstream.id.clone(), Some(&upstream.options));
        Ok(upstream)
    }

    fn delete_upstream(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.write();
        state.upstream(id)?;
        let user = state
            .hosts
            .values()
            .flat_map(|h| h.locations.iter())
            .find(|l| l.upstream_id == id);
        if let Some(location) = user {
            return Err(StoreError::InUse {
                kind: EntityKind::Upstream,
                id: id.to_string(),
                referenced_by: format!("location {}/{}", location.host, location.id),
            });
        }
        state.upstreams.remove(id);
        self.publish::<()>(ChangeKind::Deleted, EntityKind::Upstream, id.to_string(), None);
        Ok(())
    }

    fn get_endpoint(&self, upstream_id: &str, id: &str) -> Result<Endpoint, StoreError> {
        self.read()
            .upstream(upstream_id)?
            .endpoints
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(EntityKind::Endpoint, format!("{}/{}", upstream_id, id)))
    }

    fn add_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint, StoreError> {
        if endpoint.id.is_empty() {
            return Err(StoreError::Validation("endpoint id must not be empty".into()));
        }
        let mut state = self.write();
        let upstream = state
            .upstreams
            .get_mut(&endpoint.upstream_id)
            .ok_or_else(|| StoreError::not_found(EntityKind::Upstream, endpoint.upstream_id.clone()))?;
        if upstream.endpoints.iter().any(|e| e.id == endpoint.id) {
            return Err(StoreError::already_exists(
                EntityKind::Endpoint,
                format!("{}/{}", endpoint.upstream_id, endpoint.id),
            ));
        }
        validate_endpoint_url(&endpoint.url)?;

        upstream.endpoints.push(endpoint.clone());
        let id = format!("{}/{}", endpoint.upstream_id, endpoint.id);
        self.publish(ChangeKind::Created, EntityKind::Endpoint, id, Some(&endpoint));
        Ok(endpoint)
    }

    fn delete_endpoint(&self, upstream_id: &str, id: &str) -> Result<(), StoreError> {
        let mut state = self.write();
        let upstream = state
            .upstreams
            .get_mut(upstream_id)
            .ok_or_else(|| StoreError::not_found(EntityKind::Upstream, upstream_id))?;
        let full_id = format!("{}/{}", upstream_id, id);
        let index = upstream
            .endpoints
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| StoreError::not_found(EntityKind::Endpoint, full_id.clone()))?;
        upstream.endpoints.remove(index);
        self.publish::<()>(ChangeKind::Deleted, EntityKind::Endpoint, full_id, None);
        Ok(())
    }

    fn get_location(&self, host: &str, id: &str) -> Result<Location, StoreError> {
        self.read().location(host, id).cloned()
    }

    fn add_location(&self, mut location: Location) -> Result<Location, StoreError> {
        let mut state = self.write();
        let host_name = state.host(&location.host)?.name.clone();
        location.host = host_name;
        if state.location(&location.host, &location.id).is_ok() {
            return Err(StoreError::already_exists(
                EntityKind::Location,
                format!("{}/{}", location.host, location.id),
            ));
        }
        self.validate_location(&state, &location)?;

        state.host_mut(&location.host)?.locations.push(location.clone());
        let id = format!("{}/{}", location.host, location.id);
        self.publish(ChangeKind::Created, EntityKind::Location, id, Some(&location));
        Ok(location)
    }

    fn update_location_upstream(&self, host: &str, id: &str, upstream_id: &str) -> Result<Location, StoreError> {
        let mut state = self.write();
        state.location(host, id)?;
        state.upstream(upstream_id)?;

        let location = state.location_mut(host, id)?;
        location.upstream_id = upstream_id.to_string();
        let location = location.clone();
        let change_id = format!("{}/{}", location.host, location.id);
        self.publish(ChangeKind::Updated, EntityKind::Location, change_id, Some(&location));
        Ok(location)
    }

    fn update_location_options(&self, host: &str, id: &str, options: LocationOptions) -> Result<Location, StoreError> {
        let mut state = self.write();
        let location = state.location_mut(host, id)?;
        location.options = options;
        let location = location.clone();
        let change_id = format!("{}/{}", location.host, location.id);
        self.publish(ChangeKind::Updated, EntityKind::Location, change_id, Some(&location));
        Ok(location)
    }

    fn delete_location(&self, host: &str, id: &str) -> Result<(), StoreError> {
        let mut state = self.write();
        state.location(host, id)?;
        let h = state.host_mut(host)?;
        h.locations.retain(|l| l.id != id);
        let change_id = format!("{}/{}", h.name, id);
        self.publish::<()>(ChangeKind::Deleted, EntityKind::Location, change_id, None);
        Ok(())
    }

    fn get_middleware(&self, host: &str, location: &str, id: &str) -> Result<MiddlewareInstance, StoreError> {
        self.read()
            .location(host, location)?
            .middlewares
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(EntityKind::Middleware, id))
    }

    fn add_middleware(
        &self,
        host: &str,
        location: &str,
        instance: MiddlewareInstance,
    ) -> Result<MiddlewareInstance, StoreError> {
        let mut state = self.write();
        let loc = state.location(host, location)?;
        if loc.middlewares.iter().any(|m| m.id == instance.id) {
            return Err(StoreError::already_exists(EntityKind::Middleware, instance.id));
        }
        self.validate_middleware(&instance)?;

        let loc = state.location_mut(host, location)?;
        loc.middlewares.push(instance.clone());
        let change_id = format!("{}/{}/{}", loc.host, loc.id, instance.id);
        self.publish(ChangeKind::Created, EntityKind::Middleware, change_id, Some(&instance));
        Ok(instance)
    }

    fn update_middleware(
        &self,
        host: &str,
        location: &str,
        instance: MiddlewareInstance,
    ) -> Result<MiddlewareInstance, StoreError> {
        let mut state = self.write();
        let loc = state.location(host, location)?;
        if !loc.middlewares.iter().any(|m| m.id == instance.id) {
            return Err(StoreError::not_found(EntityKind::Middleware, instance.id));
        }
        self.validate_middleware(&instance)?;

        let loc = state.location_mut(host, location)?;
        if let Some(slot) = loc.middlewares.iter_mut().find(|m| m.id == instance.id) {
            *slot = instance.clone();
        }
        let change_id = format!("{}/{}/{}", loc.host, loc.id, instance.id);
        self.publish(ChangeKind::Updated, EntityKind::Middleware, change_id, Some(&instance));
        Ok(instance)
    }

    fn delete_middleware(&self, host: &str, location: &str, id: &str) -> Result<(), StoreError> {
        let mut state = self.write();
        let loc = state.location_mut(host, location)?;
        let index = loc
            .middlewares
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| StoreError::not_found(EntityKind::Middleware, id))?;
        loc.middlewares.remove(index);
        let change_id = format!("{}/{}/{}", loc.host, loc.id, id);
        self.publish::<()>(ChangeKind::Deleted, EntityKind::Middleware, change_id, None);
        Ok(())
    }

    fn topology(&self) -> Result<Topology, StoreError> {
        let state = self.read();
        Ok(Topology {
            hosts: state.hosts.values().cloned().collect(),
            upstreams: state.upstreams.values().cloned().collect(),
        })
    }

    fn subscribe(&self) -> ChangeFeed {
        ChangeFeed::new(self.changes.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Protocol, UpstreamTimeouts};
    use serde_json::json;

    fn store() -> MemoryStore {
        MemoryStore::new(Registry::global())
    }

    fn store_with_location() -> MemoryStore {
        let s = store();
        s.add_upstream(Upstream::new("up1")).unwrap();
        s.add_endpoint(Endpoint::new("up1", "e1", "http://localhost:5000")).unwrap();
        s.add_host(Host::new("localhost")).unwrap();
        s.add_location(Location::new("localhost", "la", "/home", "up1")).unwrap();
        s
    }

    fn conn_limit(id: &str, priority: i32) -> MiddlewareInstance {
        MiddlewareInstance::new(
            id,
            "connlimit",
            priority,
            json!({ "connections": 10, "variable": "client.ip" }),
        )
    }

    #[test]
    fn host_crud() {
        let s = store();
        let host = s.add_host(Host::new("localhost")).unwrap();
        assert_eq!(host.name, "localhost");
        assert_eq!(s.get_hosts().unwrap()[0].name, "localhost");
        assert_eq!(s.get_host("LOCALHOST").unwrap().name, "localhost");

        let kp = tls::self_signed("localhost");
        s.update_host_key_pair("localhost", kp.clone()).unwrap();
        assert_eq!(s.get_hosts().unwrap()[0].key_pair, Some(kp));

        let listener = Listener::new("1", Protocol::Http, "localhost:31000");
        s.add_host_listener("localhost", listener.clone()).unwrap();
        assert_eq!(s.get_host("localhost").unwrap().listeners, vec![listener]);

        s.delete_host_listener("localhost", "1").unwrap();
        assert!(s.get_host("localhost").unwrap().listeners.is_empty());

        s.delete_host("localhost").unwrap();
        assert!(s.get_hosts().unwrap().is_empty());
        assert!(s.get_host("localhost").unwrap_err().is_not_found());
    }

    #[test]
    fn add_host_twice() {
        let s = store();
        s.add_host(Host::new("localhost")).unwrap();
        let err = s.add_host(Host::new("localhost")).unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn delete_host_not_found() {
        assert!(store().delete_host("localhost").unwrap_err().is_not_found());
    }

    #[test]
    fn invalid_key_pair_rejected() {
        let s = store();
        s.add_host(Host::new("localhost")).unwrap();
        let bad = KeyPair {
            cert: "junk".into(),
            key: "junk".into(),
        };
        let err = s.update_host_key_pair("localhost", bad).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(s.get_host("localhost").unwrap().key_pair, None);
    }

    #[test]
    fn upstream_crud() {
        let s = store();
        assert_eq!(s.add_upstream(Upstream::new("up1")).unwrap().id, "up1");
        assert_eq!(s.get_upstream("up1").unwrap().id, "up1");
        assert_eq!(s.get_upstreams().unwrap()[0].id, "up1");

        let e = s.add_endpoint(Endpoint::new("up1", "e1", "http://localhost:5000")).unwrap();
        assert_eq!(e.id, "e1");
        assert_eq!(s.get_endpoint("up1", "e1").unwrap().url, "http://localhost:5000");
        s.delete_endpoint("up1", "e1").unwrap();
        assert!(s.get_endpoint("up1", "e1").unwrap_err().is_not_found());

        let options = UpstreamOptions {
            timeouts: UpstreamTimeouts {
                dial_ms: 1_000,
                ..Default::default()
            },
            ..Default::default()
        };
        s.update_upstream_options("up1", options).unwrap();
        assert_eq!(s.get_upstream("up1").unwrap().options.timeouts.dial_ms, 1_000);

        s.delete_upstream("up1").unwrap();
        assert!(s.get_upstreams().unwrap().is_empty());
    }

    #[test]
    fn add_upstream_with_options() {
        let s = store();
        let options = UpstreamOptions {
            timeouts: UpstreamTimeouts {
                dial_ms: 1_000,
                ..Default::default()
            },
            ..Default::default()
        };
        s.add_upstream(Upstream::new("up1").with_options(options)).unwrap();
        assert_eq!(s.get_upstream("up1").unwrap().options.timeouts.dial_ms, 1_000);
    }

    #[test]
    fn upstream_errors() {
        let s = store();
        s.add_upstream(Upstream::new("up1")).unwrap();
        assert!(s.add_upstream(Upstream::new("up1")).unwrap_err().is_already_exists());
        assert!(s.delete_upstream("where").unwrap_err().is_not_found());
        assert!(s.get_upstream("where").unwrap_err().is_not_found());
    }

    #[test]
    fn zero_timeouts_rejected() {
        let s = store();
        let zero = UpstreamOptions {
            timeouts: UpstreamTimeouts {
                dial_ms: 0,
                read_ms: 0,
                write_ms: 0,
            },
            ..Default::default()
        };
        let err = s
            .add_upstream(Upstream::new("up1").with_options(zero.clone()))
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(s.get_upstreams().unwrap().is_empty());

        s.add_upstream(Upstream::new("up1")).unwrap();
        let read_only = UpstreamOptions {
            timeouts: UpstreamTimeouts {
                read_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        for options in [zero, read_only] {
            let err = s.update_upstream_options("up1", options).unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)));
        }
        assert_eq!(s.get_upstream("up1").unwrap().options, UpstreamOptions::default());
    }

    #[test]
    fn endpoint_url_validation() {
        let s = store();
        s.add_upstream(Upstream::new("up1")).unwrap();
        for bad in ["not a url", "https://localhost:5000", "ftp://host/"] {
            let err = s.add_endpoint(Endpoint::new("up1", "e1", bad)).unwrap_err();
            assert!(matches!(err, StoreError::Validation(_)), "{bad}");
        }
        assert!(s.get_upstream("up1").unwrap().endpoints.is_empty());
    }

    #[test]
    fn duplicate_endpoint_rejected() {
        let s = store();
        s.add_upstream(Upstream::new("up1")).unwrap();
        s.add_endpoint(Endpoint::new("up1", "e1", "http://localhost:5000")).unwrap();
        let err = s
            .add_endpoint(Endpoint::new("up1", "e1", "http://localhost:5001"))
            .unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(s.get_endpoint("up1", "e1").unwrap().url, "http://localhost:5000");
    }

    #[test]
    fn location_crud() {
        let s = store();
        s.add_upstream(Upstream::new("up1")).unwrap();
        s.add_endpoint(Endpoint::new("up1", "e1", "http://localhost:5000")).unwrap();
        s.add_host(Host::new("localhost")).unwrap();

        let options = LocationOptions {
            hostname: Some("somehost".into()),
            ..Default::default()
        };
        let loc = s
            .add_location(Location::new("localhost", "la", "/home", "up1").with_options(options))
            .unwrap();
        assert_eq!(loc.host, "localhost");
        assert_eq!(loc.id, "la");
        assert_eq!(loc.path, "/home");
        assert_eq!(loc.upstream_id, "up1");
        assert_eq!(loc.options.hostname.as_deref(), Some("somehost"));

        s.add_upstream(Upstream::new("up2")).unwrap();
        s.update_location_upstream("localhost", "la", "up2").unwrap();
        assert_eq!(s.get_host("localhost").unwrap().locations[0].upstream_id, "up2");

        s.delete_location("localhost", "la").unwrap();
        assert!(s.get_host("localhost").unwrap().locations.is_empty());
        assert!(s.get_location("localhost", "la").unwrap_err().is_not_found());
    }

    #[test]
    fn location_update_options() {
        let s = store_with_location();
        let options = LocationOptions {
            hostname: Some("somehost2".into()),
            ..Default::default()
        };
        s.update_location_options("localhost", "la", options).unwrap();
        let loc = s.get_location("localhost", "la").unwrap();
        assert_eq!(loc.options.hostname.as_deref(), Some("somehost2"));
    }

    #[test]
    fn add_location_twice() {
        let s = store_with_location();
        let err = s
            .add_location(Location::new("localhost", "la", "/home", "up1"))
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn add_location_no_host() {
        let s = store();
        s.add_upstream(Upstream::new("up1")).unwrap();
        let err = s
            .add_location(Location::new("localhost", "la", "/home", "up1"))
            .unwrap_err();
        assert_eq!(err, StoreError::not_found(EntityKind::Host, "localhost"));
    }

    #[test]
    fn add_location_no_upstream() {
        let s = store();
        s.add_host(Host::new("localhost")).unwrap();
        let err = s
            .add_location(Location::new("localhost", "la", "/home", "up1"))
            .unwrap_err();
        assert_eq!(err, StoreError::not_found(EntityKind::Upstream, "up1"));
        assert!(s.get_host("localhost").unwrap().locations.is_empty());
    }

    #[test]
    fn update_location_to_missing_upstream() {
        let s = store_with_location();
        let err = s.update_location_upstream("localhost", "la", "nope").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(s.get_location("localhost", "la").unwrap().upstream_id, "up1");
    }

    #[test]
    fn delete_referenced_upstream_is_in_use() {
        let s = store_with_location();
        let err = s.delete_upstream("up1").unwrap_err();
        assert!(matches!(err, StoreError::InUse { .. }));
        assert!(s.get_upstream("up1").is_ok());
    }

    #[test]
    fn middleware_crud() {
        let s = store_with_location();
        let out = s.add_middleware("localhost", "la", conn_limit("c1", 2)).unwrap();
        assert_eq!(out.id, "c1");
        assert_eq!(out.priority, 2);

        let m = &s.get_hosts().unwrap()[0].locations[0].middlewares[0];
        assert_eq!(m.id, "c1");
        assert_eq!(m.type_name, "connlimit");
        assert_eq!(m.priority, 2);

        let out = s.update_middleware("localhost", "la", conn_limit("c1", 3)).unwrap();
        assert_eq!(out.priority, 3);
        assert_eq!(s.get_middleware("localhost", "la", "c1").unwrap().priority, 3);

        s.delete_middleware("localhost", "la", "c1").unwrap();
        assert!(s.get_middleware("localhost", "la", "c1").unwrap_err().is_not_found());
    }

    #[test]
    fn middleware_errors() {
        let s = store_with_location();
        let unknown = MiddlewareInstance::new("x", "nosuchtype", 0, json!({}));
        assert_eq!(
            s.add_middleware("localhost", "la", unknown).unwrap_err(),
            StoreError::not_found(EntityKind::MiddlewareType, "nosuchtype")
        );

        let invalid = MiddlewareInstance::new("c1", "connlimit", 0, json!({ "connections": 0, "variable": "client.ip" }));
        assert!(matches!(
            s.add_middleware("localhost", "la", invalid).unwrap_err(),
            StoreError::Validation(_)
        ));

        s.add_middleware("localhost", "la", conn_limit("c1", 1)).unwrap();
        assert!(s
            .add_middleware("localhost", "la", conn_limit("c1", 1))
            .unwrap_err()
            .is_already_exists());
        assert!(s
            .update_middleware("localhost", "la", conn_limit("c2", 1))
            .unwrap_err()
            .is_not_found());
        assert!(s
            .add_middleware("localhost", "missing", conn_limit("c3", 1))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn add_host_with_nested_locations_validates_them() {
        let s = store();
        let mut host = Host::new("localhost");
        host.locations.push(Location::new("", "la", "/", "missing"));
        assert!(s.add_host(host).unwrap_err().is_not_found());
        assert!(s.get_hosts().unwrap().is_empty());
    }

    #[test]
    fn topology_is_a_consistent_copy() {
        let s = store_with_location();
        let topology = s.topology().unwrap();
        s.delete_location("localhost", "la").unwrap();
        assert_eq!(topology.hosts[0].locations.len(), 1);
        assert_eq!(topology.upstreams[0].endpoints.len(), 1);
    }

    #[tokio::test]
    async fn changes_are_published_in_order() {
        let s = store();
        let mut feed = s.subscribe();
        s.add_upstream(Upstream::new("up1")).unwrap();
        s.add_host(Host::new("localhost")).unwrap();
        s.add_location(Location::new("localhost", "la", "/", "up1")).unwrap();
        // Failed mutations publish nothing.
        let _ = s.add_upstream(Upstream::new("up1"));
        s.delete_location("localhost", "la").unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let change = feed.next().await.unwrap();
            seen.push((change.seq, change.kind, change.entity, change.id));
        }
        assert_eq!(
            seen,
            vec![
                (1, ChangeKind::Created, EntityKind::Upstream, "up1".to_string()),
                (2, ChangeKind::Created, EntityKind::Host, "localhost".to_string()),
                (3, ChangeKind::Created, EntityKind::Location, "localhost/la".to_string()),
                (4, ChangeKind::Deleted, EntityKind::Location, "localhost/la".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn lagging_subscriber_gets_resync() {
        let s = MemoryStore::with_feed_capacity(Registry::global(), 2);
        let mut feed = s.subscribe();
        for i in 0..5 {
            s.add_upstream(Upstream::new(format!("up{}", i))).unwrap();
        }
        let change = feed.next().await.unwrap();
        assert_eq!(change.entity, EntityKind::Topology);
    }
}
