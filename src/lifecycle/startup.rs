//! Startup orchestration.
//!
//! # Responsibilities
//! - Load bootstrap key pairs from disk
//! - Seed the configuration store in dependency order
//!
//! # Design Decisions
//! - Fail fast: any seeding error is fatal
//! - Entities go in one call at a time (upstreams, endpoints, hosts,
//!   listeners, locations, middlewares) so every reference is resolvable at
//!   the moment it is created

use std::path::PathBuf;

use thiserror::Error;

use crate::config::{HostConfig, KeyPairConfig, ProxyConfig};
use crate::store::{ConfigStore, Endpoint, Host, KeyPair, Location, StoreError, Upstream};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to seed configuration store: {0}")]
    Store(#[from] StoreError),
}

fn read_key_pair(config: &KeyPairConfig) -> Result<KeyPair, StartupError> {
    let read = |path: &PathBuf| {
        std::fs::read_to_string(path).map_err(|source| StartupError::Io {
            path: path.clone(),
            source,
        })
    };
    Ok(KeyPair {
        cert: read(&config.cert_path)?,
        key: read(&config.key_path)?,
    })
}

fn seed_host(store: &dyn ConfigStore, config: &HostConfig) -> Result<(), StartupError> {
    let mut host = Host::new(&config.name);
    host.key_pair = config.key_pair.as_ref().map(read_key_pair).transpose()?;
    store.add_host(host)?;

    for listener in &config.listeners {
        store.add_host_listener(&config.name, listener.clone())?;
    }

    for location in &config.locations {
        let entry = Location::new(&config.name, &location.id, &location.path, &location.upstream)
            .with_options(location.options.clone());
        store.add_location(entry)?;
        for middleware in &location.middlewares {
            store.add_middleware(&config.name, &location.id, middleware.clone())?;
        }
    }
    Ok(())
}

/// Load the bootstrap topology of `config` into `store`.
pub fn seed_store(store: &dyn ConfigStore, config: &ProxyConfig) -> Result<(), StartupError> {
    for upstream in &config.upstreams {
        store.add_upstream(Upstream::new(&upstream.id).with_options(upstream.options.clone()))?;
        for endpoint in &upstream.endpoints {
            store.add_endpoint(Endpoint::new(&upstream.id, &endpoint.id, &endpoint.url))?;
        }
    }

    for host in &config.hosts {
        seed_host(store, host)?;
    }

    tracing::info!(
        upstreams = config.upstreams.len(),
        hosts = config.hosts.len(),
        "Configuration store seeded"
    );
    Ok(())
}
