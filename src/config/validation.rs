//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (locations reference declared upstreams)
//! - Validate value ranges (timeouts > 0, addresses parse, statuses valid)
//! - Detect duplicate identifiers in the bootstrap topology
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system
//! - Middleware payloads and certificates are checked later by the store,
//!   which owns the registry and the PEM parser

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use axum::http::StatusCode;

use crate::config::schema::ProxyConfig;

/// A single semantic problem, with the dotted path of the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check `config` and collect every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.supervisor.drain_timeout_secs == 0 {
        errors.push(ValidationError::new("supervisor.drain_timeout_secs", "must be greater than 0"));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }
    if config.listener.tls_handshake_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "listener.tls_handshake_timeout_secs",
            "must be greater than 0",
        ));
    }
    if config.health.failure_threshold == 0 {
        errors.push(ValidationError::new("health.failure_threshold", "must be greater than 0"));
    }
    if config.health.base_backoff_ms == 0 {
        errors.push(ValidationError::new("health.base_backoff_ms", "must be greater than 0"));
    }
    if config.health.max_backoff_ms < config.health.base_backoff_ms {
        errors.push(ValidationError::new(
            "health.max_backoff_ms",
            "must not be smaller than base_backoff_ms",
        ));
    }
    if config.retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be at least 1"));
    }
    if StatusCode::from_u16(config.router.not_found_status).is_err() {
        errors.push(ValidationError::new("router.not_found_status", "not a valid HTTP status"));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "not a socket address",
        ));
    }

    let mut upstream_ids = HashSet::new();
    for (i, upstream) in config.upstreams.iter().enumerate() {
        let field = format!("upstreams[{}]", i);
        if upstream.id.is_empty() {
            errors.push(ValidationError::new(format!("{}.id", field), "must not be empty"));
        }
        if !upstream_ids.insert(upstream.id.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.id", field),
                format!("duplicate upstream '{}'", upstream.id),
            ));
        }
        let timeouts = &upstream.options.timeouts;
        if timeouts.dial_ms == 0 || timeouts.read_ms == 0 || timeouts.write_ms == 0 {
            errors.push(ValidationError::new(
                format!("{}.options.timeouts", field),
                "timeouts must be greater than 0",
            ));
        }
        let mut endpoint_ids = HashSet::new();
        for (j, endpoint) in upstream.endpoints.iter().enumerate() {
            if !endpoint_ids.insert(endpoint.id.as_str()) {
                errors.push(ValidationError::new(
                    format!("{}.endpoints[{}].id", field, j),
                    format!("duplicate endpoint '{}'", endpoint.id),
                ));
            }
        }
    }

    let mut host_names = HashSet::new();
    for (i, host) in config.hosts.iter().enumerate() {
        let field = format!("hosts[{}]", i);
        if host.name.is_empty() {
            errors.push(ValidationError::new(format!("{}.name", field), "must not be empty"));
        }
        if !host_names.insert(host.name.to_ascii_lowercase()) {
            errors.push(ValidationError::new(
                format!("{}.name", field),
                format!("duplicate host '{}'", host.name),
            ));
        }
        for (j, listener) in host.listeners.iter().enumerate() {
            if listener.address.address.parse::<SocketAddr>().is_err() {
                errors.push(ValidationError::new(
                    format!("{}.listeners[{}].address", field, j),
                    format!("'{}' is not a socket address", listener.address.address),
                ));
            }
        }
        let mut location_ids = HashSet::new();
        for (j, location) in host.locations.iter().enumerate() {
            let loc_field = format!("{}.locations[{}]", field, j);
            if !location_ids.insert(location.id.as_str()) {
                errors.push(ValidationError::new(
                    format!("{}.id", loc_field),
                    format!("duplicate location '{}'", location.id),
                ));
            }
            if !location.path.starts_with('/') {
                errors.push(ValidationError::new(
                    format!("{}.path", loc_field),
                    "must start with '/'",
                ));
            }
            if !upstream_ids.contains(location.upstream.as_str()) {
                errors.push(ValidationError::new(
                    format!("{}.upstream", loc_field),
                    format!("references unknown upstream '{}'", location.upstream),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{EndpointConfig, HostConfig, LocationConfig, UpstreamConfig};

    fn upstream(id: &str) -> UpstreamConfig {
        UpstreamConfig {
            id: id.to_string(),
            options: Default::default(),
            endpoints: vec![EndpointConfig {
                id: "e1".to_string(),
                url: "http://127.0.0.1:5000".to_string(),
            }],
        }
    }

    fn host(name: &str, upstream: &str) -> HostConfig {
        HostConfig {
            name: name.to_string(),
            key_pair: None,
            listeners: vec![],
            locations: vec![LocationConfig {
                id: "loc1".to_string(),
                path: "/".to_string(),
                upstream: upstream.to_string(),
                options: Default::default(),
                middlewares: vec![],
            }],
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn test_valid_topology() {
        let config = ProxyConfig {
            upstreams: vec![upstream("up1")],
            hosts: vec![host("localhost", "up1")],
            ..Default::default()
        };
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = ProxyConfig {
            upstreams: vec![upstream("up1"), upstream("up1")],
            hosts: vec![host("localhost", "missing")],
            ..Default::default()
        };
        config.retries.max_attempts = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"retries.max_attempts"));
        assert!(fields.contains(&"upstreams[1].id"));
        assert!(fields.contains(&"hosts[0].locations[0].upstream"));
    }

    #[test]
    fn test_rejects_bad_listener_address() {
        let mut h = host("localhost", "up1");
        h.listeners.push(crate::store::Listener::new(
            "l1",
            crate::store::Protocol::Http,
            "not-an-address",
        ));
        let config = ProxyConfig {
            upstreams: vec![upstream("up1")],
            hosts: vec![h],
            ..Default::default()
        };
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "hosts[0].listeners[0].address");
    }
}
