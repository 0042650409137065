//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.
//! Runtime tunables live at the top level; `hosts` and `upstreams` describe
//! the bootstrap topology seeded into the configuration store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::store::{Listener, LocationOptions, MiddlewareInstance, UpstreamOptions};

/// Root configuration for the reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Reconciliation and drain behaviour.
    pub supervisor: SupervisorConfig,

    /// Listening socket settings shared by every listener.
    pub listener: ListenerConfig,

    /// Passive health / ejection policy.
    pub health: HealthConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Behaviour when no host or location matches.
    pub router: RouterConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Bootstrap upstreams.
    pub upstreams: Vec<UpstreamConfig>,

    /// Bootstrap hosts.
    pub hosts: Vec<HostConfig>,
}

/// Supervisor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Changes arriving within this window collapse into one reconciliation.
    pub coalesce_ms: u64,

    /// Upper bound on draining a replaced instance, in seconds.
    pub drain_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            coalesce_ms: 100,
            drain_timeout_secs: 30,
        }
    }
}

impl SupervisorConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Maximum concurrent connections per listening socket (backpressure).
    pub max_connections: usize,

    /// Deadline for completing a TLS handshake, in seconds.
    pub tls_handshake_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            tls_handshake_timeout_secs: 10,
        }
    }
}

/// Passive health configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Number of consecutive failures before ejecting an endpoint.
    pub failure_threshold: u32,

    /// First ejection interval in milliseconds.
    pub base_backoff_ms: u64,

    /// Cap on the ejection interval in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum endpoints tried per request (1 disables failover).
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

/// Not-found behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    pub not_found_status: u16,
    pub not_found_body: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            not_found_status: 404,
            not_found_body: "No matching route found".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Bootstrap upstream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    pub id: String,

    #[serde(default)]
    pub options: UpstreamOptions,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointConfig {
    pub id: String,
    pub url: String,
}

/// PEM files for a host certificate.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyPairConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Bootstrap host.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    pub name: String,

    #[serde(default)]
    pub key_pair: Option<KeyPairConfig>,

    #[serde(default)]
    pub listeners: Vec<Listener>,

    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocationConfig {
    pub id: String,
    pub path: String,
    pub upstream: String,

    #[serde(default)]
    pub options: LocationOptions,

    #[serde(default)]
    pub middlewares: Vec<MiddlewareInstance>,
}
