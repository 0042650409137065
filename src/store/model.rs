//! Topology entities held by the configuration store.
//!
//! These are plain data: the store owns them, snapshots copy them.
//! Health and runtime state never live here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Listener protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

/// Network address a listener binds to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    /// Network family; only `tcp` is supported.
    #[serde(default = "default_network")]
    pub network: String,
    /// `host:port`.
    pub address: String,
}

fn default_network() -> String {
    "tcp".to_string()
}

impl Address {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            network: default_network(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.address)
    }
}

/// A socket a host accepts traffic on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub id: String,
    pub protocol: Protocol,
    pub address: Address,
}

impl Listener {
    pub fn new(id: impl Into<String>, protocol: Protocol, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            protocol,
            address: Address::tcp(address),
        }
    }

    /// Socket identity used to decide whether a listener survives a restart.
    pub fn key(&self) -> ListenerKey {
        ListenerKey {
            address: self.address.clone(),
            protocol: self.protocol,
        }
    }
}

/// `(address, protocol)` pair identifying one listening socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey {
    pub address: Address,
    pub protocol: Protocol,
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.address.address, self.protocol)
    }
}

/// PEM encoded certificate chain and private key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub cert: String,
    pub key: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("cert_len", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Virtual host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    #[serde(default)]
    pub key_pair: Option<KeyPair>,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default)]
    pub locations: Vec<Location>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_pair: None,
            listeners: Vec::new(),
            locations: Vec::new(),
        }
    }
}

/// Per-location proxy options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationOptions {
    /// Host header sent upstream instead of the client's.
    pub hostname: Option<String>,
    /// Overrides the upstream read timeout for this location.
    pub read_timeout_ms: Option<u64>,
    /// Overrides the global bound on endpoint attempts.
    pub failover_attempts: Option<u32>,
}

/// Path-scoped routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    /// Owning host name.
    #[serde(default)]
    pub host: String,
    /// Literal path prefix.
    pub path: String,
    #[serde(rename = "upstream")]
    pub upstream_id: String,
    #[serde(default)]
    pub middlewares: Vec<MiddlewareInstance>,
    #[serde(default)]
    pub options: LocationOptions,
}

impl Location {
    pub fn new(
        host: impl Into<String>,
        id: impl Into<String>,
        path: impl Into<String>,
        upstream_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            path: path.into(),
            upstream_id: upstream_id.into(),
            middlewares: Vec::new(),
            options: LocationOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LocationOptions) -> Self {
        self.options = options;
        self
    }
}

/// Backend dial/read/write timeouts in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamTimeouts {
    pub dial_ms: u64,
    pub read_ms: u64,
    pub write_ms: u64,
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        Self {
            dial_ms: 5_000,
            read_ms: 30_000,
            write_ms: 30_000,
        }
    }
}

/// Keep-alive policy for pooled backend connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAlive {
    pub period_secs: u64,
    pub max_idle_per_host: usize,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            period_secs: 30,
            max_idle_per_host: 32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamOptions {
    pub timeouts: UpstreamTimeouts,
    pub keep_alive: KeepAlive,
}

impl UpstreamOptions {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.dial_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.read_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.write_ms)
    }
}

/// Named pool of backend endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    pub id: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub options: UpstreamOptions,
}

impl Upstream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoints: Vec::new(),
            options: UpstreamOptions::default(),
        }
    }

    pub fn with_options(mut self, options: UpstreamOptions) -> Self {
        self.options = options;
        self
    }
}

/// One backend target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    #[serde(default)]
    pub upstream_id: String,
    pub url: String,
}

impl Endpoint {
    pub fn new(upstream_id: impl Into<String>, id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            upstream_id: upstream_id.into(),
            url: url.into(),
        }
    }
}

/// Configured plugin attached to a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiddlewareInstance {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Lower runs first on the request path.
    #[serde(default)]
    pub priority: i32,
    /// Type-specific payload, validated by the registry.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl MiddlewareInstance {
    pub fn new(
        id: impl Into<String>,
        type_name: impl Into<String>,
        priority: i32,
        config: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            priority,
            config,
        }
    }
}

/// Consistent point-in-time copy of everything the router needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub hosts: Vec<Host>,
    pub upstreams: Vec<Upstream>,
}
