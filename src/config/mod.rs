//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → runtime sections shared with subsystems
//!     → hosts/upstreams seeded into the store (lifecycle::startup)
//! ```
//!
//! # Design Decisions
//! - Config file is read once at startup; live changes go through the store
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    EndpointConfig, HealthConfig, HostConfig, KeyPairConfig, ListenerConfig, LocationConfig,
    LogFormat, ObservabilityConfig, ProxyConfig, RetryConfig, RouterConfig, SupervisorConfig,
    UpstreamConfig,
};
pub use validation::{validate_config, ValidationError};
