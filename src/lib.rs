//! Dynamically reconfigurable HTTP(S) reverse proxy library.
//!
//! Topology lives in a [`store::ConfigStore`]; the [`supervisor::Supervisor`]
//! follows its change feed and either swaps the routing snapshot of the
//! serving instance or, when the listener set changes, hands the sockets to
//! a new instance and drains the old one.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod routing;
pub mod store;
pub mod supervisor;

// Traffic management
pub mod health;
pub mod load_balancer;
pub mod middleware;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::schema::ProxyConfig;
pub use http::Server;
pub use lifecycle::Shutdown;
pub use store::{ConfigStore, MemoryStore};
pub use supervisor::Supervisor;
