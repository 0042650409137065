//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (accept loop, hyper auto connection, drain signal)
//!     → Axum router: request id, trace span, dispatch
//!     → [routing snapshot picks host + location]
//!     → location middleware chain
//!     → proxy.rs (endpoint selection, forward, failover)
//!     → response.rs (hop-by-hop cleanup, gateway errors)
//!     → Send to client
//! ```

pub mod proxy;
pub mod request;
pub mod response;
pub mod server;

pub use proxy::Forwarder;
pub use request::X_REQUEST_ID;
pub use response::{ProxyError, X_PROXY_ERROR};
pub use server::{DrainOutcome, Server, ServerSettings, ServerState};
