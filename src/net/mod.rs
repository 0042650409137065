//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tls.rs (optional TLS handshake, SNI certificate selection)
//!     → connection.rs (lifecycle tracking, drain signal)
//!     → Hand off to HTTP layer
//!
//! Connection States:
//!     Accepting → Handshaking → Active → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Sockets move between server instances; they are never rebound

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionTracker, DrainSignal};
pub use listener::{BoundListener, ConnectionPermit, ListenerError};
pub use tls::{build_server_config, parse_key_pair, TlsError};
