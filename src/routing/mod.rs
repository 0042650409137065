//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (host, path)
//!     → matcher.rs (normalize host, literal prefix test)
//!     → router.rs (host table lookup, first matching location)
//!     → Return: matched Route (with its compiled chain) or not-found
//!
//! Snapshot Compilation (on every reconciliation):
//!     Topology
//!     → Resolve upstreams into pools (health carried over)
//!     → Build one middleware chain per location
//!     → Sort locations by prefix length, then id
//!     → Freeze as immutable RoutingSnapshot
//! ```
//!
//! # Design Decisions
//! - Snapshots are immutable; changes produce a new one
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same input always matches same route

pub mod matcher;
pub mod router;

pub use router::{BuildContext, Route, RoutingSnapshot, SnapshotError};
