//! Supervisor subsystem.
//!
//! # Data Flow
//! ```text
//! ChangeFeed ──→ coalesce window ──→ reconcile()
//!                                       │
//!                  store.topology() → RoutingSnapshot::build
//!                                       │
//!                 listener set equal? ──┼── yes → Server::swap_snapshot
//!                                       │
//!                                       └── no  → bind added sockets
//!                                                 → release kept sockets from old
//!                                                 → start new Server
//!                                                 → drain old Server (background)
//! ```
//!
//! # Design Decisions
//! - One task consumes the feed; reconciliations never overlap
//! - Any failure leaves the current instance serving untouched
//! - Only the very first start is fatal

pub mod reconciler;

pub use reconciler::{ReconcileError, ReconcileOutcome, Supervisor, SupervisorSettings};
