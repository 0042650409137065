//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Passive health checks (passive.rs):
//!     Call outcome observed by the proxy
//!     → Classify (success / failure)
//!     → Update state.rs, eject when the threshold is reached
//!
//! State machine (state.rs):
//!     Available ←→ Ejected
//!     Ejection interval doubles on repeated ejections, capped
//! ```
//!
//! # Design Decisions
//! - Health state is per-endpoint, keyed by upstream id and endpoint id
//! - Records outlive snapshots so ejections survive reconfiguration
//! - There is no active prober: backends are judged by real traffic

pub mod passive;
pub mod state;

pub use passive::{CallOutcome, HealthTracker};
pub use state::{EndpointHealth, HealthPolicy};
