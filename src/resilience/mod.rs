//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → timeouts.rs (enforce the read deadline)
//!     → On failure: retries.rs (replayable? try another endpoint)
//!     → health tracks the failure; backoff.rs sizes the ejection
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Retries only for requests without a body
//! - Ejection backoff grows exponentially and is capped

pub mod backoff;
pub mod retries;
pub mod timeouts;
