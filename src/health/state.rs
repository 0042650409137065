//! Endpoint health state machine.
//!
//! # States
//! - Available: endpoint receives traffic
//! - Ejected: endpoint excluded from selection until its backoff elapses
//!
//! # State Transitions
//! ```text
//! Available → Ejected: consecutive failures >= failure_threshold
//! Ejected → Available: backoff interval elapsed (re-admitted)
//! Re-admitted → Ejected: first failure, next backoff step
//! any → Available (reset): one success
//! ```
//!
//! # Design Decisions
//! - Atomics only; request tasks never take a lock
//! - Time is tokio's clock so paused-time tests drive re-admission
//! - Failures observed while ejected (late in-flight calls) are ignored

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::HealthConfig;
use crate::resilience::backoff::calculate_backoff;

/// Thresholds and backoff bounds for passive health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&HealthConfig> for HealthPolicy {
    fn from(config: &HealthConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

/// Health of a single endpoint.
#[derive(Debug)]
pub struct EndpointHealth {
    epoch: Instant,
    consecutive_failures: AtomicU32,
    /// Ejections since the last success; selects the backoff step.
    ejections: AtomicU32,
    /// Milliseconds since `epoch` until which the endpoint is ejected; 0 = never.
    ejected_until_ms: AtomicU64,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointHealth {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            consecutive_failures: AtomicU32::new(0),
            ejections: AtomicU32::new(0),
            ejected_until_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        Instant::now().saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// True unless the endpoint is inside an ejection interval.
    pub fn is_available(&self) -> bool {
        let until = self.ejected_until_ms.load(Ordering::Acquire);
        until == 0 || self.now_ms() >= until
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn ejections(&self) -> u32 {
        self.ejections.load(Ordering::Relaxed)
    }

    /// Report a successful call. Resets the endpoint completely.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.ejections.store(0, Ordering::Relaxed);
        self.ejected_until_ms.store(0, Ordering::Release);
    }

    /// Report a failed call. Returns the ejection interval when this failure
    /// ejected the endpoint.
    pub fn record_failure(&self, policy: &HealthPolicy) -> Option<Duration> {
        if !self.is_available() {
            return None;
        }

        // Re-admitted endpoints get no grace: the first failure ejects again.
        let readmitted = self.ejections.load(Ordering::Relaxed) > 0;
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if !readmitted && failures < policy.failure_threshold {
            return None;
        }

        let level = self.ejections.fetch_add(1, Ordering::Relaxed) + 1;
        let backoff = calculate_backoff(level, policy.base_backoff, policy.max_backoff);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.ejected_until_ms
            .store(self.now_ms() + (backoff.as_millis() as u64).max(1), Ordering::Release);
        Some(backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HealthPolicy {
        HealthPolicy {
            failure_threshold: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ejects_after_threshold() {
        let health = EndpointHealth::new();
        assert_eq!(health.record_failure(&policy()), None);
        assert_eq!(health.record_failure(&policy()), None);
        assert!(health.is_available());
        assert_eq!(health.record_failure(&policy()), Some(Duration::from_secs(1)));
        assert!(!health.is_available());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!health.is_available());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(health.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn readmitted_failure_ejects_with_next_step() {
        let health = EndpointHealth::new();
        for _ in 0..3 {
            health.record_failure(&policy());
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(health.record_failure(&policy()), Some(Duration::from_secs(2)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(health.record_failure(&policy()), Some(Duration::from_secs(4)));
        tokio::time::advance(Duration::from_secs(4)).await;
        // Capped.
        assert_eq!(health.record_failure(&policy()), Some(Duration::from_secs(4)));
        assert_eq!(health.ejections(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_while_ejected_are_ignored() {
        let health = EndpointHealth::new();
        for _ in 0..3 {
            health.record_failure(&policy());
        }
        assert_eq!(health.record_failure(&policy()), None);
        assert_eq!(health.ejections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets() {
        let health = EndpointHealth::new();
        for _ in 0..3 {
            health.record_failure(&policy());
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        health.record_success();
        assert_eq!(health.ejections(), 0);
        assert_eq!(health.record_failure(&policy()), None);
        assert_eq!(health.consecutive_failures(), 1);
    }
}
