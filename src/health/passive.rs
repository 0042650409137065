//! Passive health checking (failure detection).
//!
//! # Responsibilities
//! - Observe request outcomes
//! - Own the per-endpoint health records across snapshot rebuilds
//! - Log and count ejections
//!
//! # Design Decisions
//! - Only connection errors, timeouts and 502/503/504 count as failures
//! - 4xx are NOT failures (client error, not backend)
//! - Records are keyed by (upstream, endpoint); a changed URL starts fresh
//! - The map is touched only while building snapshots, never per request

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::StatusCode;
use dashmap::DashMap;

use crate::health::state::{EndpointHealth, HealthPolicy};
use crate::observability::metrics;

/// Classified result of one backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

impl CallOutcome {
    /// Classify a backend response status.
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                CallOutcome::Failure
            }
            _ => CallOutcome::Success,
        }
    }
}

#[derive(Debug)]
struct Entry {
    url: String,
    health: Arc<EndpointHealth>,
}

/// Health records for every endpoint ever seen by a snapshot.
#[derive(Debug, Default)]
pub struct HealthTracker {
    policy: HealthPolicy,
    entries: DashMap<(String, String), Entry>,
}

impl HealthTracker {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            entries: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Health record for an endpoint, created on first sight.
    pub fn entry(&self, upstream: &str, endpoint: &str, url: &str) -> Arc<EndpointHealth> {
        let mut slot = self
            .entries
            .entry((upstream.to_string(), endpoint.to_string()))
            .or_insert_with(|| Entry {
                url: url.to_string(),
                health: Arc::new(EndpointHealth::new()),
            });
        if slot.url != url {
            tracing::debug!(upstream, endpoint, url, "Endpoint URL changed, resetting health");
            *slot = Entry {
                url: url.to_string(),
                health: Arc::new(EndpointHealth::new()),
            };
        }
        Arc::clone(&slot.health)
    }

    /// Forget endpoints no longer present in the topology.
    pub fn retain(&self, live: &HashSet<(String, String)>) {
        self.entries.retain(|key, _| live.contains(key));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply a call outcome to `health`.
    pub fn observe(&self, upstream: &str, endpoint: &str, health: &EndpointHealth, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Success => health.record_success(),
            CallOutcome::Failure => {
                if let Some(backoff) = health.record_failure(&self.policy) {
                    tracing::warn!(
                        upstream,
                        endpoint,
                        backoff_ms = backoff.as_millis() as u64,
                        ejections = health.ejections(),
                        "Endpoint ejected"
                    );
                    metrics::record_endpoint_ejected(upstream, endpoint);
                }
            }
        }
    }
}
