//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::EndpointTarget, LoadBalancer};

/// Round-robin selector.
/// Stores an internal counter to rotate through endpoints.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(&self, endpoints: &[Arc<EndpointTarget>], tried: &[String]) -> Option<Arc<EndpointTarget>> {
        if endpoints.is_empty() {
            return None;
        }

        let start_count = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = endpoints.len();

        (0..len)
            .map(|i| &endpoints[(start_count + i) % len])
            .find(|e| e.is_available() && !tried.contains(&e.id))
            .cloned()
    }
}
