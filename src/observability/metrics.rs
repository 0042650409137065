//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): proxied requests by status, upstream
//! - `proxy_request_duration_seconds` (histogram): latency distribution
//! - `proxy_endpoint_ejections_total` (counter): endpoints ejected by health
//! - `proxy_reconciliations_total` (counter): reconciliation passes by outcome
//! - `proxy_bind_failures_total` (counter): listeners that failed to bind
//! - `proxy_active_connections` (gauge): accepted connections per instance
//! - `proxy_middleware_rejections_total` (counter): short-circuits by plugin
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op (tests, metrics disabled)
//! - Prometheus exporter runs its own HTTP listener

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(status: u16, upstream: &str, start: Instant) {
    metrics::counter!(
        "proxy_requests_total",
        "status" => status.to_string(),
        "upstream" => upstream.to_string()
    )
    .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "upstream" => upstream.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_endpoint_ejected(upstream: &str, endpoint: &str) {
    metrics::counter!(
        "proxy_endpoint_ejections_total",
        "upstream" => upstream.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

pub fn record_reconciliation(outcome: &'static str) {
    metrics::counter!("proxy_reconciliations_total", "outcome" => outcome).increment(1);
}

pub fn record_bind_failure() {
    metrics::counter!("proxy_bind_failures_total").increment(1);
}

pub fn record_active_connections(instance: u64, count: u64) {
    metrics::gauge!("proxy_active_connections", "instance" => instance.to_string()).set(count as f64);
}

pub fn record_middleware_rejection(middleware: &'static str) {
    metrics::counter!("proxy_middleware_rejections_total", "middleware" => middleware).increment(1);
}
