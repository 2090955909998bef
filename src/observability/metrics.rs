//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by method, status
//! - `gateway_request_duration_seconds` (histogram): latency distribution
//! - `gateway_connections_active` (gauge): open HTTP connections
//! - `gateway_rate_limited_total` (counter): throttling outcomes by reason
//! - `gateway_access_denied_total` (counter): allow-list rejections
//! - `relay_sessions_total` / `relay_sessions_active`: hidden relay sessions
//! - `relay_bytes_total` (counter): relayed bytes by direction
//! - `relay_session_errors_total` (counter): pump and connect failures
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is installed by the binary, never by the library

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "gateway_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("gateway_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn set_active_connections(count: u64) {
    gauge!("gateway_connections_active").set(count as f64);
}

pub fn record_rate_limited(reason: &'static str) {
    counter!("gateway_rate_limited_total", "reason" => reason).increment(1);
}

pub fn record_access_denied() {
    counter!("gateway_access_denied_total").increment(1);
}

pub fn relay_session_opened() {
    counter!("relay_sessions_total").increment(1);
    gauge!("relay_sessions_active").increment(1.0);
}

pub fn relay_session_closed() {
    gauge!("relay_sessions_active").decrement(1.0);
}

pub fn record_relay_bytes(direction: &'static str, bytes: usize) {
    counter!("relay_bytes_total", "direction" => direction).increment(bytes as u64);
}

pub fn record_relay_error() {
    counter!("relay_session_errors_total").increment(1);
}
