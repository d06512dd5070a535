//! Metrics collection and export for Beacon.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use beacon_auth::AuthError;
use beacon_core::BatchOutcome;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "beacon_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "beacon_connections_active";
    pub const REGISTERED_CONNECTIONS: &str = "beacon_registered_connections";
    pub const MESSAGES_TOTAL: &str = "beacon_messages_total";
    pub const MESSAGES_BYTES: &str = "beacon_messages_bytes";
    pub const BATCHES_TOTAL: &str = "beacon_batches_total";
    pub const EVENTS_DECODED: &str = "beacon_events_decoded_total";
    pub const EVENTS_DROPPED: &str = "beacon_events_dropped_total";
    pub const PUSHES_TOTAL: &str = "beacon_pushes_total";
    pub const PRUNED_TOTAL: &str = "beacon_pruned_connections_total";
    pub const SWEPT_TOTAL: &str = "beacon_swept_registrations_total";
    pub const JWKS_REFRESHES: &str = "beacon_jwks_refreshes_total";
    pub const AUTH_DENIED: &str = "beacon_auth_denied_total";
    pub const BATCH_LATENCY_SECONDS: &str = "beacon_batch_latency_seconds";
    pub const ERRORS_TOTAL: &str = "beacon_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of WebSocket connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open WebSocket connections"
    );
    metrics::describe_gauge!(
        names::REGISTERED_CONNECTIONS,
        "Current number of registry entries"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(names::BATCHES_TOTAL, "Total number of broker batches");
    metrics::describe_counter!(names::EVENTS_DECODED, "Broker records decoded into events");
    metrics::describe_counter!(names::EVENTS_DROPPED, "Broker records dropped as undecodable");
    metrics::describe_counter!(names::PUSHES_TOTAL, "Push attempts by outcome");
    metrics::describe_counter!(
        names::PRUNED_TOTAL,
        "Connections deregistered because their push came back gone"
    );
    metrics::describe_counter!(names::SWEPT_TOTAL, "Registrations removed on TTL expiry");
    metrics::describe_counter!(names::JWKS_REFRESHES, "Key set fetches");
    metrics::describe_counter!(names::AUTH_DENIED, "Connections refused by the authorizer");
    metrics::describe_histogram!(
        names::BATCH_LATENCY_SECONDS,
        "Time to consume one batch, fan-out included"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a consumed batch.
pub fn record_batch(outcome: &BatchOutcome, seconds: f64) {
    let report = &outcome.report;

    counter!(names::BATCHES_TOTAL).increment(1);
    counter!(names::EVENTS_DECODED).increment(outcome.events.len() as u64);
    counter!(names::EVENTS_DROPPED).increment(outcome.dropped as u64);
    counter!(names::PUSHES_TOTAL, "outcome" => "delivered").increment(report.delivered as u64);
    counter!(names::PUSHES_TOTAL, "outcome" => "gone").increment(report.pruned.len() as u64);
    counter!(names::PUSHES_TOTAL, "outcome" => "failed").increment(report.failed as u64);
    counter!(names::PRUNED_TOTAL).increment(report.pruned.len() as u64);
    histogram!(names::BATCH_LATENCY_SECONDS).record(seconds);
}

/// Record registrations removed by the sweeper.
pub fn record_swept(count: usize) {
    counter!(names::SWEPT_TOTAL).increment(count as u64);
}

/// Update the registry size.
pub fn set_registered_connections(count: usize) {
    gauge!(names::REGISTERED_CONNECTIONS).set(count as f64);
}

/// Publish the key set fetch count.
pub fn set_jwks_refreshes(total: u64) {
    counter!(names::JWKS_REFRESHES).absolute(total);
}

/// Record a refused connection.
pub fn record_auth_denied(error: &AuthError) {
    counter!(names::AUTH_DENIED, "reason" => denial_reason(error)).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

fn denial_reason(error: &AuthError) -> &'static str {
    match error {
        AuthError::InvalidFormat => "invalid_format",
        AuthError::KeyNotFound => "key_not_found",
        AuthError::VerificationFailed => "verification_failed",
        AuthError::Expired => "expired",
        AuthError::InvalidUse => "invalid_use",
        AuthError::KeySetUnavailable(_) => "key_set_unavailable",
    }
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
