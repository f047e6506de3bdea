//! Prometheus Metrics Module
//!
//! Exposes stream client metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound frames received and outbound requests sent
//! - **Dispatch**: Messages delivered, dropped as unmatched, and handler failures
//! - **Connections**: WebSocket connection state and reconnects
//! - **Subscriptions**: Active subscription counts per stream family
//!
//! # Integration
//!
//! When a port is configured, metrics are served at `/metrics` by the
//! exporter's own HTTP listener.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::infrastructure::bybit::messages::Operation;

// =============================================================================
// Exporter
// =============================================================================

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

/// Install the Prometheus recorder and serve it at `/metrics` on `port`.
///
/// Returns `Ok(false)` without installing anything if `port` is zero.
///
/// # Errors
///
/// Returns an error if the exporter fails to start (e.g., port already in use).
pub fn init_metrics(port: u16) -> Result<bool, MetricsError> {
    if port == 0 {
        return Ok(false);
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    register_metrics();
    tracing::info!(%addr, "Prometheus metrics exporter started");

    Ok(true)
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Frame counters
    describe_counter!(
        "bybit_stream_frames_received_total",
        "Total text frames received from the Bybit feed"
    );
    describe_counter!(
        "bybit_stream_requests_sent_total",
        "Total operation requests sent to the Bybit feed"
    );

    // Dispatch counters
    describe_counter!(
        "bybit_stream_messages_dispatched_total",
        "Total messages delivered to subscription handlers"
    );
    describe_counter!(
        "bybit_stream_messages_unmatched_total",
        "Total messages dropped because no handler was registered"
    );
    describe_counter!(
        "bybit_stream_handler_failures_total",
        "Total handler invocations that returned an error"
    );

    // Connection state
    describe_gauge!(
        "bybit_stream_websocket_connected",
        "Whether the WebSocket connection is established (0 or 1)"
    );
    describe_counter!(
        "bybit_stream_reconnects_total",
        "Total WebSocket reconnection attempts"
    );
    describe_counter!(
        "bybit_stream_operations_rejected_total",
        "Total operation requests rejected by the server"
    );

    // Subscription gauges
    describe_gauge!(
        "bybit_stream_subscriptions_active",
        "Number of active subscriptions per stream family"
    );

    // Latency histograms
    describe_histogram!(
        "bybit_stream_dispatch_seconds",
        "Time to decode a message and run its handler"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record an inbound text frame.
pub fn record_frame_received() {
    counter!("bybit_stream_frames_received_total").increment(1);
}

/// Record an operation request written to the connection.
pub fn record_request_sent(op: Operation) {
    counter!(
        "bybit_stream_requests_sent_total",
        "op" => op.as_str()
    )
    .increment(1);
}

/// Record a message delivered to its handler.
pub fn record_dispatched(family: &'static str, duration: Duration) {
    counter!(
        "bybit_stream_messages_dispatched_total",
        "family" => family
    )
    .increment(1);
    histogram!(
        "bybit_stream_dispatch_seconds",
        "family" => family
    )
    .record(duration.as_secs_f64());
}

/// Record a message dropped because its topic had no handler.
pub fn record_unmatched(family: &'static str) {
    counter!(
        "bybit_stream_messages_unmatched_total",
        "family" => family
    )
    .increment(1);
}

/// Record a handler returning an error.
pub fn record_handler_failure(family: &'static str) {
    counter!(
        "bybit_stream_handler_failures_total",
        "family" => family
    )
    .increment(1);
}

/// Record a server-side rejection of an operation.
pub fn record_operation_rejected(op: &str) {
    counter!(
        "bybit_stream_operations_rejected_total",
        "op" => op.to_string()
    )
    .increment(1);
}

/// Update the WebSocket connection state.
pub fn set_connected(connected: bool) {
    gauge!("bybit_stream_websocket_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record a WebSocket reconnection attempt.
pub fn record_reconnect() {
    counter!("bybit_stream_reconnects_total").increment(1);
}

/// Update the active subscription count for a family.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(family: &'static str, count: usize) {
    gauge!(
        "bybit_stream_subscriptions_active",
        "family" => family
    )
    .set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================
