//! Prometheus Metrics Module
//!
//! Exposes feed metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: Frames received by type and frames sent by operation
//! - **Errors**: Protocol errors by reason and registry mismatches
//! - **Connection**: Status gauge, reconnect attempts and heartbeat latency
//! - **Subscriptions**: Active subscription keys
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until [`init_metrics`] installs the recorder, so
//! library code and tests can call them unconditionally.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;

use crate::domain::connection::ConnectionStatus;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first.
///
/// # Errors
///
/// Returns `BuildError` if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let _init = INIT_LOCK.lock();
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "market_feed_messages_received_total",
        "Frames received from the feed by message type"
    );
    describe_counter!(
        "market_feed_frames_sent_total",
        "Frames sent to the feed by operation"
    );

    describe_counter!(
        "market_feed_protocol_errors_total",
        "Malformed or unexpected frames dropped at the codec boundary"
    );
    describe_counter!(
        "market_feed_registry_mismatches_total",
        "Unsubscribes for inactive keys and acks that disagree with the registry"
    );

    describe_gauge!(
        "market_feed_connection_status",
        "Connection status (0=disconnected, 1=connecting, 2=connected, 3=reconnecting, 4=error)"
    );
    describe_counter!(
        "market_feed_reconnects_total",
        "Reconnection attempts scheduled"
    );
    describe_histogram!(
        "market_feed_latency_seconds",
        "Heartbeat ping to pong round trip"
    );

    describe_gauge!(
        "market_feed_active_subscriptions",
        "Subscription keys with at least one interested consumer"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame received from the feed.
pub fn record_message_received(message_type: &'static str) {
    counter!(
        "market_feed_messages_received_total",
        "message_type" => message_type
    )
    .increment(1);
}

/// Record a frame sent to the feed.
pub fn record_frame_sent(op: &'static str) {
    counter!("market_feed_frames_sent_total", "op" => op).increment(1);
}

/// Record a dropped malformed frame.
pub fn record_protocol_error(reason: &'static str) {
    counter!(
        "market_feed_protocol_errors_total",
        "reason" => reason
    )
    .increment(1);
}

/// Record a registry mismatch.
pub fn record_registry_mismatch() {
    counter!("market_feed_registry_mismatches_total").increment(1);
}

/// Update the connection status gauge.
pub fn set_connection_status(status: ConnectionStatus) {
    gauge!("market_feed_connection_status").set(f64::from(status.code()));
}

/// Record a scheduled reconnection attempt.
pub fn record_reconnect() {
    counter!("market_feed_reconnects_total").increment(1);
}

/// Record a heartbeat round trip.
pub fn record_latency(latency: Duration) {
    histogram!("market_feed_latency_seconds").record(latency.as_secs_f64());
}

/// Update the active subscription gauge.
pub fn set_active_subscriptions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("market_feed_active_subscriptions").set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================
