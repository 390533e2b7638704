//! Prometheus Metrics Module
//!
//! Exposes multiplexer metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound frames received, dropped and ignored
//! - **Dispatch**: Ticks delivered and callback panics
//! - **Wire**: Subscribe/unsubscribe instructions sent upstream
//! - **Connection**: State gauge, reconnect attempts, transport errors
//! - **Interest**: Active symbol and callback counts
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op, so library users and tests that never
//! install a recorder pay nothing.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::streaming::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            #[allow(clippy::expect_used)]
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
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
    // Frame counters
    describe_counter!(
        "price_stream_frames_received_total",
        "Total inbound frames received from the feed"
    );
    describe_counter!(
        "price_stream_frames_dropped_total",
        "Total inbound frames or ticks dropped as malformed"
    );
    describe_counter!(
        "price_stream_control_frames_total",
        "Total inbound control frames (acks, pongs, status)"
    );

    // Dispatch counters
    describe_counter!(
        "price_stream_ticks_dispatched_total",
        "Total price ticks delivered to callbacks"
    );
    describe_counter!(
        "price_stream_ticks_shadowed_total",
        "Total ticks skipped because another vendor form is active"
    );
    describe_counter!(
        "price_stream_callback_panics_total",
        "Total callback invocations that panicked"
    );

    // Wire counters
    describe_counter!(
        "price_stream_wire_instructions_total",
        "Total subscribe/unsubscribe instructions sent upstream"
    );
    describe_counter!(
        "price_stream_wire_symbols_total",
        "Total wire symbols carried by outbound instructions"
    );

    // Connection
    describe_gauge!(
        "price_stream_connection_state",
        "Connection state (0=disconnected, 1=connecting, 2=connected, 3=error)"
    );
    describe_counter!(
        "price_stream_reconnects_total",
        "Total reconnection attempts"
    );
    describe_counter!(
        "price_stream_transport_errors_total",
        "Total transport errors by type"
    );

    // Interest gauges
    describe_gauge!(
        "price_stream_active_symbols",
        "Number of distinct symbols with active interest"
    );
    describe_gauge!(
        "price_stream_callbacks",
        "Number of registered callbacks"
    );

    // Latency histograms
    describe_histogram!(
        "price_stream_frame_processing_seconds",
        "Time to decode a frame and run all callbacks"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for callback kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// Price update callback.
    Price,
    /// Connection status callback.
    Status,
}

impl CallbackKind {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Status => "status",
        }
    }
}

/// Metric labels for outbound instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    /// Batched diff flush.
    Flush,
    /// Full interest set replayed after (re)connect.
    Replay,
}

impl InstructionKind {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flush => "flush",
            Self::Replay => "replay",
        }
    }
}

/// Metric labels for dropped input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Frame was not valid JSON or had no recognizable shape.
    Undecodable,
    /// Entry without a symbol or a usable price.
    Malformed,
}

impl DropReason {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Undecodable => "undecodable",
            Self::Malformed => "malformed",
        }
    }
}

/// Record an inbound frame.
pub fn record_frame_received() {
    counter!("price_stream_frames_received_total").increment(1);
}

/// Record dropped frames or entries.
pub fn record_frames_dropped(reason: DropReason, count: u64) {
    counter!(
        "price_stream_frames_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(count);
}

/// Record control frames.
pub fn record_control_frames(count: u64) {
    counter!("price_stream_control_frames_total").increment(count);
}

/// Record ticks delivered to callbacks.
pub fn record_ticks_dispatched(count: u64) {
    counter!("price_stream_ticks_dispatched_total").increment(count);
}

/// Record ticks skipped in favour of the active vendor form.
pub fn record_ticks_shadowed(count: u64) {
    counter!("price_stream_ticks_shadowed_total").increment(count);
}

/// Record callback panics.
pub fn record_callback_panics(kind: CallbackKind, count: u64) {
    counter!(
        "price_stream_callback_panics_total",
        "kind" => kind.as_str()
    )
    .increment(count);
}

/// Record an outbound instruction.
pub fn record_instruction_sent(kind: InstructionKind, symbols: usize) {
    counter!(
        "price_stream_wire_instructions_total",
        "kind" => kind.as_str()
    )
    .increment(1);
    counter!(
        "price_stream_wire_symbols_total",
        "kind" => kind.as_str()
    )
    .increment(symbols as u64);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    gauge!("price_stream_connection_state").set(state.as_gauge());
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("price_stream_reconnects_total").increment(1);
}

/// Record a transport error.
pub fn record_transport_error(error_type: &str) {
    counter!(
        "price_stream_transport_errors_total",
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Update the active symbol count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_symbols(count: usize) {
    gauge!("price_stream_active_symbols").set(count as f64);
}

/// Update the registered callback count.
#[allow(clippy::cast_precision_loss)]
pub fn set_callbacks(kind: CallbackKind, count: usize) {
    gauge!(
        "price_stream_callbacks",
        "kind" => kind.as_str()
    )
    .set(count as f64);
}

/// Record frame processing duration.
pub fn record_processing_duration(duration: Duration) {
    histogram!("price_stream_frame_processing_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
