//! Metrics instruments for the dispatch core.
//!
//! Instruments are created from an OpenTelemetry `Meter` and installed
//! once as a process-wide handle. The Prometheus exporter and the
//! `/metrics` endpoint live in `main.rs` behind the `metrics` cargo
//! feature; without it the instruments record into a no-op provider.

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Metrics for request dispatch and transport connections.
#[derive(Clone)]
pub struct BridgeMetrics {
    /// Completed requests by method and outcome
    pub requests_total: Counter<u64>,
    /// End-to-end request latency
    pub request_duration_seconds: Histogram<f64>,
    /// Tool calls currently executing (gauge via atomic)
    pub inflight: Arc<AtomicI64>,
    /// Connections opened, by transport
    pub connections_total: Counter<u64>,
    /// Requests rejected for backpressure
    pub rejected_total: Counter<u64>,
    /// Event-bus messages dropped by lagging subscribers
    pub events_dropped_total: Counter<u64>,
}

impl BridgeMetrics {
    /// Create the instrument set.
    pub fn new(meter: &Meter) -> Self {
        Self {
            requests_total: meter
                .u64_counter("toolbridge_requests_total")
                .with_description("Completed JSON-RPC requests by method and outcome")
                .build(),
            request_duration_seconds: meter
                .f64_histogram("toolbridge_request_duration_seconds")
                .with_description("End-to-end request latency in seconds")
                .build(),
            inflight: Arc::new(AtomicI64::new(0)),
            connections_total: meter
                .u64_counter("toolbridge_connections_total")
                .with_description("Connections accepted by transport")
                .build(),
            rejected_total: meter
                .u64_counter("toolbridge_rejected_total")
                .with_description("Requests rejected for backpressure")
                .build(),
            events_dropped_total: meter
                .u64_counter("toolbridge_events_dropped_total")
                .with_description("Event bus messages dropped by slow subscribers")
                .build(),
        }
    }

    /// Record a completed request.
    pub fn record_request(&self, method: &str, outcome: &str, elapsed_seconds: f64) {
        let labels = [
            KeyValue::new("method", method.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        self.requests_total.add(1, &labels);
        self.request_duration_seconds
            .record(elapsed_seconds, &labels);
    }

    /// Record an accepted connection.
    pub fn record_connection(&self, transport: &str) {
        self.connections_total
            .add(1, &[KeyValue::new("transport", transport.to_string())]);
    }

    /// Record a backpressure rejection.
    pub fn record_rejected(&self) {
        self.rejected_total.add(1, &[]);
    }

    /// Increment the in-flight gauge.
    pub fn increment_inflight(&self) {
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the in-flight gauge.
    pub fn decrement_inflight(&self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current in-flight count.
    pub fn inflight_count(&self) -> i64 {
        self.inflight.load(Ordering::Relaxed)
    }
}

/// Process-wide metrics handle.
static METRICS: once_cell::sync::OnceCell<Arc<BridgeMetrics>> = once_cell::sync::OnceCell::new();

/// Install the global metrics handle. Later calls are ignored.
pub fn init_metrics(meter: &Meter) {
    let _ = METRICS.set(Arc::new(BridgeMetrics::new(meter)));
}

/// Fetch the global metrics handle, if installed.
pub fn get_metrics() -> Option<Arc<BridgeMetrics>> {
    METRICS.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::global;

    #[test]
    fn test_instruments_record_without_panicking() {
        let meter = global::meter("test");
        let metrics = BridgeMetrics::new(&meter);

        metrics.record_request("tools/call", "ok", 0.012);
        metrics.record_request("tools/call", "error", 0.002);
        metrics.record_connection("ws");
        metrics.record_rejected();
    }

    #[test]
    fn test_inflight_gauge() {
        let meter = global::meter("test");
        let metrics = BridgeMetrics::new(&meter);

        assert_eq!(metrics.inflight_count(), 0);
        metrics.increment_inflight();
        metrics.increment_inflight();
        assert_eq!(metrics.inflight_count(), 2);
        metrics.decrement_inflight();
        assert_eq!(metrics.inflight_count(), 1);
    }
}
