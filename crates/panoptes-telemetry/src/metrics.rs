//! Prometheus collectors published by the ingestion engine.
//!
//! Registered once against the default registry; the status endpoint
//! gathers and encodes them.

use std::sync::OnceLock;

use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, Histogram, IntCounterVec,
    IntGauge,
};

/// Core engine collectors.
pub struct EngineMetrics {
    /// Samples dropped on a full dispatch channel or a failed decode,
    /// per sensor.
    pub drops_total: IntCounterVec,
    /// Stream reconnections, per device.
    pub reconnects_total: IntCounterVec,
    /// Device workers currently running on this instance.
    pub workers_running: IntGauge,
    /// Registry instances in the last membership snapshot.
    pub membership_size: IntGauge,
    /// Dial-to-first-subscription latency.
    pub subscribe_latency: Histogram,
}

impl EngineMetrics {
    fn new() -> Self {
        Self {
            drops_total: register_int_counter_vec!(
                "drops_total",
                "Telemetry samples dropped per sensor",
                &["sensor"]
            )
            .unwrap(),
            reconnects_total: register_int_counter_vec!(
                "gnmi_reconnects_total",
                "Telemetry stream reconnections per device",
                &["device"]
            )
            .unwrap(),
            workers_running: register_int_gauge!(
                "workers_running",
                "Device workers running on this instance"
            )
            .unwrap(),
            membership_size: register_int_gauge!(
                "membership_size",
                "Registry instances in the last membership snapshot"
            )
            .unwrap(),
            subscribe_latency: register_histogram!(
                "subscribe_latency_seconds",
                "Dial-to-subscription latency",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
            )
            .unwrap(),
        }
    }
}

/// The process-wide engine collectors. First call registers them.
pub fn metrics() -> &'static EngineMetrics {
    static METRICS: OnceLock<EngineMetrics> = OnceLock::new();
    METRICS.get_or_init(EngineMetrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let first = metrics();
        let second = metrics();
        assert!(std::ptr::eq(first, second));

        first.drops_total.with_label_values(&["sensor1"]).inc();
        assert!(first.drops_total.with_label_values(&["sensor1"]).get() >= 1);
    }
}
