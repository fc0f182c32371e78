//! Prometheus metrics for NATS adapters.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metrics for one container, adapter or handler, labelled by component name.
#[derive(Debug, Clone)]
pub struct AdapterMetrics {
    component: String,
}

impl AdapterMetrics {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
        }
    }

    /// Record a message received from the broker.
    pub fn message_received(&self) {
        counter!(
            "nats_adapter_messages_received_total",
            "component" => self.component.clone()
        )
        .increment(1);
    }

    /// Record the listener outcome and how long it took.
    pub fn message_handled(&self, outcome: &'static str, duration: Duration) {
        counter!(
            "nats_adapter_messages_handled_total",
            "component" => self.component.clone(),
            "outcome" => outcome
        )
        .increment(1);

        histogram!(
            "nats_adapter_listener_duration_seconds",
            "component" => self.component.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn listener_panicked(&self) {
        counter!(
            "nats_adapter_listener_panics_total",
            "component" => self.component.clone()
        )
        .increment(1);
    }

    pub fn ack_failed(&self) {
        counter!(
            "nats_adapter_ack_failures_total",
            "component" => self.component.clone()
        )
        .increment(1);
    }

    pub fn poll_failed(&self) {
        counter!(
            "nats_adapter_poll_failures_total",
            "component" => self.component.clone()
        )
        .increment(1);
    }

    /// Record an error event routed to an error destination.
    pub fn error_event(&self, kind: &'static str) {
        counter!(
            "nats_adapter_error_events_total",
            "component" => self.component.clone(),
            "kind" => kind
        )
        .increment(1);
    }

    /// Record a broker-acknowledged publish.
    pub fn published(&self, duration: Duration) {
        counter!(
            "nats_adapter_published_total",
            "component" => self.component.clone()
        )
        .increment(1);

        histogram!(
            "nats_adapter_publish_ack_seconds",
            "component" => self.component.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn publish_failed(&self, reason: &'static str) {
        counter!(
            "nats_adapter_publish_failures_total",
            "component" => self.component.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn resent(&self) {
        counter!(
            "nats_adapter_resent_total",
            "component" => self.component.clone()
        )
        .increment(1);
    }

    pub fn publish_exhausted(&self) {
        counter!(
            "nats_adapter_publish_exhausted_total",
            "component" => self.component.clone()
        )
        .increment(1);
    }

    /// Update the in-flight ack queue depth gauge.
    pub fn in_flight(&self, depth: usize) {
        gauge!(
            "nats_adapter_in_flight",
            "component" => self.component.clone()
        )
        .set(depth as f64);
    }

    pub fn backpressure_factor(&self, factor: u32) {
        gauge!(
            "nats_adapter_backpressure_factor",
            "component" => self.component.clone()
        )
        .set(factor as f64);
    }

    /// Update the live worker thread gauge.
    pub fn live_workers(&self, count: usize) {
        gauge!(
            "nats_adapter_live_workers",
            "component" => self.component.clone()
        )
        .set(count as f64);
    }
}

/// Initialize the Prometheus recorder.
///
/// Returns `None` when a recorder is already installed (e.g. a second call in tests).
pub fn init_metrics() -> Option<metrics_exporter_prometheus::PrometheusHandle> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        let metrics = AdapterMetrics::new("orders-0");
        metrics.message_received();
        metrics.message_handled("ack", Duration::from_millis(3));
        metrics.in_flight(12);
        metrics.publish_failed("timeout");
    }
}
