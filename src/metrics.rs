//! Pipeline metrics
//!
//! Counters and gauges are emitted through the `metrics` facade; nothing is
//! exported unless a recorder is installed (see [`init_metrics_exporter`]).
//!
//! # Metrics
//!
//! - `streamhook_events_received_total`: Counter of events read from the source
//! - `streamhook_events_filtered_total`: Counter of events by filter result
//! - `streamhook_delivery_attempts_total`: Counter of attempts by outcome
//! - `streamhook_delivery_duration_seconds`: Histogram of attempt latency
//! - `streamhook_deliveries_in_flight`: Gauge of attempts currently running
//! - `streamhook_dead_letters_total`: Counter of dead-lettered tasks
//! - `streamhook_checkpoint_saves_total`: Counter of committed checkpoints
//! - `streamhook_source_reconnects_total`: Counter of resubscribe attempts

use metrics::{decrement_gauge, histogram, increment_counter, increment_gauge};
use std::cell::Cell;
use std::time::Instant;

/// Count an event read from the source
pub fn record_event_received(subscription: &str) {
    increment_counter!("streamhook_events_received_total", "subscription" => subscription.to_string());
}

/// Count a filter decision
pub fn record_filter_result(subscription: &str, matched: bool) {
    increment_counter!(
        "streamhook_events_filtered_total",
        "subscription" => subscription.to_string(),
        "result" => if matched { "matched" } else { "skipped" }
    );
}

/// Count a dead-lettered task
pub fn record_dead_letter(subscription: &str, kind: &'static str) {
    increment_counter!(
        "streamhook_dead_letters_total",
        "subscription" => subscription.to_string(),
        "kind" => kind
    );
}

/// Count a committed checkpoint
pub fn record_checkpoint_saved(subscription: &str) {
    increment_counter!("streamhook_checkpoint_saves_total", "subscription" => subscription.to_string());
}

/// Count a resubscribe attempt
pub fn record_source_reconnect(subscription: &str) {
    increment_counter!("streamhook_source_reconnects_total", "subscription" => subscription.to_string());
}

/// Metrics for a single delivery attempt
///
/// Increments the in-flight gauge on creation. Recording the outcome (or
/// dropping the value, e.g. when the worker is aborted at shutdown)
/// decrements it exactly once.
#[derive(Debug)]
pub struct DeliveryMetrics {
    subscription: String,
    start: Instant,
    recorded: Cell<bool>,
}

impl DeliveryMetrics {
    /// Start tracking an attempt
    ///
    /// # Examples
    ///
    /// ```
    /// use streamhook::metrics::DeliveryMetrics;
    ///
    /// let metrics = DeliveryMetrics::start("gaps");
    /// metrics.record_outcome("delivered");
    /// ```
    pub fn start(subscription: &str) -> Self {
        increment_gauge!("streamhook_deliveries_in_flight", 1.0, "subscription" => subscription.to_string());

        Self {
            subscription: subscription.to_string(),
            start: Instant::now(),
            recorded: Cell::new(false),
        }
    }

    /// Record the attempt's outcome label
    pub fn record_outcome(&self, outcome: &'static str) {
        if self.recorded.get() {
            return;
        }
        self.recorded.set(true);

        histogram!(
            "streamhook_delivery_duration_seconds",
            self.start.elapsed().as_secs_f64(),
            "subscription" => self.subscription.clone(),
            "outcome" => outcome
        );
        increment_counter!(
            "streamhook_delivery_attempts_total",
            "subscription" => self.subscription.clone(),
            "outcome" => outcome
        );
        decrement_gauge!("streamhook_deliveries_in_flight", 1.0, "subscription" => self.subscription.clone());
    }

    /// Time since the attempt started
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for DeliveryMetrics {
    fn drop(&mut self) {
        if !self.recorded.get() {
            decrement_gauge!("streamhook_deliveries_in_flight", 1.0, "subscription" => self.subscription.clone());
        }
    }
}

/// Initializes the metrics exporter for Prometheus
///
/// Only has an effect when built with the `prometheus` feature; otherwise
/// it is a no-op that is still safe to call.
pub fn init_metrics_exporter() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        let builder = PrometheusBuilder::new();
        let _ = builder.install().map_err(|e| {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_outcome_only_once() {
        let metrics = DeliveryMetrics::start("gaps");
        metrics.record_outcome("retryable");
        metrics.record_outcome("delivered");
        assert!(metrics.recorded.get());
    }

    #[test]
    fn test_drop_without_recording() {
        let metrics = DeliveryMetrics::start("gaps");
        assert!(!metrics.recorded.get());
        drop(metrics);
    }

    #[test]
    fn test_counters_without_recorder() {
        record_event_received("gaps");
        record_filter_result("gaps", true);
        record_filter_result("gaps", false);
        record_dead_letter("gaps", "permanent");
        record_checkpoint_saved("gaps");
        record_source_reconnect("gaps");
    }

    #[test]
    fn test_init_metrics_exporter() {
        init_metrics_exporter();
    }
}
