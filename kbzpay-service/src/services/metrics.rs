use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PAYMENT_METRICS: OnceLock<PaymentMetrics> = OnceLock::new();

struct PaymentMetrics {
    registry: Registry,
    transitions: IntCounterVec,
    late_success: IntCounter,
    purchases_materialized: IntCounterVec,
}

impl PaymentMetrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Status transitions by event source (webhook, query, creation)
        let transitions = IntCounterVec::new(
            Opts::new(
                "payment_order_transitions_total",
                "Payment order status transitions by event source and new status",
            ),
            &["source", "status"],
        )?;

        let late_success = IntCounter::new(
            "payment_late_success_total",
            "Paid signals dropped because the order was already failed, expired or cancelled",
        )?;

        let purchases_materialized = IntCounterVec::new(
            Opts::new(
                "payment_purchases_materialized_total",
                "Purchase records written for paid orders by outcome",
            ),
            &["outcome"],
        )?;

        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(late_success.clone()))?;
        registry.register(Box::new(purchases_materialized.clone()))?;

        Ok(Self {
            registry,
            transitions,
            late_success,
            purchases_materialized,
        })
    }
}

/// Install the HTTP metrics recorder and the payment counters.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_none() {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(e) => tracing::warn!(error = %e, "Prometheus recorder not installed"),
        }
    }

    if PAYMENT_METRICS.get().is_none() {
        match PaymentMetrics::new() {
            Ok(metrics) => {
                let _ = PAYMENT_METRICS.set(metrics);
            }
            Err(e) => tracing::error!(error = %e, "Failed to register payment metrics"),
        }
    }
}

pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    if let Some(metrics) = PAYMENT_METRICS.get() {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = metrics.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        if let Ok(custom_metrics) = String::from_utf8(buffer) {
            output.push_str(&custom_metrics);
        }
    }

    output
}

pub fn record_transition(source: &str, status: &str) {
    if let Some(metrics) = PAYMENT_METRICS.get() {
        metrics
            .transitions
            .with_label_values(&[source, status])
            .inc();
    }
}

pub fn record_late_success() {
    if let Some(metrics) = PAYMENT_METRICS.get() {
        metrics.late_success.inc();
    }
}

/// `outcome` is `ok` or `error`.
pub fn record_materialized(outcome: &str, count: u64) {
    if let Some(metrics) = PAYMENT_METRICS.get() {
        metrics
            .purchases_materialized
            .with_label_values(&[outcome])
            .inc_by(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_counters_are_rendered() {
        init_metrics();
        init_metrics();

        record_transition("webhook", "completed");
        record_late_success();
        record_materialized("ok", 2);

        let output = get_metrics();
        assert!(output.contains("payment_order_transitions_total"));
        assert!(output.contains("payment_late_success_total"));
        assert!(output.contains("payment_purchases_materialized_total"));
    }
}
