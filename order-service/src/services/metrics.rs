//! Prometheus metrics for order-service.
//!
//! Domain counters live in the default `prometheus` registry. HTTP request
//! metrics from `service_core::middleware::metrics` go through the `metrics`
//! facade and are rendered by the installed Prometheus recorder.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter_vec, CounterVec,
    HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Orders created, labelled by payment method.
pub static ORDERS_CREATED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "order_orders_created_total",
        "Total number of orders created",
        &["payment_method"]
    )
    .expect("Failed to register orders_created_total")
});

/// Checkouts rejected, labelled by reason (stock, voucher, loyalty, validation).
pub static CHECKOUT_REJECTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "order_checkout_rejections_total",
        "Total number of checkouts rejected",
        &["reason"]
    )
    .expect("Failed to register checkout_rejections_total")
});

/// Lifecycle transitions by target status.
pub static STATUS_TRANSITIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "order_status_transitions_total",
        "Total number of order status transitions",
        &["to_status"]
    )
    .expect("Failed to register status_transitions_total")
});

/// Payment confirmations by outcome: confirmed, duplicate, ignored.
pub static PAYMENTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "order_payments_total",
        "Total number of payment confirmations processed",
        &["outcome"]
    )
    .expect("Failed to register payments_total")
});

/// Loyalty points moved, by entry type.
pub static LOYALTY_POINTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "order_loyalty_points_total",
        "Total loyalty points written to the ledger",
        &["entry_type"]
    )
    .expect("Failed to register loyalty_points_total")
});

/// Notifications by kind and outcome: sent, failed, dropped.
pub static NOTIFICATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "order_notifications_total",
        "Total notifications handed to the notifier",
        &["kind", "outcome"]
    )
    .expect("Failed to register notifications_total")
});

/// Database operation duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "order_db_query_duration_seconds",
        "Database operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register db_query_duration")
});

/// Install the HTTP metrics recorder and force the domain metrics.
///
/// Safe to call more than once per process; only the first call installs
/// the recorder.
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_none() {
        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(e) => tracing::warn!(error = %e, "Prometheus recorder not installed"),
        }
    }

    Lazy::force(&ORDERS_CREATED);
    Lazy::force(&CHECKOUT_REJECTIONS);
    Lazy::force(&STATUS_TRANSITIONS);
    Lazy::force(&PAYMENTS);
    Lazy::force(&LOYALTY_POINTS);
    Lazy::force(&NOTIFICATIONS);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    output.push_str(&encoder.encode_to_string(&metric_families).unwrap_or_default());
    output
}
