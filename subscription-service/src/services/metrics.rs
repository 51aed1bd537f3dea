//! Metrics module for subscription-service.
//! Provides Prometheus metrics for billing state changes and the data layer.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram, register_histogram_vec, register_int_counter_vec,
    Encoder, Histogram, HistogramTimer, HistogramVec, IntCounterVec, TextEncoder,
};

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "subscription_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Payment status changes
pub static PAYMENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "subscription_payments_total",
            "Payments by the status they moved to"
        ),
        &["status"]
    )
    .expect("Failed to register PAYMENTS_TOTAL")
});

/// Subscription lifecycle operations
pub static OPERATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "subscription_operations_total",
            "Subscription operations by type"
        ),
        &["operation"]
    )
    .expect("Failed to register OPERATIONS_TOTAL")
});

/// Promo code validation and redemption outcomes
pub static PROMO_REDEMPTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "subscription_promo_redemptions_total",
            "Promo code checks by result"
        ),
        &["result"]
    )
    .expect("Failed to register PROMO_REDEMPTIONS_TOTAL")
});

/// Reads issued per unit of work
pub static UOW_QUERIES: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(histogram_opts!(
        "subscription_uow_queries",
        "Reads issued within one unit of work",
        vec![1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0]
    ))
    .expect("Failed to register UOW_QUERIES")
});

/// Error counter for alerting
pub static ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("subscription_errors_total", "Total errors by type for alerting"),
        &["error_type", "operation"]
    )
    .expect("Failed to register ERRORS_TOTAL")
});

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&PAYMENTS_TOTAL);
    Lazy::force(&OPERATIONS_TOTAL);
    Lazy::force(&PROMO_REDEMPTIONS_TOTAL);
    Lazy::force(&UOW_QUERIES);
    Lazy::force(&ERRORS_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn start_query_timer(operation: &str) -> HistogramTimer {
    DB_QUERY_DURATION
        .with_label_values(&[operation])
        .start_timer()
}

pub fn record_payment_status(status: &str) {
    PAYMENTS_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_operation(operation: &str) {
    OPERATIONS_TOTAL.with_label_values(&[operation]).inc();
}

pub fn record_promo_result(result: &str) {
    PROMO_REDEMPTIONS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_uow_queries(count: usize) {
    UOW_QUERIES.observe(count as f64);
}

pub fn record_error(error_type: &str, operation: &str) {
    ERRORS_TOTAL
        .with_label_values(&[error_type, operation])
        .inc();
}
