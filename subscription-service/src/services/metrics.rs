//! Metrics module for subscription-service.
//! Provides Prometheus metrics for lifecycle, metering and charge operations.

use once_cell::sync::OnceCell;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec,
    register_int_counter_vec, CounterVec, Encoder, HistogramTimer, HistogramVec, IntCounterVec,
    TextEncoder,
};
use service_core::error::AppError;

/// Store query duration histogram
pub static DB_QUERY_DURATION: OnceCell<HistogramVec> = OnceCell::new();

/// Lifecycle operations by operation and outcome
pub static SUBSCRIPTION_OPERATIONS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();

/// Feature usage operations by operation and outcome
pub static USAGE_OPERATIONS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();

/// Charges by kind (immediate / due) and outcome
pub static CHARGES_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();

/// Charged amount by currency (monetary tracking)
pub static CHARGE_AMOUNT_TOTAL: OnceCell<CounterVec> = OnceCell::new();

fn registration_failed(name: &str, e: prometheus::Error) -> AppError {
    AppError::InternalError(anyhow::anyhow!("Failed to register {}: {}", name, e))
}

/// Initialize all metrics. Safe to call more than once.
pub fn init_metrics() -> Result<(), AppError> {
    DB_QUERY_DURATION.get_or_try_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "subscription_db_query_duration_seconds",
                "Store query duration",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
            ),
            &["operation"]
        )
        .map_err(|e| registration_failed("DB_QUERY_DURATION", e))
    })?;

    SUBSCRIPTION_OPERATIONS_TOTAL.get_or_try_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_operations_total",
                "Total lifecycle operations by operation and outcome"
            ),
            &["operation", "outcome"]
        )
        .map_err(|e| registration_failed("SUBSCRIPTION_OPERATIONS_TOTAL", e))
    })?;

    USAGE_OPERATIONS_TOTAL.get_or_try_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_usage_operations_total",
                "Total feature usage operations by operation and outcome"
            ),
            &["operation", "outcome"]
        )
        .map_err(|e| registration_failed("USAGE_OPERATIONS_TOTAL", e))
    })?;

    CHARGES_TOTAL.get_or_try_init(|| {
        register_int_counter_vec!(
            opts!("subscription_charges_total", "Total charges by kind and outcome"),
            &["kind", "outcome"]
        )
        .map_err(|e| registration_failed("CHARGES_TOTAL", e))
    })?;

    CHARGE_AMOUNT_TOTAL.get_or_try_init(|| {
        register_counter_vec!(
            opts!(
                "subscription_charge_amount_total",
                "Total captured amount by currency and kind"
            ),
            &["currency", "kind"]
        )
        .map_err(|e| registration_failed("CHARGE_AMOUNT_TOTAL", e))
    })?;

    Ok(())
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> Result<String, AppError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Metrics are not UTF-8: {}", e)))
}

/// Start a query timer. The duration is observed when the timer drops.
pub fn query_timer(operation: &str) -> Option<HistogramTimer> {
    DB_QUERY_DURATION
        .get()
        .map(|histogram| histogram.with_label_values(&[operation]).start_timer())
}

/// Record a lifecycle operation.
pub fn record_subscription_operation(operation: &str, outcome: &str) {
    if let Some(counter) = SUBSCRIPTION_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation, outcome]).inc();
    }
}

/// Record a usage operation.
pub fn record_usage_operation(operation: &str, outcome: &str) {
    if let Some(counter) = USAGE_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation, outcome]).inc();
    }
}

/// Record a charge attempt.
pub fn record_charge(kind: &str, outcome: &str) {
    if let Some(counter) = CHARGES_TOTAL.get() {
        counter.with_label_values(&[kind, outcome]).inc();
    }
}

/// Record a captured amount for financial tracking.
pub fn record_charge_amount(currency: &str, kind: &str, amount: f64) {
    if let Some(counter) = CHARGE_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[currency, kind])
            .inc_by(amount.abs());
    }
}
