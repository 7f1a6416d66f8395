//! Prometheus metrics for metering-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, CounterVec, Encoder,
    HistogramVec, IntGauge, TextEncoder,
};

/// Counter for reconciliation runs by outcome.
pub static BILLING_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "metering_billing_runs_total",
        "Total number of billing reconciliation runs",
        &["outcome"]
    )
    .expect("Failed to register BILLING_RUNS")
});

/// Counter for usage batch submissions by classified response.
pub static USAGE_SUBMISSIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "metering_usage_submissions_total",
        "Total number of usage batch submissions",
        &["status"]
    )
    .expect("Failed to register USAGE_SUBMISSIONS")
});

/// Counter for individual usage records that failed.
pub static USAGE_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "metering_usage_failures_total",
        "Total number of usage records that were not accepted",
        &["reason"]
    )
    .expect("Failed to register USAGE_FAILURES")
});

/// Number of records currently held in the failure queue.
pub static FAILURE_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "metering_failure_queue_depth",
        "Number of outstanding records in the billing failure queue"
    )
    .expect("Failed to register FAILURE_QUEUE_DEPTH")
});

/// Counter for escalation notifications by dispatch status.
pub static ESCALATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "metering_escalations_total",
        "Total number of billing failure escalations",
        &["status"]
    )
    .expect("Failed to register ESCALATIONS")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "metering_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "metering_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&BILLING_RUNS);
    Lazy::force(&USAGE_SUBMISSIONS);
    Lazy::force(&USAGE_FAILURES);
    Lazy::force(&FAILURE_QUEUE_DEPTH);
    Lazy::force(&ESCALATIONS);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record the outcome of a reconciliation run.
pub fn record_billing_run(outcome: &str) {
    BILLING_RUNS.with_label_values(&[outcome]).inc();
}

/// Record a classified usage submission.
pub fn record_usage_submission(status: &str) {
    USAGE_SUBMISSIONS.with_label_values(&[status]).inc();
}

/// Record failed usage records.
pub fn record_usage_failures(reason: &str, count: usize) {
    USAGE_FAILURES
        .with_label_values(&[reason])
        .inc_by(count as f64);
}

/// Set the failure queue depth.
pub fn set_failure_queue_depth(depth: usize) {
    FAILURE_QUEUE_DEPTH.set(i64::try_from(depth).unwrap_or(i64::MAX));
}

/// Record an escalation attempt.
pub fn record_escalation(status: &str) {
    ESCALATIONS.with_label_values(&[status]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
