//! Prometheus metrics for the engagement jobs
//!
//! Tracks execution status, latency and batch failures of every scheduled
//! subsystem. Everything is registered in the crate [`REGISTRY`].
//!
//! The crate serves no HTTP itself. The embedding service scrapes through
//! [`gather_text`] or registers [`REGISTRY`] with its own exporter.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge_vec_with_registry, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, Encoder,
    GaugeVec, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};

use crate::models::HealthStatus;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Total job executions (labels: job_name, status=success|failed|panicked)
pub static JOB_RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "engagement_job_runs_total",
        "Total number of engagement job executions",
        &["job_name", "status"],
        REGISTRY
    )
    .expect("Failed to register metric")
});

/// Job execution duration in seconds (labels: job_name)
pub static JOB_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec_with_registry!(
        "engagement_job_duration_seconds",
        "Time spent executing engagement jobs",
        &["job_name"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0],
        REGISTRY
    )
    .expect("Failed to register metric")
});

/// Entities handled per run (labels: job_name, outcome=succeeded|failed)
pub static JOB_ITEMS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "engagement_job_items_total",
        "Entities processed by engagement jobs",
        &["job_name", "outcome"],
        REGISTRY
    )
    .expect("Failed to register metric")
});

/// Health of the last run (2=healthy, 1=warning, 0=error) (labels: job_name)
pub static JOB_HEALTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec_with_registry!(
        "engagement_job_health",
        "Health status of the last job run (2=healthy, 1=warning, 0=error)",
        &["job_name"],
        REGISTRY
    )
    .expect("Failed to register metric")
});

/// Success rate of the last run (labels: job_name)
pub static JOB_SUCCESS_RATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec_with_registry!(
        "engagement_job_success_rate",
        "Share of entities handled successfully in the last run",
        &["job_name"],
        REGISTRY
    )
    .expect("Failed to register metric")
});

/// Consecutive failed runs (labels: job_name)
pub static JOB_CONSECUTIVE_FAILURES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec_with_registry!(
        "engagement_job_consecutive_failures",
        "Number of consecutive failed runs of a job",
        &["job_name"],
        REGISTRY
    )
    .expect("Failed to register metric")
});

fn health_value(status: HealthStatus) -> i64 {
    match status {
        HealthStatus::Healthy => 2,
        HealthStatus::Warning => 1,
        HealthStatus::Error => 0,
    }
}

/// Record a run that completed, possibly with per-entity failures
pub fn record_job_success(
    job_name: &str,
    duration_ms: u64,
    succeeded: u64,
    failed: u64,
    success_rate: f64,
    status: HealthStatus,
) {
    JOB_RUNS_TOTAL
        .with_label_values(&[job_name, "success"])
        .inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[job_name])
        .observe(duration_ms as f64 / 1000.0);
    JOB_ITEMS_TOTAL
        .with_label_values(&[job_name, "succeeded"])
        .inc_by(succeeded);
    JOB_ITEMS_TOTAL
        .with_label_values(&[job_name, "failed"])
        .inc_by(failed);
    JOB_SUCCESS_RATE
        .with_label_values(&[job_name])
        .set(success_rate);
    JOB_HEALTH
        .with_label_values(&[job_name])
        .set(health_value(status));
    JOB_CONSECUTIVE_FAILURES
        .with_label_values(&[job_name])
        .set(0);
}

/// Record a run that failed as a whole (`status` is failed or panicked)
pub fn record_job_failure(job_name: &str, status: &str, duration_ms: u64, consecutive_failures: u32) {
    JOB_RUNS_TOTAL.with_label_values(&[job_name, status]).inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[job_name])
        .observe(duration_ms as f64 / 1000.0);
    JOB_SUCCESS_RATE.with_label_values(&[job_name]).set(0.0);
    JOB_HEALTH
        .with_label_values(&[job_name])
        .set(health_value(HealthStatus::Error));
    JOB_CONSECUTIVE_FAILURES
        .with_label_values(&[job_name])
        .set(consecutive_failures as i64);
}

/// Text exposition of every registered metric
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
