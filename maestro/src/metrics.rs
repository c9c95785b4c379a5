//! Prometheus metrics instrumentation for maestro.
//!
//! All metrics are conditionally compiled behind the `metrics` feature
//! flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `maestro_jobs_created_total` - Jobs admitted via idempotent creation
//! - `maestro_jobs_completed_total` - Jobs resolved as Completed
//! - `maestro_jobs_failed_total` - Worker-reported failures (by outcome)
//! - `maestro_jobs_stale_total` - Running jobs reclassified by the sweeper
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for maestro metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Counter for jobs admitted via idempotent creation.
///
/// Labels:
/// - `work_type`: The kind of work the job represents
pub static JOBS_CREATED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "maestro_jobs_created_total",
        "Total number of jobs created",
    );
    CounterVec::new(opts, &["work_type"])
        .expect("maestro_jobs_created_total metric creation failed")
});

/// Counter for jobs resolved as Completed.
///
/// Labels:
/// - `work_type`: The kind of work the job represents
pub static JOBS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "maestro_jobs_completed_total",
        "Total number of jobs completed",
    );
    CounterVec::new(opts, &["work_type"])
        .expect("maestro_jobs_completed_total metric creation failed")
});

/// Counter for worker-reported failures.
///
/// Labels:
/// - `work_type`: The kind of work the job represents
/// - `outcome`: `retrying` while budget remains, `permanent` once spent
pub static JOBS_FAILED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "maestro_jobs_failed_total",
        "Total number of worker-reported job failures",
    );
    CounterVec::new(opts, &["work_type", "outcome"])
        .expect("maestro_jobs_failed_total metric creation failed")
});

/// Counter for Running jobs reclassified as Stale by the sweeper.
///
/// Labels:
/// - `work_type`: The kind of work the job represents
pub static JOBS_STALE_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "maestro_jobs_stale_total",
        "Total number of jobs marked stale",
    );
    CounterVec::new(opts, &["work_type"])
        .expect("maestro_jobs_stale_total metric creation failed")
});

/// Register all maestro metrics with the global registry.
///
/// Safe to call multiple times; duplicate registrations are ignored.
pub fn register_metrics() {
    let _ = REGISTRY.register(Box::new(JOBS_CREATED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_COMPLETED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FAILED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_STALE_TOTAL.clone()));
}

pub fn record_job_created(work_type: &str) {
    JOBS_CREATED_TOTAL.with_label_values(&[work_type]).inc();
}

pub fn record_job_completed(work_type: &str) {
    JOBS_COMPLETED_TOTAL.with_label_values(&[work_type]).inc();
}

pub fn record_job_failed(work_type: &str, retryable: bool) {
    let outcome = if retryable { "retrying" } else { "permanent" };
    JOBS_FAILED_TOTAL
        .with_label_values(&[work_type, outcome])
        .inc();
}

pub fn record_job_stale(work_type: &str) {
    JOBS_STALE_TOTAL.with_label_values(&[work_type]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics_is_idempotent() {
        register_metrics();
        register_metrics();

        record_job_created("analysis");
        record_job_failed("analysis", true);
        record_job_failed("analysis", false);
        record_job_stale("generation");

        let families = REGISTRY.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "maestro_jobs_created_total"));
    }
}
