//! Prometheus collectors for flowq.
//!
//! Compiled only with the `metrics` feature. Collectors are registered in
//! [`REGISTRY`] by [`init_metrics`]; exposing the registry is left to the
//! embedding application.
//!
//! # Metrics
//!
//! ## Counters
//! - `flowq_jobs_added_total`
//! - `flowq_jobs_completed_total`
//! - `flowq_jobs_failed_total` (`outcome`: `retry` or `failed`)
//! - `flowq_jobs_stalled_total` (`outcome`: `recovered` or `failed`)
//! - `flowq_lock_renewal_failures_total`
//!
//! ## Gauges
//! - `flowq_queue_depth` (`state`: one per job state)
//!
//! ## Histograms
//! - `flowq_job_duration_seconds`
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

/// Global Prometheus registry for flowq metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_ADDED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flowq_jobs_added_total", "Total number of jobs added");
    CounterVec::new(opts, &["queue", "job_name"])
        .expect("flowq_jobs_added_total metric creation failed")
});

pub static JOBS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "flowq_jobs_completed_total",
        "Total number of jobs completed",
    );
    CounterVec::new(opts, &["queue", "job_name"])
        .expect("flowq_jobs_completed_total metric creation failed")
});

/// Labels: `queue`, `job_name`, `outcome` (`retry` when the job will run
/// again, `failed` when it reached the failed set).
pub static JOBS_FAILED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flowq_jobs_failed_total", "Total number of failed attempts");
    CounterVec::new(opts, &["queue", "job_name", "outcome"])
        .expect("flowq_jobs_failed_total metric creation failed")
});

pub static JOBS_STALLED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("flowq_jobs_stalled_total", "Total number of stalled jobs");
    CounterVec::new(opts, &["queue", "outcome"])
        .expect("flowq_jobs_stalled_total metric creation failed")
});

pub static LOCK_RENEWAL_FAILURES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "flowq_lock_renewal_failures_total",
        "Total number of job locks that could not be renewed",
    );
    CounterVec::new(opts, &["queue"])
        .expect("flowq_lock_renewal_failures_total metric creation failed")
});

pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("flowq_queue_depth", "Number of jobs per queue and state");
    GaugeVec::new(opts, &["queue", "state"]).expect("flowq_queue_depth metric creation failed")
});

/// Processor run time. Labels: `queue`, `job_name`, `status`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "flowq_job_duration_seconds",
        "Job processing duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["queue", "job_name", "status"])
        .expect("flowq_job_duration_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ADDED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(JOBS_FAILED_TOTAL.clone()),
        Box::new(JOBS_STALLED_TOTAL.clone()),
        Box::new(LOCK_RENEWAL_FAILURES_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_added(queue: &str, job_name: &str) {
    JOBS_ADDED_TOTAL.with_label_values(&[queue, job_name]).inc();
}

pub fn record_job_completed(queue: &str, job_name: &str) {
    JOBS_COMPLETED_TOTAL
        .with_label_values(&[queue, job_name])
        .inc();
}

pub fn record_job_failed(queue: &str, job_name: &str, outcome: &str) {
    JOBS_FAILED_TOTAL
        .with_label_values(&[queue, job_name, outcome])
        .inc();
}

pub fn record_job_stalled(queue: &str, outcome: &str) {
    JOBS_STALLED_TOTAL.with_label_values(&[queue, outcome]).inc();
}

pub fn record_lock_renewal_failed(queue: &str) {
    LOCK_RENEWAL_FAILURES_TOTAL.with_label_values(&[queue]).inc();
}

pub fn set_queue_depth(queue: &str, state: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[queue, state]).set(depth);
}

pub fn observe_job_duration(queue: &str, job_name: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[queue, job_name, status])
        .observe(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_registry_collects_recorded_values() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_added("metrics-test", "send");
        record_job_completed("metrics-test", "send");
        record_job_failed("metrics-test", "send", "retry");
        record_job_stalled("metrics-test", "recovered");
        record_lock_renewal_failed("metrics-test");
        set_queue_depth("metrics-test", "waiting", 3.0);
        observe_job_duration("metrics-test", "send", "completed", 0.25);

        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"flowq_jobs_added_total".to_string()));
        assert!(names.contains(&"flowq_queue_depth".to_string()));
        assert!(names.contains(&"flowq_job_duration_seconds".to_string()));
    }
}
