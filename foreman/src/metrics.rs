//! Prometheus metrics for foreman, compiled behind the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `foreman_jobs_enqueued_total` - jobs enqueued, by kind and class
//! - `foreman_jobs_dispatched_total` - worker launches, by kind and class
//! - `foreman_jobs_finished_total` - worker outcomes, by kind and status
//! - `foreman_stale_recovered_total` - stale jobs requeued or exhausted
//!
//! ## Gauges
//! - `foreman_class_active` - leased/running jobs per resource class
//!
//! ## Histograms
//! - `foreman_job_duration_seconds` - job body duration
#![cfg(feature = "metrics")]

use std::sync::LazyLock;

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("foreman_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["job_kind", "resource_class"])
        .expect("foreman_jobs_enqueued_total metric creation failed")
});

pub static JOBS_DISPATCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "foreman_jobs_dispatched_total",
        "Total number of worker processes launched",
    );
    CounterVec::new(opts, &["job_kind", "resource_class"])
        .expect("foreman_jobs_dispatched_total metric creation failed")
});

/// Labels: `job_kind`, `status` (done, failed, retrying, canceled).
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("foreman_jobs_finished_total", "Total number of worker outcomes");
    CounterVec::new(opts, &["job_kind", "status"])
        .expect("foreman_jobs_finished_total metric creation failed")
});

/// Labels: `job_kind`, `outcome` (requeued, exhausted).
pub static STALE_RECOVERED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "foreman_stale_recovered_total",
        "Total number of jobs recovered after heartbeat loss",
    );
    CounterVec::new(opts, &["job_kind", "outcome"])
        .expect("foreman_stale_recovered_total metric creation failed")
});

pub static CLASS_ACTIVE: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "foreman_class_active",
        "Leased or running jobs per resource class",
    );
    GaugeVec::new(opts, &["resource_class"])
        .expect("foreman_class_active metric creation failed")
});

pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    // Jobs run from seconds to hours.
    let buckets = exponential_buckets(0.5, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "foreman_job_duration_seconds",
        "Job body execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_kind", "status"])
        .expect("foreman_job_duration_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_DISPATCHED_TOTAL.clone()),
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(STALE_RECOVERED_TOTAL.clone()),
        Box::new(CLASS_ACTIVE.clone()),
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

pub fn record_job_enqueued(job_kind: &str, resource_class: &str) {
    JOBS_ENQUEUED_TOTAL
        .with_label_values(&[job_kind, resource_class])
        .inc();
}

pub fn record_job_dispatched(job_kind: &str, resource_class: &str) {
    JOBS_DISPATCHED_TOTAL
        .with_label_values(&[job_kind, resource_class])
        .inc();
}

pub fn record_job_finished(job_kind: &str, status: &str) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[job_kind, status])
        .inc();
}

pub fn record_stale_recovered(job_kind: &str, outcome: &str) {
    STALE_RECOVERED_TOTAL
        .with_label_values(&[job_kind, outcome])
        .inc();
}

pub fn set_class_utilization(resource_class: &str, active: f64) {
    CLASS_ACTIVE.with_label_values(&[resource_class]).set(active);
}

pub fn observe_job_duration(job_kind: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[job_kind, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
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
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_enqueued("gpu_probe", "heavy_ai_gpu");
        record_job_dispatched("gpu_probe", "heavy_ai_gpu");
        record_job_finished("gpu_probe", "done");
        record_stale_recovered("sleep", "requeued");
        set_class_utilization("light_cpu", 2.0);
        observe_job_duration("sleep", "done", 1.5);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("foreman_jobs_enqueued_total"));
        assert!(output.contains("foreman_jobs_finished_total"));
        assert!(output.contains("foreman_class_active"));
    }
}
