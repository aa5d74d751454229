//! Tracing and telemetry instrumentation for foreman.
//!
//! Span constructors for the dispatch loop, worker runtime, heartbeats and
//! GPU management, plus `record_*` helpers that log and, with the `metrics`
//! feature, update the Prometheus collectors in [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use foreman::telemetry::{dispatch_span, record_job_enqueued};
//!
//! let span = dispatch_span(job_id, "gpu_probe", ResourceClass::HeavyAiGpu);
//! let _enter = span.enter();
//! record_job_enqueued("gpu_probe", ResourceClass::HeavyAiGpu);
//! ```

use std::future::Future;
use std::time::Instant;

use tracing::{info_span, Instrument, Span};

use crate::job::{JobId, ResourceClass};

/// Span for a single dispatch decision.
#[must_use]
pub fn dispatch_span(
    job_id: JobId,
    kind: impl AsRef<str>,
    resource_class: ResourceClass,
) -> Span {
    info_span!(
        "foreman.dispatch",
        job_id = %job_id,
        job_kind = %kind.as_ref(),
        resource_class = %resource_class,
    )
}

/// Span covering a worker's execution of one job.
#[must_use]
pub fn worker_span(
    job_id: JobId,
    kind: impl AsRef<str>,
    lease_owner: impl AsRef<str>,
) -> Span {
    info_span!(
        "foreman.worker",
        job_id = %job_id,
        job_kind = %kind.as_ref(),
        lease_owner = %lease_owner.as_ref(),
    )
}

#[must_use]
pub fn heartbeat_span(job_id: JobId, lease_owner: impl AsRef<str>) -> Span {
    info_span!(
        "foreman.heartbeat",
        job_id = %job_id,
        lease_owner = %lease_owner.as_ref(),
    )
}

/// Span for the reconcile and stale-recovery passes of a tick.
#[must_use]
pub fn reconcile_span() -> Span {
    info_span!("foreman.reconcile")
}

#[must_use]
pub fn gpu_span(operation: &'static str) -> Span {
    info_span!("foreman.gpu", operation = operation)
}

/// Instrument a future with a worker span.
pub fn instrument_worker<F>(
    job_id: JobId,
    kind: impl AsRef<str>,
    lease_owner: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(worker_span(job_id, kind, lease_owner))
}

pub fn record_job_enqueued(kind: impl AsRef<str>, resource_class: ResourceClass) {
    tracing::info!(
        job_kind = %kind.as_ref(),
        resource_class = %resource_class,
        "job enqueued"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(kind.as_ref(), resource_class.as_str());
}

pub fn record_job_dispatched(
    job_id: JobId,
    kind: impl AsRef<str>,
    resource_class: ResourceClass,
    attempt: u32,
) {
    tracing::info!(
        job_id = %job_id,
        job_kind = %kind.as_ref(),
        resource_class = %resource_class,
        attempt,
        "job dispatched"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_dispatched(kind.as_ref(), resource_class.as_str());
}

/// Record a worker reaching an outcome (`done`, `failed`, `retrying`,
/// `canceled`).
pub fn record_job_finished(
    job_id: JobId,
    kind: impl AsRef<str>,
    status: impl AsRef<str>,
) {
    tracing::info!(
        job_id = %job_id,
        job_kind = %kind.as_ref(),
        status = %status.as_ref(),
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(kind.as_ref(), status.as_ref());
}

/// Record a stale job being requeued or exhausted.
pub fn record_stale_recovered(
    job_id: JobId,
    kind: impl AsRef<str>,
    outcome: impl AsRef<str>,
) {
    tracing::warn!(
        job_id = %job_id,
        job_kind = %kind.as_ref(),
        outcome = %outcome.as_ref(),
        "stale job recovered"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_stale_recovered(kind.as_ref(), outcome.as_ref());
}

pub fn set_class_utilization(resource_class: ResourceClass, active: usize, limit: usize) {
    tracing::debug!(
        resource_class = %resource_class,
        active,
        limit,
        "class utilization updated"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_class_utilization(resource_class.as_str(), active as f64);
}

/// Start timing a job body. Pass the handle to [`record_job_end`].
pub fn record_job_start(job_id: JobId) -> JobTimingHandle {
    JobTimingHandle {
        job_id,
        start: Instant::now(),
    }
}

pub fn record_job_end(
    handle: JobTimingHandle,
    kind: impl AsRef<str>,
    status: impl AsRef<str>,
) {
    let duration_secs = handle.start.elapsed().as_secs_f64();
    tracing::info!(
        job_id = %handle.job_id,
        job_kind = %kind.as_ref(),
        status = %status.as_ref(),
        duration_secs,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(kind.as_ref(), status.as_ref(), duration_secs);
}

/// Opaque timing handle returned by [`record_job_start`].
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: JobId,
    start: Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        let span = dispatch_span(JobId(1), "gpu_probe", ResourceClass::HeavyAiGpu);
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "foreman.dispatch");
        }
        let span = heartbeat_span(JobId(1), "job-1-x");
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "foreman.heartbeat");
        }
    }

    #[test]
    fn test_timing_handle() {
        let handle = record_job_start(JobId(9));
        assert_eq!(handle.job_id(), JobId(9));
        record_job_end(handle, "sleep", "done");
    }

    #[tokio::test]
    async fn test_instrument_worker_preserves_output() {
        let value = instrument_worker(JobId(2), "sleep", "job-2-x", async { 7 }).await;
        assert_eq!(value, 7);
    }
}
