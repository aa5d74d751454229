use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::events::{self, bounded_trace, EventCode, NewEvent, Severity};
use crate::job::{ErrorCode, JobId, JobRecord, JobStatus};
use crate::lease::{compute_retry_delay, retry_available_at, RetryConfig};
use crate::queue::JobStore;
use crate::registry::Registry;
use crate::telemetry;

use super::launcher::LaunchRequest;

/// Handle passed to a job body while it runs.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    kind: String,
    lease_owner: String,
    attempt: u32,
    store: Arc<dyn JobStore>,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        kind: impl Into<String>,
        lease_owner: impl Into<String>,
        attempt: u32,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            job_id,
            kind: kind.into(),
            lease_owner: lease_owner.into(),
            attempt,
            store,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn lease_owner(&self) -> &str {
        &self.lease_owner
    }

    /// 1-based attempt number of this dispatch.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Overwrite the job's checkpoint with the complete resumable state.
    pub async fn save_checkpoint(&self, checkpoint: &Value) -> anyhow::Result<()> {
        self.store.save_checkpoint(self.job_id, checkpoint).await
    }

    /// True once the job was canceled or handed to another worker. Long
    /// running bodies should poll this between units of work.
    pub async fn is_canceled(&self) -> anyhow::Result<bool> {
        let job = self.store.get_job(self.job_id).await?;
        Ok(match job {
            Some(job) => {
                job.status == JobStatus::Canceled
                    || job.lease_owner.as_deref() != Some(self.lease_owner.as_str())
            }
            None => true,
        })
    }

    /// Append a job-scoped event. Custom codes start at
    /// [`EventCode::FIRST_CUSTOM`].
    pub async fn emit(&self, severity: Severity, code: EventCode, data: Value) {
        events::emit(
            self.store.as_ref(),
            NewEvent::job(self.job_id, severity, code, data),
        )
        .await;
    }
}

/// How a worker left a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    /// Back to `queued` with a backoff.
    Retrying { delay_ms: u64 },
    Failed { code: ErrorCode },
    Canceled,
    /// The job is no longer owned by this worker (requeued as stale or
    /// re-dispatched); nothing was written.
    Superseded,
}

impl WorkerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "done",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::Canceled => "canceled",
            Self::Superseded => "superseded",
        }
    }
}

const OOM_SIGNATURES: &[&str] = &[
    "cuda out of memory",
    "out of memory",
    "cuda_error_out_of_memory",
    "cudaerrormemoryallocation",
    "outofmemoryerror",
    "cublas_status_alloc_failed",
];

const RATE_LIMIT_SIGNATURES: &[&str] =
    &["rate limit", "rate-limit", "ratelimit", "too many requests"];

/// Map a job body's error text to an error code.
pub fn classify_failure(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();
    if OOM_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
        return ErrorCode::CudaOom;
    }
    let has_429 = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == "429");
    if has_429 || RATE_LIMIT_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
        return ErrorCode::RateLimit;
    }
    ErrorCode::Error
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Periodic heartbeat for one job, stopped through a channel.
struct Heartbeat {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn start(
        store: Arc<dyn JobStore>,
        job_id: JobId,
        owner: String,
        resource: Option<String>,
        interval: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let span = telemetry::heartbeat_span(job_id, &owner);

        let handle = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = stop_rx.recv() => break,
                    }

                    match store
                        .heartbeat(job_id, &owner, resource.as_deref(), Utc::now())
                        .await
                    {
                        Ok(true) => tracing::trace!("heartbeat"),
                        Ok(false) => {
                            debug!("heartbeat rejected, job no longer owned");
                            break;
                        }
                        Err(err) => warn!("heartbeat failed: {err:#}"),
                    }
                }
            }
            .instrument(span),
        );

        Self { stop_tx, handle }
    }

    async fn stop(self) {
        let _ = self.stop_tx.try_send(());
        let _ = self.handle.await;
    }
}

/// Runs a single leased job to a terminal or requeued state.
///
/// This is the body of a worker process; tests drive it in-process.
#[derive(Clone)]
pub struct WorkerRuntime {
    store: Arc<dyn JobStore>,
    registry: Arc<Registry>,
    heartbeat_interval: Duration,
    retry: RetryConfig,
}

impl WorkerRuntime {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<Registry>) -> Self {
        Self {
            store,
            registry,
            heartbeat_interval: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Execute the job. Any resource lease named in the request is released
    /// for this owner on every path, including errors.
    pub async fn execute(&self, request: LaunchRequest) -> anyhow::Result<WorkerOutcome> {
        let outcome = telemetry::instrument_worker(
            request.job_id,
            &request.kind,
            &request.lease_owner,
            self.run_job(&request),
        )
        .await;

        if let Some(resource) = &request.gpu_resource {
            match self
                .store
                .release_lock(resource, &request.lease_owner)
                .await
            {
                Ok(released) => debug!(
                    job_id = %request.job_id,
                    resource = %resource,
                    released,
                    "worker released resource lease"
                ),
                Err(err) => warn!(
                    job_id = %request.job_id,
                    resource = %resource,
                    "releasing resource lease failed: {err:#}"
                ),
            }
        }

        if let Ok(outcome) = &outcome {
            telemetry::record_job_finished(request.job_id, &request.kind, outcome.as_str());
        }
        outcome
    }

    async fn run_job(&self, request: &LaunchRequest) -> anyhow::Result<WorkerOutcome> {
        let job_id = request.job_id;
        let owner = request.lease_owner.as_str();

        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;
        if job.status == JobStatus::Canceled {
            return Ok(WorkerOutcome::Canceled);
        }
        if job.lease_owner.as_deref() != Some(owner) {
            return Ok(WorkerOutcome::Superseded);
        }

        let spec = match self.registry.get(&request.kind) {
            Ok(spec) => spec.clone(),
            Err(err) => {
                let message = format!("{err:#}");
                self.store
                    .fail_owned(job_id, owner, ErrorCode::Error, &message, Utc::now())
                    .await?;
                self.emit(
                    job_id,
                    Severity::Error,
                    EventCode::JOB_FAILED,
                    json!({ "code": ErrorCode::Error, "message": message }),
                )
                .await;
                return Ok(WorkerOutcome::Failed {
                    code: ErrorCode::Error,
                });
            }
        };

        let checkpoint = self.store.load_checkpoint(job_id).await?;

        if !self.store.mark_running(job_id, owner, Utc::now()).await? {
            return self.lost_ownership(job_id).await;
        }
        self.emit(
            job_id,
            Severity::Info,
            EventCode::JOB_STARTED,
            json!({
                "attempt": job.attempts,
                "resumed": checkpoint.is_some(),
                "pid": std::process::id(),
            }),
        )
        .await;

        // A cancel may land between dispatch and start.
        if self.is_canceled(job_id).await? {
            return Ok(WorkerOutcome::Canceled);
        }

        let heartbeat = Heartbeat::start(
            Arc::clone(&self.store),
            job_id,
            owner.to_string(),
            request.gpu_resource.clone(),
            self.heartbeat_interval,
        );

        let ctx = JobContext::new(
            job_id,
            &request.kind,
            owner,
            job.attempts,
            Arc::clone(&self.store),
        );
        let timing = telemetry::record_job_start(job_id);
        let result = AssertUnwindSafe(spec.handler.run(
            &ctx,
            job.payload.clone(),
            checkpoint,
        ))
        .catch_unwind()
        .await;

        heartbeat.stop().await;

        let result = match result {
            Ok(result) => result,
            Err(panic) => Err(anyhow!("job panicked: {}", panic_message(panic.as_ref()))),
        };

        let outcome = match result {
            Ok(()) => {
                if self.store.mark_done(job_id, owner, Utc::now()).await? {
                    self.emit(job_id, Severity::Info, EventCode::JOB_COMPLETED, json!({}))
                        .await;
                    WorkerOutcome::Completed
                } else {
                    self.lost_ownership(job_id).await?
                }
            }
            Err(err) => self.handle_failure(&job, owner, err).await?,
        };

        telemetry::record_job_end(timing, &request.kind, outcome.as_str());
        Ok(outcome)
    }

    async fn handle_failure(
        &self,
        job: &JobRecord,
        owner: &str,
        err: anyhow::Error,
    ) -> anyhow::Result<WorkerOutcome> {
        let message = bounded_trace(&format!("{err:#}"));
        let trace = bounded_trace(&format!("{err:?}"));
        let code = classify_failure(&message);

        if code.is_retryable() && job.has_attempts_remaining() {
            let delay = compute_retry_delay(job.attempts, &self.retry);
            let delay_ms = delay.num_milliseconds().max(0) as u64;
            let available_at = retry_available_at(Utc::now(), delay);
            if !self
                .store
                .requeue_owned(job.id, owner, available_at, code, &message)
                .await?
            {
                return self.lost_ownership(job.id).await;
            }
            self.emit(
                job.id,
                Severity::Warn,
                EventCode::JOB_RETRYING,
                json!({
                    "code": code,
                    "message": message,
                    "trace": trace,
                    "attempt": job.attempts,
                    "max_attempts": job.max_attempts,
                    "delay_ms": delay_ms,
                }),
            )
            .await;
            return Ok(WorkerOutcome::Retrying { delay_ms });
        }

        if !self
            .store
            .fail_owned(job.id, owner, code, &message, Utc::now())
            .await?
        {
            return self.lost_ownership(job.id).await;
        }
        self.emit(
            job.id,
            Severity::Error,
            EventCode::JOB_FAILED,
            json!({
                "code": code,
                "message": message,
                "trace": trace,
                "attempt": job.attempts,
            }),
        )
        .await;
        Ok(WorkerOutcome::Failed { code })
    }

    async fn is_canceled(&self, job_id: JobId) -> anyhow::Result<bool> {
        Ok(self
            .store
            .get_job(job_id)
            .await?
            .is_some_and(|job| job.status == JobStatus::Canceled))
    }

    async fn lost_ownership(&self, job_id: JobId) -> anyhow::Result<WorkerOutcome> {
        if self.is_canceled(job_id).await? {
            Ok(WorkerOutcome::Canceled)
        } else {
            debug!(job_id = %job_id, "job superseded, leaving state untouched");
            Ok(WorkerOutcome::Superseded)
        }
    }

    async fn emit(&self, job_id: JobId, severity: Severity, code: EventCode, data: Value) {
        events::emit(self.store.as_ref(), NewEvent::job(job_id, severity, code, data)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_oom() {
        assert_eq!(
            classify_failure("RuntimeError: CUDA out of memory. Tried to allocate 2 GiB"),
            ErrorCode::CudaOom
        );
        assert_eq!(
            classify_failure("CUBLAS_STATUS_ALLOC_FAILED when calling cublasCreate"),
            ErrorCode::CudaOom
        );
    }

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(
            classify_failure("HTTP 429: slow down"),
            ErrorCode::RateLimit
        );
        assert_eq!(
            classify_failure("upstream said Too Many Requests"),
            ErrorCode::RateLimit
        );
        assert_eq!(classify_failure("Rate-limit exceeded"), ErrorCode::RateLimit);
        // Not a standalone 429 token.
        assert_eq!(classify_failure("processed 14290 frames"), ErrorCode::Error);
    }

    #[test]
    fn test_classify_generic() {
        assert_eq!(classify_failure("file not found"), ErrorCode::Error);
    }

    #[test]
    fn test_panic_message() {
        let panic: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(panic.as_ref()), "boom");
        let panic: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(panic.as_ref()), "bang");
        let panic: Box<dyn Any + Send> = Box::new(5u8);
        assert_eq!(panic_message(panic.as_ref()), "unknown panic payload");
    }
}
