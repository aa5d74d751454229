use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn, Instrument};

use crate::budget::ClassBudget;
use crate::config::SchedulerConfig;
use crate::events::{self, bounded_trace, EventCode, JobEvent, NewEvent, Severity};
use crate::gpu::{GpuManager, GpuProbe, Preflight};
use crate::job::{ErrorCode, JobFilter, JobId, JobRecord, JobStatus, NewJob, ResourceClass};
use crate::lease::{
    compute_retry_delay, process_stale_job, retry_available_at, stale_cutoff, LeaseOwner,
    ResourceLease, StaleOutcome, GPU_RESOURCE,
};
use crate::queue::{JobStore, QueueSnapshot, ResourceSnapshotEntry};
use crate::registry::{PreconditionContext, Registry};
use crate::telemetry;

use super::launcher::{LaunchRequest, WorkerHandle, WorkerLauncher};

/// Token for signaling graceful shutdown to the dispatch loop.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of [`Scheduler::cancel_job`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    Canceled { terminated_process: bool },
    AlreadyCanceled,
    /// The job already reached `done` or `failed`.
    NotCancelable { status: JobStatus },
    NotFound,
}

/// What a single tick did, for tests and logs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reconciled: usize,
    pub swept_locks: usize,
    pub stale_requeued: Vec<JobId>,
    pub stale_failed: Vec<JobId>,
    pub paused: bool,
    pub dispatched: Vec<JobId>,
    pub failed: Vec<JobId>,
}

#[derive(Debug)]
struct TrackedWorker {
    handle: Box<dyn WorkerHandle>,
    kind: String,
    lease_owner: String,
    started: Instant,
}

/// Long-lived control loop: owns the durable queue, dispatches eligible jobs
/// into workers and recovers jobs whose heartbeat went silent.
///
/// The in-memory worker set only serves reconciliation and cancellation; it
/// starts empty on every restart and everything else is rebuilt from the
/// store each tick.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    registry: Arc<Registry>,
    gpu: GpuManager,
    launcher: Arc<dyn WorkerLauncher>,
    running: Mutex<HashMap<JobId, TrackedWorker>>,
    shutdown: ShutdownToken,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracked = self
            .running
            .try_lock()
            .map(|running| running.len())
            .unwrap_or_default();

        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("tracked_workers", &tracked)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        registry: Arc<Registry>,
        gpu_probe: Arc<dyn GpuProbe>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let gpu = GpuManager::new(
            Arc::clone(&store),
            gpu_probe,
            config.gpu_policy(),
            config.lease_ttl_secs,
        );
        Self {
            config,
            store,
            registry,
            gpu,
            launcher,
            running: Mutex::new(HashMap::new()),
            shutdown: ShutdownToken::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn gpu(&self) -> &GpuManager {
        &self.gpu
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Persist a new `queued` job. Fails for kinds missing from the registry.
    /// `max_attempts` defaults to the configured value and is at least 1.
    pub async fn enqueue(
        &self,
        kind: &str,
        payload: Value,
        priority: i64,
        max_attempts: Option<u32>,
    ) -> anyhow::Result<JobId> {
        let spec = self.registry.get(kind)?;
        let max_attempts = max_attempts
            .unwrap_or(self.config.default_max_attempts)
            .max(1);
        let vram_estimate_mb = spec.handler.estimate_vram_mb(&payload);
        let runtime_estimate_secs = spec.handler.estimate_runtime_secs(&payload);

        let id = self
            .store
            .insert_job(NewJob {
                kind: kind.to_string(),
                payload,
                priority,
                max_attempts,
                resource_class: spec.resource_class,
                vram_estimate_mb,
                runtime_estimate_secs,
            })
            .await?;

        telemetry::record_job_enqueued(kind, spec.resource_class);
        self.emit_job(
            id,
            Severity::Info,
            EventCode::JOB_ENQUEUED,
            json!({
                "kind": kind,
                "priority": priority,
                "resource_class": spec.resource_class,
                "max_attempts": max_attempts,
                "vram_estimate_mb": vram_estimate_mb,
                "runtime_estimate_secs": runtime_estimate_secs,
            }),
        )
        .await;
        Ok(id)
    }

    /// Stop dispatching new jobs. In-flight jobs continue.
    pub async fn pause_all(&self) -> anyhow::Result<()> {
        self.store.set_paused(true).await?;
        self.emit_scheduler(Severity::Info, EventCode::SCHEDULER_PAUSED, json!({}))
            .await;
        Ok(())
    }

    pub async fn resume_all(&self) -> anyhow::Result<()> {
        self.store.set_paused(false).await?;
        self.emit_scheduler(Severity::Info, EventCode::SCHEDULER_RESUMED, json!({}))
            .await;
        Ok(())
    }

    /// `queued -> paused`. Returns false when the job is not queued.
    pub async fn pause_job(&self, id: JobId) -> anyhow::Result<bool> {
        let moved = self
            .store
            .transition(id, JobStatus::Queued, JobStatus::Paused)
            .await?;
        if moved {
            self.emit_job(id, Severity::Info, EventCode::JOB_PAUSED, json!({}))
                .await;
        } else {
            info!(job_id = %id, "pause ignored, job is not queued");
        }
        Ok(moved)
    }

    /// `paused -> queued`. Returns false when the job is not paused.
    pub async fn resume_job(&self, id: JobId) -> anyhow::Result<bool> {
        let moved = self
            .store
            .transition(id, JobStatus::Paused, JobStatus::Queued)
            .await?;
        if moved {
            self.emit_job(id, Severity::Info, EventCode::JOB_RESUMED, json!({}))
                .await;
        } else {
            info!(job_id = %id, "resume ignored, job is not paused");
        }
        Ok(moved)
    }

    /// Terminate any tracked worker, mark the job `canceled` and release its
    /// resource lease. Idempotent.
    pub async fn cancel_job(&self, id: JobId) -> anyhow::Result<CancelOutcome> {
        let Some(job) = self.store.get_job(id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        match job.status {
            JobStatus::Canceled => return Ok(CancelOutcome::AlreadyCanceled),
            status if status.is_terminal() => {
                return Ok(CancelOutcome::NotCancelable { status })
            }
            _ => {}
        }

        let tracked = self.running.lock().await.remove(&id);
        let mut terminated_process = false;
        if let Some(mut worker) = tracked {
            match worker.handle.terminate() {
                Ok(()) => terminated_process = true,
                Err(err) => warn!(job_id = %id, "terminating worker failed: {err:#}"),
            }
        }

        if !self.store.cancel_job(id, Utc::now()).await? {
            // Raced with the worker reaching a terminal state.
            return Ok(match self.store.get_job(id).await? {
                Some(job) if job.status == JobStatus::Canceled => CancelOutcome::AlreadyCanceled,
                Some(job) => CancelOutcome::NotCancelable { status: job.status },
                None => CancelOutcome::NotFound,
            });
        }

        if let Some(owner) = &job.lease_owner {
            if let Err(err) = self.gpu.release(owner).await {
                warn!(job_id = %id, "{err:#}, left for the orphan-lock sweep");
            }
        }

        self.emit_job(
            id,
            Severity::Info,
            EventCode::JOB_CANCELED,
            json!({
                "previous_status": job.status,
                "terminated_process": terminated_process,
            }),
        )
        .await;
        Ok(CancelOutcome::Canceled { terminated_process })
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> anyhow::Result<Vec<JobRecord>> {
        self.store.list_jobs(filter).await
    }

    pub async fn get_job(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        self.store.get_job(id).await
    }

    pub async fn job_events(&self, id: JobId, limit: u32) -> anyhow::Result<Vec<JobEvent>> {
        self.store.job_events(id, limit).await
    }

    pub async fn job_checkpoint(&self, id: JobId) -> anyhow::Result<Option<Value>> {
        self.store.load_checkpoint(id).await
    }

    pub async fn locks(&self) -> anyhow::Result<HashMap<String, ResourceLease>> {
        self.store.locks().await
    }

    pub async fn snapshot(&self) -> anyhow::Result<QueueSnapshot> {
        let statuses = self.store.status_counts().await?;
        let active = self.store.active_counts().await?;
        let budget = self.config.budget();
        let resources = ResourceClass::ALL
            .into_iter()
            .map(|class| {
                let entry = ResourceSnapshotEntry {
                    active: active.get(&class).copied().unwrap_or(0),
                    limit: budget.limit(class),
                };
                (class, entry)
            })
            .collect();

        Ok(QueueSnapshot {
            sampled_at: Utc::now(),
            paused: self.store.is_paused().await?,
            statuses,
            resources,
            tracked_workers: self.running.lock().await.len(),
        })
    }

    /// Run one reconcile, stale-recovery and dispatch pass.
    pub async fn tick(&self) -> anyhow::Result<TickReport> {
        let mut report = TickReport::default();

        async {
            report.reconciled = self.reconcile().await;
            report.swept_locks = self.sweep_orphaned_locks().await?;
            self.recover_stale(&mut report).await
        }
        .instrument(telemetry::reconcile_span())
        .await?;

        if self.store.is_paused().await? {
            report.paused = true;
            return Ok(report);
        }

        self.dispatch(&mut report).await?;
        Ok(report)
    }

    /// Tick on the poll interval until shutdown. A failed tick is logged and
    /// retried on the next interval.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            lease_ttl_secs = self.config.lease_ttl_secs,
            kinds = ?self.registry.kinds(),
            "scheduler started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Err(err) = self.tick().await {
                warn!("scheduler tick failed: {err:#}");
                self.emit_scheduler(
                    Severity::Error,
                    EventCode::TICK_ERROR,
                    json!({ "error": bounded_trace(&format!("{err:#}")) }),
                )
                .await;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        info!("scheduler stopped; in-flight workers keep running");
    }

    /// Spawn [`Scheduler::run`] on the tokio runtime.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Stop the dispatch loop. Workers are left to finish on their own.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn reconcile(&self) -> usize {
        let mut running = self.running.lock().await;
        let mut finished = Vec::new();
        for (id, worker) in running.iter_mut() {
            match worker.handle.try_finished() {
                Ok(true) => finished.push(*id),
                Ok(false) => {}
                Err(err) => {
                    warn!(job_id = %id, "polling worker failed: {err:#}");
                    finished.push(*id);
                }
            }
        }

        for id in &finished {
            if let Some(worker) = running.remove(id) {
                debug!(
                    job_id = %id,
                    job_kind = %worker.kind,
                    elapsed_secs = worker.started.elapsed().as_secs_f64(),
                    "worker exited"
                );
            }
        }
        finished.len()
    }

    /// Release locks whose owning dispatch is gone: the job is missing, no
    /// longer leased/running, or re-dispatched under another owner.
    async fn sweep_orphaned_locks(&self) -> anyhow::Result<usize> {
        let mut swept = 0;
        for (resource, lock) in self.store.locks().await? {
            let Some(job_id) = LeaseOwner::from(lock.owner.as_str()).job_id() else {
                continue;
            };
            let orphaned = match self.store.get_job(job_id).await? {
                Some(job) => {
                    !job.status.is_active()
                        || job.lease_owner.as_deref() != Some(lock.owner.as_str())
                }
                None => true,
            };
            if orphaned && self.store.release_lock(&resource, &lock.owner).await? {
                swept += 1;
                self.emit_job(
                    job_id,
                    Severity::Warn,
                    EventCode::LEASE_RELEASED,
                    json!({ "resource": resource, "owner": lock.owner, "reason": "orphaned" }),
                )
                .await;
            }
        }
        Ok(swept)
    }

    async fn recover_stale(&self, report: &mut TickReport) -> anyhow::Result<()> {
        let now = Utc::now();
        let cutoff = stale_cutoff(now, self.config.lease_ttl_secs);

        for job in self.store.stale_jobs(cutoff).await? {
            let Some(owner) = job.lease_owner.clone() else {
                continue;
            };

            let (applied, code, data) =
                match process_stale_job(job.attempts, job.max_attempts, &self.config.retry) {
                    StaleOutcome::Requeue { delay_ms } => {
                        let delay = chrono::Duration::milliseconds(delay_ms as i64);
                        let available_at = retry_available_at(now, delay);
                        let applied = self
                            .store
                            .requeue_stale(job.id, &owner, cutoff, available_at)
                            .await?;
                        if applied {
                            report.stale_requeued.push(job.id);
                        }
                        (
                            applied,
                            EventCode::STALE_REQUEUED,
                            json!({ "attempts": job.attempts, "delay_ms": delay_ms }),
                        )
                    }
                    StaleOutcome::Exhausted => {
                        let applied = self.store.fail_stale(job.id, &owner, cutoff, now).await?;
                        if applied {
                            report.stale_failed.push(job.id);
                        }
                        (
                            applied,
                            EventCode::STALE_EXHAUSTED,
                            json!({ "attempts": job.attempts, "code": ErrorCode::MaxAttempts }),
                        )
                    }
                };

            if !applied {
                continue;
            }

            self.terminate_tracked(job.id, &owner).await;
            if let Err(err) = self.gpu.release(&owner).await {
                warn!(job_id = %job.id, "{err:#}, left for the orphan-lock sweep");
            }

            let outcome = if code == EventCode::STALE_REQUEUED {
                "requeued"
            } else {
                "exhausted"
            };
            telemetry::record_stale_recovered(job.id, &job.kind, outcome);
            self.emit_job(job.id, Severity::Warn, code, data).await;
        }
        Ok(())
    }

    async fn terminate_tracked(&self, id: JobId, owner: &str) {
        let mut running = self.running.lock().await;
        if running.get(&id).is_some_and(|w| w.lease_owner == owner) {
            if let Some(mut worker) = running.remove(&id) {
                if let Err(err) = worker.handle.terminate() {
                    warn!(job_id = %id, "terminating stale worker failed: {err:#}");
                }
            }
        }
    }

    async fn dispatch(&self, report: &mut TickReport) -> anyhow::Result<()> {
        let mut budget =
            ClassBudget::seeded(self.config.budget(), self.store.active_counts().await?);

        for job in self.store.eligible_jobs(Utc::now()).await? {
            if self.shutdown.is_cancelled() {
                break;
            }
            if !budget.has_budget(job.resource_class) {
                continue;
            }
            let span = telemetry::dispatch_span(job.id, &job.kind, job.resource_class);
            self.dispatch_one(&job, &mut budget, report)
                .instrument(span)
                .await?;
        }

        for class in ResourceClass::ALL {
            let (active, limit) = budget.utilization(class);
            telemetry::set_class_utilization(class, active, limit);
        }
        Ok(())
    }

    async fn dispatch_one(
        &self,
        job: &JobRecord,
        budget: &mut ClassBudget,
        report: &mut TickReport,
    ) -> anyhow::Result<()> {
        let spec = match self.registry.get(&job.kind) {
            Ok(spec) => spec,
            Err(err) => {
                let message = format!("{err:#}");
                self.fail_before_dispatch(
                    job,
                    ErrorCode::Error,
                    EventCode::JOB_FAILED,
                    &message,
                    report,
                )
                .await?;
                return Ok(());
            }
        };

        let precondition = PreconditionContext {
            kind: job.kind.clone(),
            attempt: job.attempts + 1,
        };
        if let Some(reason) = spec.handler.precondition(&precondition, &job.payload) {
            self.fail_before_dispatch(
                job,
                ErrorCode::Precondition,
                EventCode::PRECONDITION_VETO,
                &reason,
                report,
            )
            .await?;
            return Ok(());
        }

        let owner = LeaseOwner::for_job(job.id);
        let gpu_resource = if job.resource_class.requires_gpu() {
            match self.gpu.preflight(job.vram_estimate_mb).await {
                Preflight::Admitted(info) => {
                    debug!(
                        free_mb = info.free_mb,
                        total_mb = info.total_mb,
                        "gpu preflight passed"
                    );
                }
                Preflight::Rejected { reason } => {
                    self.fail_before_dispatch(
                        job,
                        ErrorCode::GpuUnavailable,
                        EventCode::GPU_UNAVAILABLE,
                        &reason,
                        report,
                    )
                    .await?;
                    return Ok(());
                }
            }
            if !self.gpu.acquire_exclusive(owner.as_str()).await? {
                debug!("gpu lease held by another owner, retrying next tick");
                return Ok(());
            }
            Some(GPU_RESOURCE.to_string())
        } else {
            None
        };

        if !self.store.mark_leased(job.id, owner.as_str(), Utc::now()).await? {
            // Paused or canceled since the eligible scan.
            if gpu_resource.is_some() {
                self.gpu.release(owner.as_str()).await?;
            }
            return Ok(());
        }
        budget.try_acquire(job.resource_class);
        let attempt = job.attempts + 1;

        let request = LaunchRequest {
            job_id: job.id,
            kind: job.kind.clone(),
            lease_owner: owner.to_string(),
            gpu_resource: gpu_resource.clone(),
        };

        match self.launcher.launch(request).await {
            Ok(handle) => {
                let pid = handle.id();
                self.running.lock().await.insert(
                    job.id,
                    TrackedWorker {
                        handle,
                        kind: job.kind.clone(),
                        lease_owner: owner.to_string(),
                        started: Instant::now(),
                    },
                );
                report.dispatched.push(job.id);
                telemetry::record_job_dispatched(job.id, &job.kind, job.resource_class, attempt);
                self.emit_job(
                    job.id,
                    Severity::Info,
                    EventCode::JOB_DISPATCHED,
                    json!({
                        "attempt": attempt,
                        "lease_owner": owner.as_str(),
                        "resource_class": job.resource_class,
                        "gpu_resource": gpu_resource,
                        "pid": pid,
                    }),
                )
                .await;
            }
            Err(err) => {
                budget.release(job.resource_class);
                let message = bounded_trace(&format!("worker launch failed: {err:#}"));
                let now = Utc::now();
                let requeued = attempt < job.max_attempts;
                if requeued {
                    let delay = compute_retry_delay(attempt, &self.config.retry);
                    self.store
                        .requeue_owned(
                            job.id,
                            owner.as_str(),
                            retry_available_at(now, delay),
                            ErrorCode::Error,
                            &message,
                        )
                        .await?;
                } else {
                    self.store
                        .fail_owned(job.id, owner.as_str(), ErrorCode::Error, &message, now)
                        .await?;
                    report.failed.push(job.id);
                }
                if gpu_resource.is_some() {
                    self.gpu.release(owner.as_str()).await?;
                }
                self.emit_job(
                    job.id,
                    Severity::Error,
                    EventCode::LAUNCH_FAILED,
                    json!({ "message": message, "attempt": attempt, "requeued": requeued }),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn fail_before_dispatch(
        &self,
        job: &JobRecord,
        code: ErrorCode,
        event: EventCode,
        message: &str,
        report: &mut TickReport,
    ) -> anyhow::Result<()> {
        if self
            .store
            .fail_queued(job.id, code, message, Utc::now())
            .await?
        {
            report.failed.push(job.id);
            self.emit_job(
                job.id,
                Severity::Warn,
                event,
                json!({ "code": code, "message": message }),
            )
            .await;
        }
        Ok(())
    }

    async fn emit_job(&self, id: JobId, severity: Severity, code: EventCode, data: Value) {
        events::emit(self.store.as_ref(), NewEvent::job(id, severity, code, data)).await;
    }

    async fn emit_scheduler(&self, severity: Severity, code: EventCode, data: Value) {
        events::emit(self.store.as_ref(), NewEvent::scheduler(severity, code, data)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter woke")
            .expect("task ok");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_once_set() {
        let token = ShutdownToken::default();
        token.cancel();
        timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("already cancelled");
    }

    #[test]
    fn test_cancel_outcome_serializes_tagged() {
        let value = serde_json::to_value(CancelOutcome::Canceled {
            terminated_process: true,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({ "outcome": "canceled", "terminated_process": true })
        );
    }
}
