use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{JobEvent, NewEvent};
use crate::job::{
    ErrorCode, JobFilter, JobId, JobRecord, JobStatus, NewJob, ResourceClass,
};
use crate::lease::ResourceLease;

/// Durable state shared by the scheduler and worker processes.
///
/// Every mutation is a single-row compare-and-set. Methods returning `bool`
/// report whether the guarded row was actually updated; `false` means the
/// row was not in the expected state (or not owned by the caller) and
/// nothing changed.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create tables if they do not exist.
    async fn migrate(&self) -> anyhow::Result<()>;

    /// Persist a new `queued` job.
    async fn insert_job(&self, job: NewJob) -> anyhow::Result<JobId>;

    async fn get_job(&self, id: JobId) -> anyhow::Result<Option<JobRecord>>;

    async fn list_jobs(&self, filter: &JobFilter)
    -> anyhow::Result<Vec<JobRecord>>;

    /// Queued jobs whose backoff has elapsed, in dispatch order:
    /// priority ascending, then enqueue time ascending.
    async fn eligible_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<JobRecord>>;

    /// Count of leased/running jobs per resource class.
    async fn active_counts(
        &self,
    ) -> anyhow::Result<HashMap<ResourceClass, usize>>;

    async fn status_counts(&self) -> anyhow::Result<HashMap<JobStatus, usize>>;

    /// Leased/running jobs whose heartbeat is older than `cutoff`.
    async fn stale_jobs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<JobRecord>>;

    /// Move a job from `from` to `to` with no other changes.
    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> anyhow::Result<bool>;

    /// `queued -> leased`: bump attempts and stamp lease and heartbeat.
    async fn mark_leased(
        &self,
        id: JobId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// `leased -> running` for the owning worker.
    async fn mark_running(
        &self,
        id: JobId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// `running -> done` for the owning worker, clearing error fields.
    async fn mark_done(
        &self,
        id: JobId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// `queued -> failed` (precondition veto, preflight rejection).
    async fn fail_queued(
        &self,
        id: JobId,
        code: ErrorCode,
        message: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// `leased/running -> failed` for the owning worker.
    async fn fail_owned(
        &self,
        id: JobId,
        owner: &str,
        code: ErrorCode,
        message: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// `leased/running -> queued` for the owning worker, clearing lease
    /// fields and keeping the error for visibility.
    async fn requeue_owned(
        &self,
        id: JobId,
        owner: &str,
        available_at: DateTime<Utc>,
        code: ErrorCode,
        message: &str,
    ) -> anyhow::Result<bool>;

    /// Stale `leased/running -> queued`, only if the heartbeat is still
    /// older than `cutoff`.
    async fn requeue_stale(
        &self,
        id: JobId,
        owner: &str,
        cutoff: DateTime<Utc>,
        available_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Stale `leased/running -> failed` with `MAX_ATTEMPTS`.
    async fn fail_stale(
        &self,
        id: JobId,
        owner: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Any non-terminal state `-> canceled`.
    async fn cancel_job(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Refresh the job heartbeat and, when `resource` is given, the lease
    /// on that resource. Uses a freshly opened connection so a worker
    /// survives the scheduler process restarting underneath it.
    async fn heartbeat(
        &self,
        id: JobId,
        owner: &str,
        resource: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn load_checkpoint(&self, id: JobId) -> anyhow::Result<Option<Value>>;

    /// Upsert with full overwrite.
    async fn save_checkpoint(
        &self,
        id: JobId,
        payload: &Value,
    ) -> anyhow::Result<()>;

    async fn append_event(&self, event: &NewEvent) -> anyhow::Result<()>;

    /// Most recent events for a job, newest first.
    async fn job_events(
        &self,
        id: JobId,
        limit: u32,
    ) -> anyhow::Result<Vec<JobEvent>>;

    async fn is_paused(&self) -> anyhow::Result<bool>;

    async fn set_paused(&self, paused: bool) -> anyhow::Result<()>;

    /// Test-and-set: succeeds if the lock is free, expired, or already held
    /// by `owner` (re-entrant refresh).
    async fn try_acquire_lock(
        &self,
        resource: &str,
        owner: &str,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn refresh_lock(
        &self,
        resource: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Delete the lock if held by `owner`. Never errors when absent.
    async fn release_lock(
        &self,
        resource: &str,
        owner: &str,
    ) -> anyhow::Result<bool>;

    async fn locks(&self) -> anyhow::Result<HashMap<String, ResourceLease>>;
}

/// Snapshot of orchestrator state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Timestamp when the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
    pub paused: bool,
    /// Job counts per status.
    pub statuses: HashMap<JobStatus, usize>,
    /// Per-class utilization.
    pub resources: HashMap<ResourceClass, ResourceSnapshotEntry>,
    /// Worker processes tracked by this scheduler instance.
    pub tracked_workers: usize,
}

/// Utilization of a single resource class.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceSnapshotEntry {
    pub active: usize,
    pub limit: usize,
}
