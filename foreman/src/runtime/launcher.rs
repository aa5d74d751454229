use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use crate::job::JobId;
use crate::lease::RetryConfig;

/// Everything a worker needs to run one dispatch of a job. The payload is
/// not carried: the worker reads it from the job row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub job_id: JobId,
    pub kind: String,
    pub lease_owner: String,
    /// Resource lock held on the worker's behalf, refreshed by its
    /// heartbeat and released when it finishes.
    pub gpu_resource: Option<String>,
}

/// Handle to a launched worker, polled by the scheduler's reconcile pass.
pub trait WorkerHandle: Send + fmt::Debug {
    /// OS process id, when the worker is a process.
    fn id(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn try_finished(&mut self) -> anyhow::Result<bool>;

    /// Best-effort immediate termination.
    fn terminate(&mut self) -> anyhow::Result<()>;
}

/// Starts a worker for a leased job.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        request: LaunchRequest,
    ) -> anyhow::Result<Box<dyn WorkerHandle>>;
}

/// Launches each job in its own OS process running `<program> worker ...`.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    database_url: String,
    heartbeat_interval: Duration,
    retry: RetryConfig,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, database_url: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            database_url: database_url.into(),
            heartbeat_interval: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }

    /// Launch workers from the currently running executable.
    pub fn current_exe(database_url: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, database_url))
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Arguments passed to the worker subcommand.
    pub fn worker_args(&self, request: &LaunchRequest) -> Vec<String> {
        let mut args = vec![
            "worker".to_string(),
            "--job-id".to_string(),
            request.job_id.to_string(),
            "--kind".to_string(),
            request.kind.clone(),
            "--lease-owner".to_string(),
            request.lease_owner.clone(),
            "--database-url".to_string(),
            self.database_url.clone(),
            "--heartbeat-secs".to_string(),
            self.heartbeat_interval.as_secs().max(1).to_string(),
            "--retry-base-ms".to_string(),
            self.retry.base_delay_ms.to_string(),
            "--retry-max-ms".to_string(),
            self.retry.max_backoff_ms.to_string(),
        ];
        if let Some(resource) = &request.gpu_resource {
            args.push("--gpu-resource".to_string());
            args.push(resource.clone());
        }
        args
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        request: LaunchRequest,
    ) -> anyhow::Result<Box<dyn WorkerHandle>> {
        let child = Command::new(&self.program)
            .args(self.worker_args(&request))
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()?;

        tracing::debug!(
            job_id = %request.job_id,
            pid = child.id(),
            "worker process spawned"
        );
        Ok(Box::new(ProcessHandle { child }))
    }
}

#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
}

impl WorkerHandle for ProcessHandle {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_finished(&mut self) -> anyhow::Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.start_kill()?;
        Ok(())
    }
}
