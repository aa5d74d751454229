use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use foreman::*;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// GPU probe returning a fixed, adjustable reading.
#[derive(Clone, Debug)]
pub struct FixedGpuProbe {
    info: Arc<Mutex<GpuInfo>>,
}

impl FixedGpuProbe {
    pub fn healthy(total_mb: u64, free_mb: u64) -> Self {
        Self::from_info(GpuInfo {
            present: true,
            name: Some("Test GPU".to_string()),
            total_mb,
            free_mb,
            driver_version: Some("550.00".to_string()),
            cuda_version: None,
            cuda_available: true,
            source: "fixed".to_string(),
        })
    }

    pub fn absent() -> Self {
        Self::from_info(GpuInfo::absent("fixed"))
    }

    pub fn from_info(info: GpuInfo) -> Self {
        Self {
            info: Arc::new(Mutex::new(info)),
        }
    }

    pub fn set(&self, info: GpuInfo) {
        *self.info.lock() = info;
    }
}

#[async_trait]
impl GpuProbe for FixedGpuProbe {
    async fn probe(&self) -> GpuInfo {
        self.info.lock().clone()
    }
}

/// Runs each launch as a tokio task driving a [`WorkerRuntime`].
#[derive(Clone)]
pub struct InProcessLauncher {
    runtime: WorkerRuntime,
    outcomes: Arc<Mutex<Vec<(JobId, WorkerOutcome)>>>,
}

impl InProcessLauncher {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<Registry>) -> Self {
        let runtime = WorkerRuntime::new(store, registry)
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_retry(RetryConfig {
                base_delay_ms: 10,
                max_backoff_ms: 50,
            });
        Self {
            runtime,
            outcomes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn outcomes(&self) -> Vec<(JobId, WorkerOutcome)> {
        self.outcomes.lock().clone()
    }

    pub fn outcome(&self, id: JobId) -> Option<WorkerOutcome> {
        self.outcomes
            .lock()
            .iter()
            .rev()
            .find(|(job_id, _)| *job_id == id)
            .map(|(_, outcome)| outcome.clone())
    }
}

#[derive(Debug)]
pub struct TaskHandle {
    task: JoinHandle<()>,
}

impl WorkerHandle for TaskHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_finished(&mut self) -> anyhow::Result<bool> {
        Ok(self.task.is_finished())
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        self.task.abort();
        Ok(())
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(
        &self,
        request: LaunchRequest,
    ) -> anyhow::Result<Box<dyn WorkerHandle>> {
        let runtime = self.runtime.clone();
        let outcomes = self.outcomes.clone();
        let task = tokio::spawn(async move {
            let job_id = request.job_id;
            match runtime.execute(request).await {
                Ok(outcome) => outcomes.lock().push((job_id, outcome)),
                Err(err) => tracing::warn!(%job_id, "in-process worker failed: {err:#}"),
            }
        });
        Ok(Box::new(TaskHandle { task }))
    }
}

/// Records launches without running anything. Each handle stays alive
/// until [`RecordingLauncher::finish`] or termination.
#[derive(Clone, Default)]
pub struct RecordingLauncher {
    launches: Arc<Mutex<Vec<LaunchRequest>>>,
    alive: Arc<Mutex<Vec<(JobId, Arc<AtomicBool>)>>>,
    terminated: Arc<Mutex<Vec<JobId>>>,
    fail_launches: Arc<AtomicBool>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.launches.lock().clone()
    }

    pub fn launched_ids(&self) -> Vec<JobId> {
        self.launches.lock().iter().map(|r| r.job_id).collect()
    }

    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    /// Mark a job's handle as exited.
    pub fn finish(&self, id: JobId) {
        for (job_id, alive) in self.alive.lock().iter() {
            if *job_id == id {
                alive.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn finish_all(&self) {
        for (_, alive) in self.alive.lock().iter() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    pub fn was_terminated(&self, id: JobId) -> bool {
        self.terminated.lock().contains(&id)
    }
}

#[derive(Debug)]
pub struct RecordedHandle {
    job_id: JobId,
    alive: Arc<AtomicBool>,
    terminated: Arc<Mutex<Vec<JobId>>>,
}

impl WorkerHandle for RecordedHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_finished(&mut self) -> anyhow::Result<bool> {
        Ok(!self.alive.load(Ordering::SeqCst))
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        self.terminated.lock().push(self.job_id);
        Ok(())
    }
}

#[async_trait]
impl WorkerLauncher for RecordingLauncher {
    async fn launch(
        &self,
        request: LaunchRequest,
    ) -> anyhow::Result<Box<dyn WorkerHandle>> {
        if self.fail_launches.load(Ordering::SeqCst) {
            bail!("spawn refused for job {}", request.job_id);
        }
        let alive = Arc::new(AtomicBool::new(true));
        self.alive.lock().push((request.job_id, alive.clone()));
        let job_id = request.job_id;
        self.launches.lock().push(request);
        Ok(Box::new(RecordedHandle {
            job_id,
            alive,
            terminated: self.terminated.clone(),
        }))
    }
}
