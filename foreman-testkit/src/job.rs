use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use foreman::*;
use parking_lot::Mutex;
use serde_json::{json, Value};

pub const SUCCEED: &str = "succeed";
pub const FAIL: &str = "fail";
pub const PANIC: &str = "panic";
pub const SLOW: &str = "slow";
pub const CHECKPOINT: &str = "checkpoint";
pub const VETO: &str = "veto";
pub const GPU: &str = "gpu";
pub const IO: &str = "io";

/// Shared log of job ids whose body ran, in order.
#[derive(Clone, Debug, Default)]
pub struct RunLog {
    runs: Arc<Mutex<Vec<JobId>>>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: JobId) {
        self.runs.lock().push(id);
    }

    pub fn runs(&self) -> Vec<JobId> {
        self.runs.lock().clone()
    }

    pub fn count(&self, id: JobId) -> usize {
        self.runs.lock().iter().filter(|run| **run == id).count()
    }
}

/// Completes immediately.
pub struct SucceedJob {
    pub log: RunLog,
}

#[async_trait]
impl JobHandler for SucceedJob {
    async fn run(
        &self,
        ctx: &JobContext,
        _payload: Value,
        _checkpoint: Option<Value>,
    ) -> anyhow::Result<()> {
        self.log.record(ctx.job_id());
        Ok(())
    }
}

/// Fails with `payload.message`, or a generic error.
pub struct FailJob {
    pub log: RunLog,
}

#[async_trait]
impl JobHandler for FailJob {
    async fn run(
        &self,
        ctx: &JobContext,
        payload: Value,
        _checkpoint: Option<Value>,
    ) -> anyhow::Result<()> {
        self.log.record(ctx.job_id());
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("job failed");
        bail!("{message}")
    }
}

pub struct PanicJob;

#[async_trait]
impl JobHandler for PanicJob {
    async fn run(
        &self,
        _ctx: &JobContext,
        _payload: Value,
        _checkpoint: Option<Value>,
    ) -> anyhow::Result<()> {
        panic!("handler exploded");
    }
}

/// Sleeps `payload.ms` (default 60s) in 10ms steps, returning early once
/// canceled.
pub struct SlowJob {
    pub log: RunLog,
}

#[async_trait]
impl JobHandler for SlowJob {
    async fn run(
        &self,
        ctx: &JobContext,
        payload: Value,
        _checkpoint: Option<Value>,
    ) -> anyhow::Result<()> {
        self.log.record(ctx.job_id());
        let total = payload.get("ms").and_then(Value::as_u64).unwrap_or(60_000);
        let mut slept = 0;
        while slept < total {
            if ctx.is_canceled().await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            slept += 10;
        }
        Ok(())
    }
}

/// Bumps `step` in its checkpoint each run and fails while
/// `step < payload.fail_until`.
pub struct CheckpointJob;

#[async_trait]
impl JobHandler for CheckpointJob {
    async fn run(
        &self,
        ctx: &JobContext,
        payload: Value,
        checkpoint: Option<Value>,
    ) -> anyhow::Result<()> {
        let step = checkpoint
            .as_ref()
            .and_then(|c| c.get("step"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        ctx.save_checkpoint(&json!({ "step": step })).await?;

        let fail_until = payload
            .get("fail_until")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if step < fail_until {
            bail!("step {step} not yet stable");
        }
        Ok(())
    }
}

/// Always vetoed by its precondition.
pub struct VetoJob;

#[async_trait]
impl JobHandler for VetoJob {
    fn precondition(&self, _ctx: &PreconditionContext, payload: &Value) -> Option<String> {
        Some(
            payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("source file missing")
                .to_string(),
        )
    }

    async fn run(
        &self,
        _ctx: &JobContext,
        _payload: Value,
        _checkpoint: Option<Value>,
    ) -> anyhow::Result<()> {
        bail!("vetoed jobs never run")
    }
}

/// GPU-class job estimating `payload.vram_mb` (default 4096).
pub struct GpuJob {
    pub log: RunLog,
}

#[async_trait]
impl JobHandler for GpuJob {
    fn estimate_vram_mb(&self, payload: &Value) -> u64 {
        payload
            .get("vram_mb")
            .and_then(Value::as_u64)
            .unwrap_or(4096)
    }

    async fn run(
        &self,
        ctx: &JobContext,
        _payload: Value,
        _checkpoint: Option<Value>,
    ) -> anyhow::Result<()> {
        self.log.record(ctx.job_id());
        Ok(())
    }
}

/// Registry with every sample kind. `slow` and `io` share [`SlowJob`].
pub fn test_registry(log: &RunLog) -> Registry {
    let specs = vec![
        JobSpec::new(SUCCEED, ResourceClass::LightCpu, SucceedJob { log: log.clone() }),
        JobSpec::new(FAIL, ResourceClass::LightCpu, FailJob { log: log.clone() }),
        JobSpec::new(PANIC, ResourceClass::LightCpu, PanicJob),
        JobSpec::new(SLOW, ResourceClass::LightCpu, SlowJob { log: log.clone() }),
        JobSpec::new(CHECKPOINT, ResourceClass::LightCpu, CheckpointJob),
        JobSpec::new(VETO, ResourceClass::LightCpu, VetoJob),
        JobSpec::new(GPU, ResourceClass::HeavyAiGpu, GpuJob { log: log.clone() }),
        JobSpec::new(IO, ResourceClass::IoLight, SlowJob { log: log.clone() }),
    ];

    let mut registry = Registry::new();
    for spec in specs {
        if let Err(err) = registry.register(spec) {
            panic!("sample registry: {err}");
        }
    }
    registry
}
