//! Job kinds shipped with the binary.
//!
//! - `gpu_probe` (`heavy_ai_gpu`, 4096 MB): probes the GPU from inside a
//!   worker and records what it saw.
//! - `sleep` (`light_cpu`): sleeps in one-second steps, checkpointing
//!   progress and stopping early when canceled.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::events::{EventCode, Severity};
use crate::gpu::{GpuProbe, SystemGpuProbe};
use crate::job::ResourceClass;
use crate::registry::{JobHandler, JobSpec, PreconditionContext, Registry};
use crate::runtime::worker::JobContext;

pub const GPU_PROBE_KIND: &str = "gpu_probe";
pub const SLEEP_KIND: &str = "sleep";

/// Custom event emitted with the probe result.
pub const GPU_PROBE_RESULT: EventCode = EventCode(1000);

pub struct GpuProbeJob {
    probe: Arc<dyn GpuProbe>,
}

impl GpuProbeJob {
    pub fn new(probe: Arc<dyn GpuProbe>) -> Self {
        Self { probe }
    }
}

impl Default for GpuProbeJob {
    fn default() -> Self {
        Self::new(Arc::new(SystemGpuProbe::new()))
    }
}

#[async_trait]
impl JobHandler for GpuProbeJob {
    fn estimate_vram_mb(&self, payload: &Value) -> u64 {
        payload
            .get("vram_mb")
            .and_then(Value::as_u64)
            .unwrap_or(4096)
    }

    fn estimate_runtime_secs(&self, _payload: &Value) -> u64 {
        5
    }

    async fn run(
        &self,
        ctx: &JobContext,
        _payload: Value,
        _checkpoint: Option<Value>,
    ) -> anyhow::Result<()> {
        let info = self.probe.probe().await;
        ctx.emit(Severity::Info, GPU_PROBE_RESULT, serde_json::to_value(&info)?)
            .await;
        if !info.present {
            bail!("no GPU detected by worker probe");
        }
        ctx.save_checkpoint(&json!({ "gpu": info })).await
    }
}

pub struct SleepJob;

fn sleep_seconds(payload: &Value) -> u64 {
    payload.get("seconds").and_then(Value::as_u64).unwrap_or(1)
}

#[async_trait]
impl JobHandler for SleepJob {
    fn estimate_runtime_secs(&self, payload: &Value) -> u64 {
        sleep_seconds(payload)
    }

    fn precondition(&self, _ctx: &PreconditionContext, payload: &Value) -> Option<String> {
        match payload.get("seconds") {
            Some(value) if value.as_u64().is_none() => {
                Some("'seconds' must be a non-negative integer".to_string())
            }
            _ => None,
        }
    }

    async fn run(
        &self,
        ctx: &JobContext,
        payload: Value,
        checkpoint: Option<Value>,
    ) -> anyhow::Result<()> {
        let total = sleep_seconds(&payload);
        let mut done = checkpoint
            .as_ref()
            .and_then(|c| c.get("slept"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        while done < total {
            if ctx.is_canceled().await? {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            done += 1;
            ctx.save_checkpoint(&json!({ "slept": done })).await?;
        }

        if let Some(message) = payload.get("fail").and_then(Value::as_str) {
            bail!("{message}");
        }
        Ok(())
    }
}

/// Registry containing every built-in kind.
pub fn builtin_registry() -> anyhow::Result<Registry> {
    Registry::new()
        .with(JobSpec::new(
            GPU_PROBE_KIND,
            ResourceClass::HeavyAiGpu,
            GpuProbeJob::default(),
        ))?
        .with(JobSpec::new(SLEEP_KIND, ResourceClass::LightCpu, SleepJob))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry().unwrap();
        assert_eq!(registry.kinds(), vec![GPU_PROBE_KIND, SLEEP_KIND]);
        let spec = registry.get(GPU_PROBE_KIND).unwrap();
        assert_eq!(spec.resource_class, ResourceClass::HeavyAiGpu);
        assert_eq!(spec.handler.estimate_vram_mb(&json!({})), 4096);
    }

    #[test]
    fn test_sleep_precondition() {
        let ctx = PreconditionContext {
            kind: SLEEP_KIND.into(),
            attempt: 1,
        };
        assert!(SleepJob.precondition(&ctx, &json!({"seconds": 3})).is_none());
        assert!(SleepJob.precondition(&ctx, &json!({"seconds": "soon"})).is_some());
        assert_eq!(SleepJob.estimate_runtime_secs(&json!({"seconds": 9})), 9);
    }
}
