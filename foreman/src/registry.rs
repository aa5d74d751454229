use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;

use crate::job::ResourceClass;
use crate::runtime::worker::JobContext;

/// Inputs available to a precondition check at dispatch time.
#[derive(Clone, Debug)]
pub struct PreconditionContext {
    pub kind: String,
    pub attempt: u32,
}

/// Execution contract for one job kind.
///
/// Only `run` is required. Estimators are advisory; `estimate_vram_mb`
/// feeds the GPU preflight for GPU-class kinds.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn estimate_vram_mb(&self, _payload: &Value) -> u64 {
        0
    }

    fn estimate_runtime_secs(&self, _payload: &Value) -> u64 {
        60
    }

    /// Return a veto reason to fail the job before dispatch.
    fn precondition(
        &self,
        _ctx: &PreconditionContext,
        _payload: &Value,
    ) -> Option<String> {
        None
    }

    async fn run(
        &self,
        ctx: &JobContext,
        payload: Value,
        checkpoint: Option<Value>,
    ) -> anyhow::Result<()>;
}

/// Registry entry: a kind, its resource class and handler.
#[derive(Clone)]
pub struct JobSpec {
    pub kind: String,
    pub resource_class: ResourceClass,
    pub handler: Arc<dyn JobHandler>,
}

impl JobSpec {
    pub fn new(
        kind: impl Into<String>,
        resource_class: ResourceClass,
        handler: impl JobHandler + 'static,
    ) -> Self {
        Self {
            kind: kind.into(),
            resource_class,
            handler: Arc::new(handler),
        }
    }
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("kind", &self.kind)
            .field("resource_class", &self.resource_class)
            .finish_non_exhaustive()
    }
}

/// Catalog of job kinds, filled at startup and read-only afterwards.
#[derive(Debug, Default)]
pub struct Registry {
    specs: HashMap<String, JobSpec>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kind. Registering the same kind twice is an error.
    pub fn register(&mut self, spec: JobSpec) -> anyhow::Result<()> {
        if self.specs.contains_key(&spec.kind) {
            bail!("job kind '{}' is already registered", spec.kind);
        }
        self.specs.insert(spec.kind.clone(), spec);
        Ok(())
    }

    pub fn with(mut self, spec: JobSpec) -> anyhow::Result<Self> {
        self.register(spec)?;
        Ok(self)
    }

    pub fn get(&self, kind: &str) -> anyhow::Result<&JobSpec> {
        self.specs
            .get(kind)
            .ok_or_else(|| anyhow!("unknown job kind '{kind}'"))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.specs.contains_key(kind)
    }

    /// Registered kinds in sorted order.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.specs.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn run(
            &self,
            _ctx: &JobContext,
            _payload: Value,
            _checkpoint: Option<Value>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let mut registry = Registry::new();
        registry
            .register(JobSpec::new("scan", ResourceClass::LightCpu, Noop))
            .unwrap();
        let err = registry
            .register(JobSpec::new("scan", ResourceClass::IoLight, Noop))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(
            registry.get("scan").unwrap().resource_class,
            ResourceClass::LightCpu
        );
    }

    #[test]
    fn test_unknown_kind() {
        let registry = Registry::new()
            .with(JobSpec::new("b", ResourceClass::LightCpu, Noop))
            .unwrap()
            .with(JobSpec::new("a", ResourceClass::IoLight, Noop))
            .unwrap();
        assert!(registry.get("missing").is_err());
        assert!(registry.contains("a"));
        assert_eq!(registry.kinds(), vec!["a", "b"]);
    }

    #[test]
    fn test_handler_defaults() {
        let payload = serde_json::json!({});
        let ctx = PreconditionContext {
            kind: "scan".into(),
            attempt: 0,
        };
        assert_eq!(Noop.estimate_vram_mb(&payload), 0);
        assert_eq!(Noop.estimate_runtime_secs(&payload), 60);
        assert!(Noop.precondition(&ctx, &payload).is_none());
    }
}
