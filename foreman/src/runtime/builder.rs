use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;

use crate::config::SchedulerConfig;
use crate::gpu::{GpuProbe, SystemGpuProbe};
use crate::queue::JobStore;
use crate::registry::Registry;

use super::launcher::WorkerLauncher;
use super::supervisor::Scheduler;

/// Builder for a [`Scheduler`] with explicit dependencies.
///
/// The store, registry and launcher are required; the GPU probe defaults to
/// [`SystemGpuProbe`].
///
/// # Example
///
/// ```ignore
/// use foreman::*;
///
/// let scheduler = SchedulerBuilder::new(config)
///     .with_store(store)
///     .with_registry(registry)
///     .with_launcher(launcher)
///     .build()?;
/// ```
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn JobStore>>,
    registry: Option<Arc<Registry>>,
    gpu_probe: Option<Arc<dyn GpuProbe>>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
}

impl fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("registry_set", &self.registry.is_some())
            .field("gpu_probe_set", &self.gpu_probe.is_some())
            .field("launcher_set", &self.launcher.is_some())
            .finish()
    }
}

impl SchedulerBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            store: None,
            registry: None,
            gpu_probe: None,
            launcher: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_gpu_probe(mut self, probe: Arc<dyn GpuProbe>) -> Self {
        self.gpu_probe = Some(probe);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Build the scheduler, failing if a required dependency is missing.
    pub fn build(self) -> anyhow::Result<Scheduler> {
        let store = self
            .store
            .ok_or_else(|| anyhow!("store dependency missing"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow!("registry dependency missing"))?;
        let launcher = self
            .launcher
            .ok_or_else(|| anyhow!("launcher dependency missing"))?;
        let gpu_probe = self
            .gpu_probe
            .unwrap_or_else(|| {
                Arc::new(SystemGpuProbe::new().with_timeout(self.config.gpu_probe_timeout()))
            });

        Ok(Scheduler::new(self.config, store, registry, gpu_probe, launcher))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_store() {
        let err = SchedulerBuilder::new(SchedulerConfig::default())
            .with_registry(Arc::new(Registry::new()))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("store dependency missing"));
    }

    #[test]
    fn test_debug_reports_set_dependencies() {
        let builder = SchedulerBuilder::new(SchedulerConfig::default())
            .with_registry(Arc::new(Registry::new()));
        let debug = format!("{builder:?}");
        assert!(debug.contains("registry_set: true"));
        assert!(debug.contains("store_set: false"));
    }
}
