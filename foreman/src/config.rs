use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetConfig;
use crate::gpu::GpuPolicy;
use crate::job::ResourceClass;
use crate::lease::RetryConfig;

/// Configuration for the SQLite database shared by scheduler and workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Database URL (e.g., "sqlite://var/foreman.db").
    pub database_url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// How long a statement waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl PersistenceConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_busy_timeout(mut self, ms: u64) -> Self {
        self.busy_timeout_ms = ms;
        self
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://foreman.db".to_string(),
            max_connections: 4,
            busy_timeout_ms: 5000,
        }
    }
}

/// Configuration for the dispatch loop, heartbeats and admission policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay between dispatch ticks, in milliseconds.
    pub poll_interval_ms: u64,
    /// Interval between worker heartbeats, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Resource lease TTL, in seconds. Jobs silent for twice this are stale.
    pub lease_ttl_secs: i64,
    /// Concurrency limit per resource class.
    pub resource_limits: HashMap<ResourceClass, usize>,
    /// Limit for classes missing from `resource_limits`.
    pub default_limit: usize,
    /// Free VRAM required on top of a job's estimate, in MB.
    pub gpu_safety_margin_mb: u64,
    /// Minimum total VRAM for the GPU to be usable at all, in MB.
    pub gpu_min_total_mb: u64,
    /// Upper bound on one GPU probe command. A probe that exceeds it reports
    /// the GPU as absent.
    pub gpu_probe_timeout_ms: u64,
    pub retry: RetryConfig,
    /// Used when `enqueue` is called without an explicit attempt limit.
    pub default_max_attempts: u32,
    /// Program spawned for worker processes; `None` means the current
    /// executable.
    pub worker_program: Option<PathBuf>,
}

impl SchedulerConfig {
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_heartbeat_interval(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    pub fn with_lease_ttl(mut self, secs: i64) -> Self {
        self.lease_ttl_secs = secs;
        self
    }

    /// Set the concurrency limit for one resource class.
    pub fn with_limit(mut self, class: ResourceClass, limit: usize) -> Self {
        self.resource_limits.insert(class, limit);
        self
    }

    pub fn with_gpu_safety_margin(mut self, mb: u64) -> Self {
        self.gpu_safety_margin_mb = mb;
        self
    }

    pub fn with_gpu_probe_timeout(mut self, ms: u64) -> Self {
        self.gpu_probe_timeout_ms = ms;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn gpu_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.gpu_probe_timeout_ms.max(1))
    }

    pub fn budget(&self) -> BudgetConfig {
        BudgetConfig::new(self.resource_limits.clone(), self.default_limit)
    }

    pub fn gpu_policy(&self) -> GpuPolicy {
        GpuPolicy {
            min_total_mb: self.gpu_min_total_mb,
            safety_margin_mb: self.gpu_safety_margin_mb,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let mut resource_limits = HashMap::new();
        resource_limits.insert(ResourceClass::HeavyAiGpu, 1);
        resource_limits.insert(ResourceClass::LightCpu, 2);
        resource_limits.insert(ResourceClass::IoLight, 4);

        Self {
            poll_interval_ms: 500,
            heartbeat_interval_secs: 5,
            lease_ttl_secs: 30,
            resource_limits,
            default_limit: 1,
            gpu_safety_margin_mb: 1024,
            gpu_min_total_mb: 8192,
            gpu_probe_timeout_ms: 5000,
            retry: RetryConfig::default(),
            default_max_attempts: 3,
            worker_program: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        let budget = config.budget();
        assert_eq!(budget.limit(ResourceClass::HeavyAiGpu), 1);
        assert_eq!(budget.limit(ResourceClass::LightCpu), 2);
        assert_eq!(budget.limit(ResourceClass::IoLight), 4);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.gpu_policy().min_total_mb, 8192);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.gpu_probe_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_persistence_setters() {
        let config = PersistenceConfig::new("sqlite://worker.db")
            .with_max_connections(1)
            .with_busy_timeout(250);
        assert_eq!(config.database_url, "sqlite://worker.db");
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.busy_timeout_ms, 250);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: SchedulerConfig = serde_json::from_str(
            r#"{"lease_ttl_secs": 10, "resource_limits": {"light_cpu": 6}}"#,
        )
        .unwrap();
        assert_eq!(config.lease_ttl_secs, 10);
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert_eq!(config.budget().limit(ResourceClass::LightCpu), 6);
        // Classes missing from the map fall back to the default limit.
        assert_eq!(config.budget().limit(ResourceClass::IoLight), 1);
    }
}
