//! GPU probing, admission preflight and the exclusive GPU lease.
//!
//! The lease is a row in the durable `resource_locks` table keyed by
//! [`GPU_RESOURCE`], so exclusivity holds across every scheduler and worker
//! process sharing the database.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn, Instrument};

use crate::lease::{ResourceLease, GPU_RESOURCE};
use crate::queue::JobStore;

/// Result of probing the host GPU. `present == false` on any probe failure.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub present: bool,
    pub name: Option<String>,
    pub total_mb: u64,
    pub free_mb: u64,
    pub driver_version: Option<String>,
    pub cuda_version: Option<String>,
    pub cuda_available: bool,
    /// Which mechanism produced this result.
    pub source: String,
}

impl GpuInfo {
    pub fn absent(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait GpuProbe: Send + Sync {
    /// Never fails: an unusable GPU is reported as not present.
    async fn probe(&self) -> GpuInfo;
}

/// Default bound on one `nvidia-smi` invocation.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const QUERY_ARGS: &[&str] = &[
    "--query-gpu=name,memory.total,memory.free,driver_version",
    "--format=csv,noheader,nounits",
];

enum SmiRun {
    Output(String),
    Failed,
    TimedOut,
}

/// Probes via `nvidia-smi`: the CSV query interface for memory, then the
/// `-q` report for the CUDA version. The report alone is the fallback when
/// the query interface is missing.
#[derive(Clone, Debug)]
pub struct SystemGpuProbe {
    program: String,
    timeout: Duration,
}

impl SystemGpuProbe {
    pub fn new() -> Self {
        Self::with_program("nvidia-smi")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[&str]) -> SmiRun {
        // Dropping the output future on timeout drops the child, which kills it.
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, output).await {
            Err(_) => {
                warn!(
                    program = %self.program,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "nvidia-smi timed out, reporting no GPU"
                );
                SmiRun::TimedOut
            }
            Ok(Ok(output)) if output.status.success() => {
                match String::from_utf8(output.stdout) {
                    Ok(stdout) => SmiRun::Output(stdout),
                    Err(_) => SmiRun::Failed,
                }
            }
            Ok(Ok(output)) => {
                debug!(status = %output.status, "nvidia-smi exited unsuccessfully");
                SmiRun::Failed
            }
            Ok(Err(err)) => {
                debug!("nvidia-smi unavailable: {err}");
                SmiRun::Failed
            }
        }
    }
}

impl Default for SystemGpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GpuProbe for SystemGpuProbe {
    async fn probe(&self) -> GpuInfo {
        let cuda_enabled = cuda_visible_devices_enabled(
            std::env::var("CUDA_VISIBLE_DEVICES").ok().as_deref(),
        );

        let query = match self.run(QUERY_ARGS).await {
            SmiRun::Output(out) => parse_query_csv(&out),
            SmiRun::Failed => None,
            SmiRun::TimedOut => return GpuInfo::absent("timeout"),
        };
        let report = match self.run(&["-q"]).await {
            SmiRun::Output(out) => Some(out),
            SmiRun::Failed => None,
            SmiRun::TimedOut => return GpuInfo::absent("timeout"),
        };

        let mut info = match (query, report.as_deref()) {
            (Some(mut info), report) => {
                info.cuda_version = report.and_then(report_cuda_version);
                info
            }
            (None, Some(report)) => match parse_smi_report(report) {
                Some(info) => info,
                None => return GpuInfo::absent("none"),
            },
            (None, None) => return GpuInfo::absent("none"),
        };

        info.cuda_available = info.cuda_version.is_some() && cuda_enabled;
        info
    }
}

/// `CUDA_VISIBLE_DEVICES` set to empty or `-1` hides every device.
pub fn cuda_visible_devices_enabled(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        Some("") | Some("-1") => false,
        _ => true,
    }
}

/// Parse the first line of
/// `nvidia-smi --query-gpu=name,memory.total,memory.free,driver_version
/// --format=csv,noheader,nounits`.
pub fn parse_query_csv(output: &str) -> Option<GpuInfo> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return None;
    }
    Some(GpuInfo {
        present: true,
        name: Some(fields[0].to_string()),
        total_mb: fields[1].parse().ok()?,
        free_mb: fields[2].parse().ok()?,
        driver_version: Some(fields[3].to_string()),
        // The query interface has no CUDA column; the `-q` report fills it.
        cuda_version: None,
        cuda_available: false,
        source: "nvidia-smi-query".to_string(),
    })
}

/// Parse the text report of `nvidia-smi -q`. Memory figures come from the
/// `FB Memory Usage` section.
pub fn parse_smi_report(output: &str) -> Option<GpuInfo> {
    let mut info = GpuInfo {
        source: "nvidia-smi-report".to_string(),
        ..GpuInfo::default()
    };
    let mut in_fb_memory = false;
    let mut total = None;
    let mut free = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("FB Memory Usage") {
            in_fb_memory = true;
            continue;
        }
        // Any other section header ends the FB block.
        let Some((key, value)) = trimmed.split_once(':') else {
            in_fb_memory = false;
            continue;
        };
        let (key, value) = (key.trim(), value.trim());

        match key {
            "Driver Version" => info.driver_version = Some(value.to_string()),
            "CUDA Version" => info.cuda_version = cuda_version_value(value),
            "Product Name" if info.name.is_none() => {
                info.name = Some(value.to_string())
            }
            "Total" if in_fb_memory && total.is_none() => {
                total = parse_mib(value)
            }
            "Free" if in_fb_memory && free.is_none() => free = parse_mib(value),
            _ => {}
        }
    }

    info.total_mb = total?;
    info.free_mb = free?;
    info.present = true;
    info.cuda_available = info.cuda_version.is_some();
    Some(info)
}

/// The `CUDA Version` line of an `nvidia-smi -q` report. `N/A` means the
/// driver exposes no CUDA runtime.
pub fn report_cuda_version(report: &str) -> Option<String> {
    report.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        (key.trim() == "CUDA Version")
            .then(|| cuda_version_value(value.trim()))
            .flatten()
    })
}

fn cuda_version_value(value: &str) -> Option<String> {
    match value {
        "" | "N/A" => None,
        version => Some(version.to_string()),
    }
}

fn parse_mib(value: &str) -> Option<u64> {
    value.split_whitespace().next()?.parse().ok()
}

/// Admission thresholds for GPU jobs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GpuPolicy {
    pub min_total_mb: u64,
    pub safety_margin_mb: u64,
}

impl Default for GpuPolicy {
    fn default() -> Self {
        Self {
            min_total_mb: 8192,
            safety_margin_mb: 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Preflight {
    Admitted(GpuInfo),
    Rejected { reason: String },
}

impl Preflight {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }
}

/// Decide whether a job needing `required_mb` of VRAM may start.
pub fn evaluate_preflight(
    info: &GpuInfo,
    required_mb: u64,
    policy: &GpuPolicy,
) -> Preflight {
    let reject = |reason: String| Preflight::Rejected { reason };

    if !info.present {
        return reject("no GPU detected".to_string());
    }
    if !info.cuda_available {
        return reject("CUDA is not available".to_string());
    }
    if info.total_mb < policy.min_total_mb {
        return reject(format!(
            "GPU has {} MB total VRAM, below the {} MB floor",
            info.total_mb, policy.min_total_mb
        ));
    }
    let needed = required_mb.saturating_add(policy.safety_margin_mb);
    if info.free_mb < needed {
        return reject(format!(
            "insufficient free VRAM: need {} MB ({} MB + {} MB margin), {} MB free",
            needed, required_mb, policy.safety_margin_mb, info.free_mb
        ));
    }
    Preflight::Admitted(info.clone())
}

/// Probes the GPU and manages its durable exclusive lease.
#[derive(Clone)]
pub struct GpuManager {
    store: Arc<dyn JobStore>,
    probe: Arc<dyn GpuProbe>,
    policy: GpuPolicy,
    lease_ttl_secs: i64,
}

impl GpuManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        probe: Arc<dyn GpuProbe>,
        policy: GpuPolicy,
        lease_ttl_secs: i64,
    ) -> Self {
        Self {
            store,
            probe,
            policy,
            lease_ttl_secs,
        }
    }

    pub fn policy(&self) -> &GpuPolicy {
        &self.policy
    }

    pub async fn probe(&self) -> GpuInfo {
        self.probe.probe().await
    }

    pub async fn preflight(&self, required_mb: u64) -> Preflight {
        async {
            let info = self.probe.probe().await;
            let outcome = evaluate_preflight(&info, required_mb, &self.policy);
            if let Preflight::Rejected { reason } = &outcome {
                debug!(required_mb, %reason, "gpu preflight rejected");
            }
            outcome
        }
        .instrument(crate::telemetry::gpu_span("preflight"))
        .await
    }

    /// Test-and-set on the GPU lock. `false` means another owner holds an
    /// unexpired lease; the caller must not dispatch.
    pub async fn acquire_exclusive(&self, owner: &str) -> anyhow::Result<bool> {
        let acquired = self
            .store
            .try_acquire_lock(GPU_RESOURCE, owner, self.lease_ttl_secs, Utc::now())
            .await?;
        debug!(owner, acquired, "gpu lease acquire");
        Ok(acquired)
    }

    pub async fn refresh_lease(&self, owner: &str) -> anyhow::Result<bool> {
        self.store
            .refresh_lock(GPU_RESOURCE, owner, Utc::now())
            .await
    }

    /// Release if held by `owner`. A missing or foreign lease is a no-op.
    pub async fn release(&self, owner: &str) -> anyhow::Result<()> {
        let released = self
            .store
            .release_lock(GPU_RESOURCE, owner)
            .await
            .with_context(|| format!("releasing gpu lease for {owner}"))?;
        debug!(owner, released, "gpu lease release");
        Ok(())
    }

    pub async fn current_lease(&self) -> anyhow::Result<Option<ResourceLease>> {
        Ok(self.store.locks().await?.remove(GPU_RESOURCE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(total_mb: u64, free_mb: u64) -> GpuInfo {
        GpuInfo {
            present: true,
            name: Some("Test GPU".into()),
            total_mb,
            free_mb,
            driver_version: Some("550.54".into()),
            cuda_version: Some("12.4".into()),
            cuda_available: true,
            source: "test".into(),
        }
    }

    #[test]
    fn test_preflight_rejects_when_margin_exceeds_free() {
        // 4096 + 1024 = 5120 > 5000
        let outcome = evaluate_preflight(&gpu(8192, 5000), 4096, &GpuPolicy::default());
        match outcome {
            Preflight::Rejected { reason } => {
                assert!(reason.contains("5120"), "{reason}")
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(evaluate_preflight(&gpu(8192, 5120), 4096, &GpuPolicy::default())
            .is_admitted());
    }

    #[test]
    fn test_preflight_floor_absent_and_cuda() {
        let policy = GpuPolicy::default();
        assert!(!evaluate_preflight(&gpu(6144, 6000), 0, &policy).is_admitted());
        assert!(!evaluate_preflight(&GpuInfo::absent("none"), 0, &policy)
            .is_admitted());

        let mut no_cuda = gpu(16384, 16000);
        no_cuda.cuda_available = false;
        assert!(!evaluate_preflight(&no_cuda, 0, &policy).is_admitted());
    }

    #[test]
    fn test_parse_query_csv() {
        let info = parse_query_csv("NVIDIA GeForce RTX 3080, 10240, 9800, 550.54.14\n")
            .expect("parsed");
        assert_eq!(info.name.as_deref(), Some("NVIDIA GeForce RTX 3080"));
        assert_eq!(info.total_mb, 10240);
        assert_eq!(info.free_mb, 9800);
        assert!(info.cuda_version.is_none());
        assert!(!info.cuda_available);

        assert!(parse_query_csv("").is_none());
        assert!(parse_query_csv("name, [N/A], 10, 1").is_none());
    }

    #[test]
    fn test_parse_smi_report_uses_fb_memory_section() {
        let report = "\
==============NVSMI LOG==============
Driver Version                            : 550.54.14
CUDA Version                              : 12.4
Attached GPUs                             : 1
GPU 00000000:01:00.0
    Product Name                          : NVIDIA GeForce RTX 3080
    FB Memory Usage
        Total                             : 10240 MiB
        Reserved                          : 250 MiB
        Used                              : 1000 MiB
        Free                              : 8990 MiB
    BAR1 Memory Usage
        Total                             : 256 MiB
        Used                              : 5 MiB
        Free                              : 251 MiB
";
        let info = parse_smi_report(report).expect("parsed");
        assert_eq!(info.total_mb, 10240);
        assert_eq!(info.free_mb, 8990);
        assert_eq!(info.cuda_version.as_deref(), Some("12.4"));
        assert_eq!(info.driver_version.as_deref(), Some("550.54.14"));
        assert!(info.cuda_available);

        assert!(parse_smi_report("garbage").is_none());
    }

    #[test]
    fn test_cuda_visible_devices() {
        assert!(cuda_visible_devices_enabled(None));
        assert!(cuda_visible_devices_enabled(Some("0")));
        assert!(!cuda_visible_devices_enabled(Some("")));
        assert!(!cuda_visible_devices_enabled(Some("-1")));
    }

    #[test]
    fn test_report_cuda_version() {
        let report = "Driver Version : 550.54\nCUDA Version : 12.4\n";
        assert_eq!(report_cuda_version(report).as_deref(), Some("12.4"));
        assert!(report_cuda_version("CUDA Version : N/A\n").is_none());
        assert!(report_cuda_version("Driver Version : 550.54\n").is_none());
    }

    #[cfg(unix)]
    fn fake_smi(dir: &tempfile::TempDir, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("nvidia-smi");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_smi_reports_absent() {
        let dir = tempfile::tempdir().unwrap();
        let probe = SystemGpuProbe::with_program(fake_smi(&dir, "exec sleep 3600"))
            .with_timeout(Duration::from_millis(200));

        let info = tokio::time::timeout(Duration::from_secs(5), probe.probe())
            .await
            .expect("probe bounded by its timeout");
        assert!(!info.present);
        assert_eq!(info.source, "timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cuda_version_comes_from_report() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_smi(
            &dir,
            r#"if [ "$1" = "-q" ]; then
  echo "Driver Version : 550.54.14"
  echo "CUDA Version : 12.4"
else
  echo "NVIDIA GeForce RTX 3080, 10240, 9800, 550.54.14"
fi"#,
        );

        let info = SystemGpuProbe::with_program(program).probe().await;
        assert!(info.present);
        assert_eq!(info.source, "nvidia-smi-query");
        assert_eq!(info.free_mb, 9800);
        assert_eq!(info.cuda_version.as_deref(), Some("12.4"));
        let visible = cuda_visible_devices_enabled(
            std::env::var("CUDA_VISIBLE_DEVICES").ok().as_deref(),
        );
        assert_eq!(info.cuda_available, visible);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_driver_without_cuda_is_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_smi(
            &dir,
            r#"if [ "$1" = "-q" ]; then
  echo "CUDA Version : N/A"
else
  echo "NVIDIA GeForce RTX 3080, 10240, 9800, 550.54.14"
fi"#,
        );

        let info = SystemGpuProbe::with_program(program).probe().await;
        assert!(info.present);
        assert!(!info.cuda_available);
        assert!(!evaluate_preflight(&info, 0, &GpuPolicy::default()).is_admitted());
    }
}
