use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Durable job identifier, assigned monotonically by the store.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// Named resource pool with its own concurrency limit.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    HeavyAiGpu,
    LightCpu,
    IoLight,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 3] =
        [Self::HeavyAiGpu, Self::LightCpu, Self::IoLight];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HeavyAiGpu => "heavy_ai_gpu",
            Self::LightCpu => "light_cpu",
            Self::IoLight => "io_light",
        }
    }

    /// Whether jobs of this class need the exclusive GPU lease.
    pub fn requires_gpu(&self) -> bool {
        matches!(self, Self::HeavyAiGpu)
    }
}

impl Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heavy_ai_gpu" => Ok(Self::HeavyAiGpu),
            "light_cpu" => Ok(Self::LightCpu),
            "io_light" => Ok(Self::IoLight),
            other => Err(anyhow::anyhow!("unknown resource class: {other}")),
        }
    }
}

/// Job lifecycle states.
///
/// `queued -> leased -> running -> {done | failed | canceled}`, with
/// `queued <-> paused` and stale `leased/running -> queued`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Leased,
    Running,
    Paused,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    /// Leased or running: the job occupies a concurrency slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Leased | Self::Running)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "leased" => Ok(Self::Leased),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(anyhow::anyhow!("unknown job status: {other}")),
        }
    }
}

/// Failure taxonomy surfaced through a job's `error_code`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Vetoed by the kind's precondition before dispatch.
    Precondition,
    /// GPU preflight rejected the job.
    GpuUnavailable,
    CudaOom,
    RateLimit,
    Error,
    /// Heartbeat went stale with no attempts left.
    MaxAttempts,
    Canceled,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Precondition => "PRECONDITION",
            Self::GpuUnavailable => "GPU_UNAVAILABLE",
            Self::CudaOom => "CUDA_OOM",
            Self::RateLimit => "RATE_LIMIT",
            Self::Error => "ERROR",
            Self::MaxAttempts => "MAX_ATTEMPTS",
            Self::Canceled => "CANCELED",
        }
    }

    /// Runtime failures raised by a job body may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CudaOom | Self::RateLimit | Self::Error)
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PRECONDITION" => Ok(Self::Precondition),
            "GPU_UNAVAILABLE" => Ok(Self::GpuUnavailable),
            "CUDA_OOM" => Ok(Self::CudaOom),
            "RATE_LIMIT" => Ok(Self::RateLimit),
            "ERROR" => Ok(Self::Error),
            "MAX_ATTEMPTS" => Ok(Self::MaxAttempts),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(anyhow::anyhow!("unknown error code: {other}")),
        }
    }
}

/// A job row as stored durably.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: String,
    pub payload: Value,
    /// Lower dispatches first.
    pub priority: i64,
    pub resource_class: ResourceClass,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub lease_owner: Option<String>,
    pub lease_timestamp: Option<DateTime<Utc>>,
    pub heartbeat_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Earliest time a queued job may be dispatched (retry backoff).
    pub available_at: DateTime<Utc>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub vram_estimate_mb: u64,
    pub runtime_estimate_secs: u64,
}

impl JobRecord {
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Insert request for a new `queued` job.
#[derive(Clone, Debug)]
pub struct NewJob {
    pub kind: String,
    pub payload: Value,
    pub priority: i64,
    pub max_attempts: u32,
    pub resource_class: ResourceClass,
    pub vram_estimate_mb: u64,
    pub runtime_estimate_secs: u64,
}

/// Filter for listing jobs.
#[derive(Clone, Debug)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            kind: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}
