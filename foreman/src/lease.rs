use std::fmt::Display;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::JobId;

/// Resource-lock row name for the single exclusive GPU.
pub const GPU_RESOURCE: &str = "gpu";

/// Opaque identifier for the worker instance bound to a job dispatch.
///
/// Formatted as `job-<id>-<uuid>` so each dispatch of the same job gets a
/// distinct owner; writes from a superseded worker never match.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseOwner(String);

impl LeaseOwner {
    /// Create a fresh owner for a dispatch of `job_id` using UUID v7.
    pub fn for_job(job_id: JobId) -> Self {
        Self(format!("job-{}-{}", job_id, Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Job id encoded in the owner string, if it was minted by `for_job`.
    pub fn job_id(&self) -> Option<JobId> {
        let rest = self.0.strip_prefix("job-")?;
        let (id, _) = rest.split_once('-')?;
        id.parse().ok().map(JobId)
    }
}

impl Display for LeaseOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LeaseOwner {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for LeaseOwner {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A time-bounded exclusive claim on a named resource.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceLease {
    pub resource: String,
    pub owner: String,
    pub lease_timestamp: DateTime<Utc>,
    pub ttl_secs: i64,
}

impl ResourceLease {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Duration::try_seconds(self.ttl_secs)
            .and_then(|ttl| self.lease_timestamp.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() < now
    }

    /// Checks if the lease has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Configuration for retry backoff of requeued jobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_backoff_ms: 300000, // 5 minutes
        }
    }
}

/// Longest backoff ever applied, whatever the configuration says.
pub const MAX_RETRY_DELAY_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Computes the delay before a requeued job becomes eligible again.
///
/// Formula: delay = min(base_delay * 2^(attempts-1), max_backoff, one year)
pub fn compute_retry_delay(attempts: u32, config: &RetryConfig) -> Duration {
    if attempts == 0 {
        return Duration::milliseconds(0);
    }

    let exp = attempts.saturating_sub(1).min(62) as i32;
    let scaled = (config.base_delay_ms as f64) * 2f64.powi(exp);
    let capped = scaled
        .min(config.max_backoff_ms as f64)
        .min(MAX_RETRY_DELAY_MS as f64);
    let clamped_ms = capped.max(0.0) as i64;

    Duration::milliseconds(clamped_ms)
}

/// When a job requeued at `now` with `delay` becomes eligible. Saturates
/// instead of overflowing the calendar.
pub fn retry_available_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Heartbeats older than this instant mark a leased/running job as stale.
///
/// The detection window is twice the lease TTL.
pub fn stale_cutoff(now: DateTime<Utc>, lease_ttl_secs: i64) -> DateTime<Utc> {
    Duration::try_seconds(lease_ttl_secs.saturating_mul(2))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Result of recovering a job whose heartbeat went silent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StaleOutcome {
    /// Back to `queued`, eligible again after `delay_ms`.
    Requeue { delay_ms: u64 },
    /// Attempts exhausted: `failed` with `MAX_ATTEMPTS`.
    Exhausted,
}

/// Decides how to recover a stale job.
///
/// `attempts` already counts the dispatch that went silent.
pub fn process_stale_job(
    attempts: u32,
    max_attempts: u32,
    config: &RetryConfig,
) -> StaleOutcome {
    if attempts < max_attempts {
        let delay = compute_retry_delay(attempts, config);
        StaleOutcome::Requeue {
            delay_ms: delay.num_milliseconds().max(0) as u64,
        }
    } else {
        StaleOutcome::Exhausted
    }
}
