use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobId;
use crate::queue::JobStore;

/// Upper bound for stack traces and error text stored in event data.
pub const MAX_TRACE_BYTES: usize = 4096;

/// Event severity levels.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(anyhow::anyhow!("unknown severity: {other}")),
        }
    }
}

/// Numeric event code.
///
/// Codes below 1000 are reserved for the orchestrator; job bodies may emit
/// their own codes from 1000 up.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventCode(pub u16);

impl EventCode {
    pub const JOB_ENQUEUED: Self = Self(100);
    pub const JOB_PAUSED: Self = Self(101);
    pub const JOB_RESUMED: Self = Self(102);
    pub const JOB_DISPATCHED: Self = Self(110);
    pub const JOB_STARTED: Self = Self(120);
    pub const JOB_COMPLETED: Self = Self(200);
    pub const JOB_RETRYING: Self = Self(210);
    pub const JOB_FAILED: Self = Self(300);
    pub const PRECONDITION_VETO: Self = Self(310);
    pub const GPU_UNAVAILABLE: Self = Self(320);
    pub const LAUNCH_FAILED: Self = Self(330);
    pub const STALE_REQUEUED: Self = Self(400);
    pub const STALE_EXHAUSTED: Self = Self(410);
    pub const JOB_CANCELED: Self = Self(500);
    pub const SCHEDULER_PAUSED: Self = Self(600);
    pub const SCHEDULER_RESUMED: Self = Self(601);
    pub const LEASE_RELEASED: Self = Self(700);
    pub const TICK_ERROR: Self = Self(900);
    pub const FIRST_CUSTOM: Self = Self(1000);

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Append-only structured event as stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    /// `None` for scheduler-wide events.
    pub job_id: Option<JobId>,
    pub severity: Severity,
    pub code: EventCode,
    pub data: Value,
}

/// Event to be appended.
#[derive(Clone, Debug)]
pub struct NewEvent {
    pub timestamp: DateTime<Utc>,
    pub job_id: Option<JobId>,
    pub severity: Severity,
    pub code: EventCode,
    pub data: Value,
}

impl NewEvent {
    pub fn job(
        job_id: JobId,
        severity: Severity,
        code: EventCode,
        data: Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            job_id: Some(job_id),
            severity,
            code,
            data,
        }
    }

    pub fn scheduler(severity: Severity, code: EventCode, data: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            job_id: None,
            severity,
            code,
            data,
        }
    }
}

/// Truncate text to `MAX_TRACE_BYTES` on a char boundary.
pub fn bounded_trace(text: &str) -> String {
    if text.len() <= MAX_TRACE_BYTES {
        return text.to_string();
    }
    let mut end = MAX_TRACE_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &text[..end])
}

/// Log an event through `tracing` and append it to the durable log.
///
/// A failed append is logged and swallowed: losing a diagnostic record must
/// not abort the state transition it describes.
pub async fn emit(store: &dyn JobStore, event: NewEvent) {
    let job_id = event.job_id.map(|id| id.0);
    match event.severity {
        Severity::Debug => tracing::debug!(
            job_id, code = event.code.0, data = %event.data, "job event"
        ),
        Severity::Info => tracing::info!(
            job_id, code = event.code.0, data = %event.data, "job event"
        ),
        Severity::Warn => tracing::warn!(
            job_id, code = event.code.0, data = %event.data, "job event"
        ),
        Severity::Error => tracing::error!(
            job_id, code = event.code.0, data = %event.data, "job event"
        ),
    }

    if let Err(err) = store.append_event(&event).await {
        tracing::warn!(job_id, code = event.code.0, "append event failed: {err:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_trace_short_text_untouched() {
        assert_eq!(bounded_trace("boom"), "boom");
    }

    #[test]
    fn test_bounded_trace_truncates_on_char_boundary() {
        let text = "é".repeat(MAX_TRACE_BYTES);
        let bounded = bounded_trace(&text);
        assert!(bounded.ends_with("...[truncated]"));
        assert!(bounded.len() <= MAX_TRACE_BYTES + "...[truncated]".len());
    }

    #[test]
    fn test_severity_round_trip() {
        for severity in
            [Severity::Debug, Severity::Info, Severity::Warn, Severity::Error]
        {
            assert_eq!(severity.as_str().parse::<Severity>().unwrap(), severity);
        }
    }

    #[test]
    fn test_reserved_codes_below_custom_range() {
        assert!(EventCode::TICK_ERROR.value() < EventCode::FIRST_CUSTOM.value());
        assert_eq!(EventCode::JOB_ENQUEUED.to_string(), "100");
    }
}
