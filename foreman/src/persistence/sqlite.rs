use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{ConnectOptions, Connection, Row};
use tracing::debug;

use crate::config::PersistenceConfig;
use crate::events::{EventCode, JobEvent, NewEvent, Severity};
use crate::job::{
    ErrorCode, JobFilter, JobId, JobRecord, JobStatus, NewJob, ResourceClass,
};
use crate::lease::ResourceLease;
use crate::queue::JobStore;

const PAUSED_KEY: &str = "paused";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        priority INTEGER NOT NULL,
        resource_class TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        lease_owner TEXT,
        lease_ts TEXT,
        heartbeat_ts TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        ended_at TEXT,
        available_at TEXT NOT NULL,
        error_code TEXT,
        error_message TEXT,
        vram_estimate_mb INTEGER NOT NULL DEFAULT 0,
        runtime_estimate_secs INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_jobs_dispatch
        ON jobs (status, priority, created_at, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        job_id INTEGER,
        level TEXT NOT NULL,
        code INTEGER NOT NULL,
        data TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events (job_id, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_checkpoints (
        job_id INTEGER PRIMARY KEY,
        payload TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resource_locks (
        name TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        lease_ts TEXT NOT NULL,
        ttl_seconds INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

const JOB_COLUMNS: &str = "id, kind, payload, priority, resource_class, \
    status, attempts, max_attempts, lease_owner, lease_ts, heartbeat_ts, \
    created_at, started_at, ended_at, available_at, error_code, \
    error_message, vram_estimate_mb, runtime_estimate_secs";

/// Fixed-width ISO-8601 UTC (`2026-01-02T03:04:05.000006Z`), so lexical
/// order in SQL matches time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn parse_optional_timestamp(
    raw: Option<String>,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

fn job_from_row(row: &SqliteRow) -> anyhow::Result<JobRecord> {
    let payload: String = row.try_get("payload")?;
    let resource_class: String = row.try_get("resource_class")?;
    let status: String = row.try_get("status")?;
    let error_code: Option<String> = row.try_get("error_code")?;
    let created_at: String = row.try_get("created_at")?;
    let available_at: String = row.try_get("available_at")?;

    Ok(JobRecord {
        id: JobId(row.try_get("id")?),
        kind: row.try_get("kind")?,
        payload: serde_json::from_str(&payload)?,
        priority: row.try_get("priority")?,
        resource_class: ResourceClass::from_str(&resource_class)?,
        status: JobStatus::from_str(&status)?,
        attempts: u32::try_from(row.try_get::<i64, _>("attempts")?)?,
        max_attempts: u32::try_from(row.try_get::<i64, _>("max_attempts")?)?,
        lease_owner: row.try_get("lease_owner")?,
        lease_timestamp: parse_optional_timestamp(row.try_get("lease_ts")?)?,
        heartbeat_timestamp: parse_optional_timestamp(
            row.try_get("heartbeat_ts")?,
        )?,
        created_at: parse_timestamp(&created_at)?,
        started_at: parse_optional_timestamp(row.try_get("started_at")?)?,
        ended_at: parse_optional_timestamp(row.try_get("ended_at")?)?,
        available_at: parse_timestamp(&available_at)?,
        error_code: error_code.as_deref().map(ErrorCode::from_str).transpose()?,
        error_message: row.try_get("error_message")?,
        vram_estimate_mb: u64::try_from(
            row.try_get::<i64, _>("vram_estimate_mb")?,
        )?,
        runtime_estimate_secs: u64::try_from(
            row.try_get::<i64, _>("runtime_estimate_secs")?,
        )?,
    })
}

fn event_from_row(row: &SqliteRow) -> anyhow::Result<JobEvent> {
    let ts: String = row.try_get("ts")?;
    let level: String = row.try_get("level")?;
    let data: String = row.try_get("data")?;
    let job_id: Option<i64> = row.try_get("job_id")?;

    Ok(JobEvent {
        id: row.try_get("id")?,
        timestamp: parse_timestamp(&ts)?,
        job_id: job_id.map(JobId),
        severity: Severity::from_str(&level)?,
        code: EventCode(u16::try_from(row.try_get::<i64, _>("code")?)?),
        data: serde_json::from_str(&data)?,
    })
}

/// SQLite-backed implementation of the job store.
///
/// Requires a file-backed database: scheduler and worker processes share
/// it, and heartbeats open their own connections.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    options: SqliteConnectOptions,
}

impl SqliteStore {
    /// Open (creating if missing) the database and apply the schema.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options.clone())
            .await?;

        let store = Self { pool, options };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_jobs(
        &self,
        sql: &str,
        binds: &[String],
    ) -> anyhow::Result<Vec<JobRecord>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn migrate(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("sqlite schema ready");
        Ok(())
    }

    async fn insert_job(&self, job: NewJob) -> anyhow::Result<JobId> {
        let now = format_timestamp(Utc::now());
        let payload = serde_json::to_string(&job.payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                kind, payload, priority, resource_class, status,
                attempts, max_attempts, created_at, available_at,
                vram_estimate_mb, runtime_estimate_secs
            )
            VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6, ?6, ?7, ?8)
            "#,
        )
        .bind(&job.kind)
        .bind(&payload)
        .bind(job.priority)
        .bind(job.resource_class.as_str())
        .bind(i64::from(job.max_attempts))
        .bind(&now)
        .bind(i64::try_from(job.vram_estimate_mb)?)
        .bind(i64::try_from(job.runtime_estimate_secs)?)
        .execute(&self.pool)
        .await?;

        Ok(JobId(result.last_insert_rowid()))
    }

    async fn get_job(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR kind = ?2)
            ORDER BY id DESC
            LIMIT ?3 OFFSET ?4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.kind.as_deref())
            .bind(i64::from(filter.limit))
            .bind(i64::from(filter.offset))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn eligible_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'queued'
              AND available_at <= ?1
            ORDER BY priority ASC, created_at ASC, id ASC
            "#
        );
        self.fetch_jobs(&sql, &[format_timestamp(now)]).await
    }

    async fn active_counts(
        &self,
    ) -> anyhow::Result<HashMap<ResourceClass, usize>> {
        let rows = sqlx::query(
            r#"
            SELECT resource_class, COUNT(*) AS n
            FROM jobs
            WHERE status IN ('leased', 'running')
            GROUP BY resource_class
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let class: String = row.try_get("resource_class")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(ResourceClass::from_str(&class)?, usize::try_from(n)?);
        }
        Ok(counts)
    }

    async fn status_counts(&self) -> anyhow::Result<HashMap<JobStatus, usize>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.insert(JobStatus::from_str(&status)?, usize::try_from(n)?);
        }
        Ok(counts)
    }

    async fn stale_jobs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status IN ('leased', 'running')
              AND (heartbeat_ts IS NULL OR heartbeat_ts < ?1)
            ORDER BY id ASC
            "#
        );
        self.fetch_jobs(&sql, &[format_timestamp(cutoff)]).await
    }

    async fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> anyhow::Result<bool> {
        let result =
            sqlx::query("UPDATE jobs SET status = ?3 WHERE id = ?1 AND status = ?2")
                .bind(id.0)
                .bind(from.as_str())
                .bind(to.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_leased(
        &self,
        id: JobId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'leased',
                attempts = attempts + 1,
                lease_owner = ?2,
                lease_ts = ?3,
                heartbeat_ts = ?3
            WHERE id = ?1
              AND status = 'queued'
            "#,
        )
        .bind(id.0)
        .bind(owner)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_running(
        &self,
        id: JobId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running',
                started_at = ?3,
                heartbeat_ts = ?3
            WHERE id = ?1
              AND lease_owner = ?2
              AND status = 'leased'
            "#,
        )
        .bind(id.0)
        .bind(owner)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_done(
        &self,
        id: JobId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done',
                ended_at = ?3,
                error_code = NULL,
                error_message = NULL
            WHERE id = ?1
              AND lease_owner = ?2
              AND status = 'running'
            "#,
        )
        .bind(id.0)
        .bind(owner)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_queued(
        &self,
        id: JobId,
        code: ErrorCode,
        message: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                ended_at = ?4,
                error_code = ?2,
                error_message = ?3
            WHERE id = ?1
              AND status = 'queued'
            "#,
        )
        .bind(id.0)
        .bind(code.as_str())
        .bind(message)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_owned(
        &self,
        id: JobId,
        owner: &str,
        code: ErrorCode,
        message: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                ended_at = ?5,
                error_code = ?3,
                error_message = ?4
            WHERE id = ?1
              AND lease_owner = ?2
              AND status IN ('leased', 'running')
            "#,
        )
        .bind(id.0)
        .bind(owner)
        .bind(code.as_str())
        .bind(message)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn requeue_owned(
        &self,
        id: JobId,
        owner: &str,
        available_at: DateTime<Utc>,
        code: ErrorCode,
        message: &str,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                lease_owner = NULL,
                lease_ts = NULL,
                heartbeat_ts = NULL,
                available_at = ?3,
                error_code = ?4,
                error_message = ?5
            WHERE id = ?1
              AND lease_owner = ?2
              AND status IN ('leased', 'running')
            "#,
        )
        .bind(id.0)
        .bind(owner)
        .bind(format_timestamp(available_at))
        .bind(code.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn requeue_stale(
        &self,
        id: JobId,
        owner: &str,
        cutoff: DateTime<Utc>,
        available_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                lease_owner = NULL,
                lease_ts = NULL,
                heartbeat_ts = NULL,
                available_at = ?4,
                error_message = COALESCE(error_message, 'heartbeat lost')
            WHERE id = ?1
              AND lease_owner = ?2
              AND status IN ('leased', 'running')
              AND (heartbeat_ts IS NULL OR heartbeat_ts < ?3)
            "#,
        )
        .bind(id.0)
        .bind(owner)
        .bind(format_timestamp(cutoff))
        .bind(format_timestamp(available_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_stale(
        &self,
        id: JobId,
        owner: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                ended_at = ?4,
                error_code = 'MAX_ATTEMPTS',
                error_message = 'heartbeat lost and attempts exhausted'
            WHERE id = ?1
              AND lease_owner = ?2
              AND status IN ('leased', 'running')
              AND (heartbeat_ts IS NULL OR heartbeat_ts < ?3)
            "#,
        )
        .bind(id.0)
        .bind(owner)
        .bind(format_timestamp(cutoff))
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn cancel_job(
        &self,
        id: JobId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'canceled',
                ended_at = ?2,
                error_code = 'CANCELED',
                error_message = 'canceled by request'
            WHERE id = ?1
              AND status IN ('queued', 'paused', 'leased', 'running')
            "#,
        )
        .bind(id.0)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn heartbeat(
        &self,
        id: JobId,
        owner: &str,
        resource: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let now = format_timestamp(now);
        let mut conn = self.options.connect().await?;

        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET heartbeat_ts = ?3
            WHERE id = ?1
              AND lease_owner = ?2
              AND status IN ('leased', 'running')
            "#,
        )
        .bind(id.0)
        .bind(owner)
        .bind(&now)
        .execute(&mut conn)
        .await?
        .rows_affected()
            == 1;

        if let Some(resource) = resource {
            sqlx::query(
                "UPDATE resource_locks SET lease_ts = ?3 WHERE name = ?1 AND owner = ?2",
            )
            .bind(resource)
            .bind(owner)
            .bind(&now)
            .execute(&mut conn)
            .await?;
        }

        conn.close().await?;
        Ok(updated)
    }

    async fn load_checkpoint(&self, id: JobId) -> anyhow::Result<Option<Value>> {
        let row = sqlx::query("SELECT payload FROM job_checkpoints WHERE job_id = ?1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let payload: String = row.try_get("payload")?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn save_checkpoint(
        &self,
        id: JobId,
        payload: &Value,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_checkpoints (job_id, payload, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(job_id) DO UPDATE
            SET payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id.0)
        .bind(serde_json::to_string(payload)?)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_event(&self, event: &NewEvent) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_events (ts, job_id, level, code, data)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(format_timestamp(event.timestamp))
        .bind(event.job_id.map(|id| id.0))
        .bind(event.severity.as_str())
        .bind(i64::from(event.code.value()))
        .bind(serde_json::to_string(&event.data)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_events(
        &self,
        id: JobId,
        limit: u32,
    ) -> anyhow::Result<Vec<JobEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, ts, job_id, level, code, data
            FROM job_events
            WHERE job_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )
        .bind(id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn is_paused(&self) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT value FROM scheduler_settings WHERE key = ?1")
            .bind(PAUSED_KEY)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<String, _>("value")? == "1"),
            None => Ok(false),
        }
    }

    async fn set_paused(&self, paused: bool) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_settings (key, value)
            VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(PAUSED_KEY)
        .bind(if paused { "1" } else { "0" })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        resource: &str,
        owner: &str,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        // The conflict branch only fires for the same owner or an expired
        // lease; otherwise the row is left untouched and 0 rows change.
        let result = sqlx::query(
            r#"
            INSERT INTO resource_locks (name, owner, lease_ts, ttl_seconds)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name) DO UPDATE
            SET owner = excluded.owner,
                lease_ts = excluded.lease_ts,
                ttl_seconds = excluded.ttl_seconds
            WHERE resource_locks.owner = excluded.owner
               OR julianday(resource_locks.lease_ts)
                  + resource_locks.ttl_seconds / 86400.0
                  < julianday(excluded.lease_ts)
            "#,
        )
        .bind(resource)
        .bind(owner)
        .bind(format_timestamp(now))
        .bind(ttl_secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn refresh_lock(
        &self,
        resource: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE resource_locks SET lease_ts = ?3 WHERE name = ?1 AND owner = ?2",
        )
        .bind(resource)
        .bind(owner)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(
        &self,
        resource: &str,
        owner: &str,
    ) -> anyhow::Result<bool> {
        let result =
            sqlx::query("DELETE FROM resource_locks WHERE name = ?1 AND owner = ?2")
                .bind(resource)
                .bind(owner)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn locks(&self) -> anyhow::Result<HashMap<String, ResourceLease>> {
        let rows = sqlx::query(
            "SELECT name, owner, lease_ts, ttl_seconds FROM resource_locks",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut locks = HashMap::new();
        for row in rows {
            let name: String = row.try_get("name")?;
            let lease_ts: String = row.try_get("lease_ts")?;
            locks.insert(
                name.clone(),
                ResourceLease {
                    resource: name,
                    owner: row.try_get("owner")?,
                    lease_timestamp: parse_timestamp(&lease_ts)?,
                    ttl_secs: row.try_get("ttl_seconds")?,
                },
            );
        }
        Ok(locks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    async fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
        let store = SqliteStore::connect(&PersistenceConfig::new(url))
            .await
            .expect("connect");
        (dir, store)
    }

    fn new_job(kind: &str, priority: i64) -> NewJob {
        NewJob {
            kind: kind.to_string(),
            payload: json!({"path": "/media/a.mkv"}),
            priority,
            max_attempts: 3,
            resource_class: ResourceClass::LightCpu,
            vram_estimate_mb: 0,
            runtime_estimate_secs: 10,
        }
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let ts = parse_timestamp("2026-01-02T03:04:05Z").unwrap();
        let formatted = format_timestamp(ts);
        assert_eq!(formatted, "2026-01-02T03:04:05.000000Z");
        assert_eq!(parse_timestamp(&formatted).unwrap(), ts);
    }

    #[tokio::test]
    async fn test_insert_and_get_job() {
        let (_dir, store) = temp_store().await;

        let first = store.insert_job(new_job("scan", 5)).await.unwrap();
        let second = store.insert_job(new_job("scan", 5)).await.unwrap();
        assert!(second > first, "ids are monotonically assigned");

        let job = store.get_job(first).await.unwrap().expect("job exists");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.payload, json!({"path": "/media/a.mkv"}));
        assert!(job.lease_owner.is_none());

        assert!(store.get_job(JobId(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eligible_jobs_ordering_and_backoff() {
        let (_dir, store) = temp_store().await;

        let low = store.insert_job(new_job("scan", 5)).await.unwrap();
        let high = store.insert_job(new_job("scan", 1)).await.unwrap();
        let low_later = store.insert_job(new_job("scan", 5)).await.unwrap();

        let ids: Vec<JobId> = store
            .eligible_jobs(Utc::now())
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![high, low, low_later]);

        // Requeue `high` with a backoff in the future: it drops out.
        let now = Utc::now();
        assert!(store.mark_leased(high, "w1", now).await.unwrap());
        assert!(store
            .requeue_owned(
                high,
                "w1",
                now + ChronoDuration::seconds(60),
                ErrorCode::Error,
                "boom",
            )
            .await
            .unwrap());
        let ids: Vec<JobId> = store
            .eligible_jobs(Utc::now())
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![low, low_later]);
    }

    #[tokio::test]
    async fn test_owner_guarded_transitions() {
        let (_dir, store) = temp_store().await;
        let id = store.insert_job(new_job("scan", 1)).await.unwrap();
        let now = Utc::now();

        assert!(store.mark_leased(id, "owner-a", now).await.unwrap());
        assert!(!store.mark_leased(id, "owner-b", now).await.unwrap());
        assert!(!store.mark_running(id, "owner-b", now).await.unwrap());
        assert!(store.mark_running(id, "owner-a", now).await.unwrap());
        assert!(!store.mark_done(id, "owner-b", now).await.unwrap());
        assert!(store.mark_done(id, "owner-a", now).await.unwrap());

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());
        assert!(job.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_blocks_worker_completion() {
        let (_dir, store) = temp_store().await;
        let id = store.insert_job(new_job("scan", 1)).await.unwrap();
        let now = Utc::now();

        assert!(store.mark_leased(id, "owner-a", now).await.unwrap());
        assert!(store.mark_running(id, "owner-a", now).await.unwrap());
        assert!(store.cancel_job(id, now).await.unwrap());
        assert!(!store.cancel_job(id, now).await.unwrap());
        assert!(!store.mark_done(id, "owner-a", now).await.unwrap());
        assert!(!store.heartbeat(id, "owner-a", None, now).await.unwrap());

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.error_code, Some(ErrorCode::Canceled));
    }

    #[tokio::test]
    async fn test_stale_requeue_respects_fresh_heartbeat() {
        let (_dir, store) = temp_store().await;
        let id = store.insert_job(new_job("scan", 1)).await.unwrap();
        let leased_at = Utc::now() - ChronoDuration::seconds(300);

        assert!(store.mark_leased(id, "owner-a", leased_at).await.unwrap());
        let cutoff = Utc::now() - ChronoDuration::seconds(60);
        let stale = store.stale_jobs(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);

        // A heartbeat lands between scan and requeue: requeue must not apply.
        assert!(store.heartbeat(id, "owner-a", None, Utc::now()).await.unwrap());
        assert!(!store
            .requeue_stale(id, "owner-a", cutoff, Utc::now())
            .await
            .unwrap());
        assert!(store.stale_jobs(cutoff).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_overwrite() {
        let (_dir, store) = temp_store().await;
        let id = JobId(7);

        assert!(store.load_checkpoint(id).await.unwrap().is_none());
        store
            .save_checkpoint(id, &json!({"done": [1, 2], "cursor": 2}))
            .await
            .unwrap();
        store.save_checkpoint(id, &json!({"cursor": 3})).await.unwrap();

        assert_eq!(
            store.load_checkpoint(id).await.unwrap(),
            Some(json!({"cursor": 3}))
        );
    }

    #[tokio::test]
    async fn test_events_append_only_newest_first() {
        let (_dir, store) = temp_store().await;
        let id = JobId(3);

        for n in 0..3 {
            store
                .append_event(&NewEvent::job(
                    id,
                    Severity::Info,
                    EventCode::JOB_STARTED,
                    json!({ "n": n }),
                ))
                .await
                .unwrap();
        }
        store
            .append_event(&NewEvent::scheduler(
                Severity::Warn,
                EventCode::TICK_ERROR,
                json!({}),
            ))
            .await
            .unwrap();

        let events = store.job_events(id, 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, json!({"n": 2}));
        assert_eq!(events[1].data, json!({"n": 1}));
        assert!(events[0].id > events[1].id);
    }

    #[tokio::test]
    async fn test_pause_flag_persists() {
        let (_dir, store) = temp_store().await;
        assert!(!store.is_paused().await.unwrap());
        store.set_paused(true).await.unwrap();
        assert!(store.is_paused().await.unwrap());
        store.set_paused(false).await.unwrap();
        assert!(!store.is_paused().await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_test_and_set() {
        let (_dir, store) = temp_store().await;
        let now = Utc::now();

        assert!(store.try_acquire_lock("gpu", "a", 30, now).await.unwrap());
        // Re-entrant for the same owner.
        assert!(store.try_acquire_lock("gpu", "a", 30, now).await.unwrap());
        // Held and unexpired for a different owner.
        assert!(!store.try_acquire_lock("gpu", "b", 30, now).await.unwrap());
        assert_eq!(store.locks().await.unwrap()["gpu"].owner, "a");

        // After expiry another owner can take it over.
        let later = now + ChronoDuration::seconds(31);
        assert!(store.try_acquire_lock("gpu", "b", 30, later).await.unwrap());
        assert_eq!(store.locks().await.unwrap()["gpu"].owner, "b");

        // Release by a non-owner is a no-op.
        assert!(!store.release_lock("gpu", "a").await.unwrap());
        assert!(store.release_lock("gpu", "b").await.unwrap());
        assert!(!store.release_lock("gpu", "b").await.unwrap());
        assert!(store.locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_resource_lock_alive() {
        let (_dir, store) = temp_store().await;
        let id = store.insert_job(new_job("render", 1)).await.unwrap();
        // Stored timestamps carry microseconds.
        let now = parse_timestamp(&format_timestamp(Utc::now())).unwrap();
        let long_ago = now - ChronoDuration::seconds(120);

        assert!(store.mark_leased(id, "owner-a", long_ago).await.unwrap());
        assert!(store.try_acquire_lock("gpu", "owner-a", 30, long_ago).await.unwrap());
        assert!(store.try_acquire_lock("scratch", "owner-a", 30, long_ago).await.unwrap());

        assert!(store.heartbeat(id, "owner-a", Some("gpu"), now).await.unwrap());

        let locks = store.locks().await.unwrap();
        assert_eq!(locks["gpu"].lease_timestamp, now);
        assert!(!locks["gpu"].is_expired_at(now));
        // The refreshed lock holds; the one the heartbeat did not name lapsed.
        assert!(!store.try_acquire_lock("gpu", "owner-b", 30, now).await.unwrap());
        assert!(store.try_acquire_lock("scratch", "owner-b", 30, now).await.unwrap());

        // A heartbeat from a former owner refreshes nothing.
        let later = now + ChronoDuration::seconds(10);
        assert!(!store.heartbeat(id, "owner-b", Some("gpu"), later).await.unwrap());
        assert_eq!(store.locks().await.unwrap()["gpu"].lease_timestamp, now);
    }

    #[tokio::test]
    async fn test_list_jobs_filters_and_pages() {
        let (_dir, store) = temp_store().await;
        let first = store.insert_job(new_job("scan", 1)).await.unwrap();
        let second = store.insert_job(new_job("scan", 1)).await.unwrap();
        let other = store.insert_job(new_job("thumb", 1)).await.unwrap();
        assert!(store.cancel_job(second, Utc::now()).await.unwrap());

        let ids = |jobs: Vec<JobRecord>| jobs.into_iter().map(|j| j.id).collect::<Vec<_>>();

        let scans = JobFilter::default().with_kind("scan");
        assert_eq!(ids(store.list_jobs(&scans).await.unwrap()), vec![second, first]);

        let queued_scans = scans.clone().with_status(JobStatus::Queued);
        assert_eq!(ids(store.list_jobs(&queued_scans).await.unwrap()), vec![first]);

        let newest = JobFilter::default().with_page(1, 0);
        assert_eq!(ids(store.list_jobs(&newest).await.unwrap()), vec![other]);
        let page = JobFilter::default().with_page(1, 1);
        assert_eq!(ids(store.list_jobs(&page).await.unwrap()), vec![second]);
    }
}
