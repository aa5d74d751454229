use std::sync::Arc;

use chrono::{DateTime, Utc};
use foreman::persistence::sqlite::format_timestamp;
use foreman::*;
use tempfile::TempDir;

/// A migrated SQLite store in a temporary directory, removed on drop.
pub struct TempStore {
    _dir: TempDir,
    pub url: String,
    pub sqlite: Arc<SqliteStore>,
}

impl TempStore {
    pub async fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let url = format!("sqlite://{}", dir.path().join("foreman.db").display());
        let sqlite = SqliteStore::connect(&PersistenceConfig::new(url.clone())).await?;
        Ok(Self {
            _dir: dir,
            url,
            sqlite: Arc::new(sqlite),
        })
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.sqlite.clone()
    }

    /// Rewind a job's heartbeat, simulating a worker that went silent.
    pub async fn backdate_heartbeat(
        &self,
        id: JobId,
        heartbeat: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE jobs SET heartbeat_ts = ?2 WHERE id = ?1")
            .bind(id.0)
            .bind(format_timestamp(heartbeat))
            .execute(self.sqlite.pool())
            .await?;
        Ok(())
    }

    /// Rewind a resource lock's timestamp so it reads as expired.
    pub async fn backdate_lock(
        &self,
        resource: &str,
        lease_ts: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE resource_locks SET lease_ts = ?2 WHERE name = ?1")
            .bind(resource)
            .bind(format_timestamp(lease_ts))
            .execute(self.sqlite.pool())
            .await?;
        Ok(())
    }
}

pub async fn temp_store() -> TempStore {
    match TempStore::new().await {
        Ok(store) => store,
        Err(err) => panic!("temporary store: {err:#}"),
    }
}
