//! Durable hub state backed by SQLite.
//!
//! Source configs, mappings, schedules, job history, conflicts and audit
//! trails survive restarts. Entities are stored as JSON payloads keyed by their
//! identifiers; a few columns are duplicated out of the payload for filtering.

use crate::error::{HubError, Result};
use crate::models::{DataSourceConfig, FieldMapping, JobStatus, SyncConflict, SyncJob, SyncSchedule};
use crate::notify::DeliveryRecord;
use crate::sanitizer::AuditEntry;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sources (
    source_id TEXT PRIMARY KEY,
    payload   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS mappings (
    data_type    TEXT NOT NULL,
    mapping_name TEXT NOT NULL,
    payload      TEXT NOT NULL,
    PRIMARY KEY (data_type, mapping_name)
);
CREATE TABLE IF NOT EXISTS schedules (
    schedule_id TEXT PRIMARY KEY,
    payload     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS jobs (
    job_id      TEXT PRIMARY KEY,
    schedule_id TEXT,
    status      TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    payload     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS jobs_by_status ON jobs (status);
CREATE TABLE IF NOT EXISTS conflicts (
    conflict_id TEXT PRIMARY KEY,
    job_id      TEXT NOT NULL,
    payload     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS conflicts_by_job ON conflicts (job_id);
CREATE TABLE IF NOT EXISTS sanitization_audit (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id       TEXT NOT NULL,
    field        TEXT NOT NULL,
    strategy     TEXT NOT NULL,
    rule_version TEXT NOT NULL,
    applied_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS notification_log (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    channel   TEXT NOT NULL,
    severity  TEXT NOT NULL,
    job_id    TEXT,
    success   INTEGER NOT NULL,
    attempts  INTEGER NOT NULL,
    message   TEXT,
    logged_at TEXT NOT NULL
);
"#;

/// SQLite-backed store for all durable hub records.
#[derive(Clone)]
pub struct HubStore {
    conn: Arc<Mutex<Connection>>,
}

impl HubStore {
    /// Open (or create) the state database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        info!("Opened hub state database at {:?}", path);
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("SQLite connection lock poisoned");
            f(&mut conn)
        })
        .await
        .map_err(|e| HubError::Storage(format!("blocking task failed: {}", e)))?
    }

    // ========================================================================
    // Sources
    // ========================================================================

    pub async fn put_source(&self, source: &DataSourceConfig) -> Result<()> {
        let id = source.source_id.clone();
        let payload = serde_json::to_string(source)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sources (source_id, payload) VALUES (?1, ?2)
                 ON CONFLICT(source_id) DO UPDATE SET payload = excluded.payload",
                params![id, payload],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_sources(&self) -> Result<Vec<DataSourceConfig>> {
        self.with_conn(|conn| query_payloads(conn, "SELECT payload FROM sources ORDER BY source_id", params![]))
            .await
    }

    pub async fn delete_source(&self, source_id: &str) -> Result<bool> {
        let id = source_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute("DELETE FROM sources WHERE source_id = ?1", params![id])? > 0)
        })
        .await
    }

    // ========================================================================
    // Mappings
    // ========================================================================

    pub async fn put_mapping(&self, mapping: &FieldMapping) -> Result<()> {
        let data_type = mapping.data_type.as_str();
        let name = mapping.mapping_name.clone();
        let payload = serde_json::to_string(mapping)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO mappings (data_type, mapping_name, payload) VALUES (?1, ?2, ?3)
                 ON CONFLICT(data_type, mapping_name) DO UPDATE SET payload = excluded.payload",
                params![data_type, name, payload],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_mappings(&self) -> Result<Vec<FieldMapping>> {
        self.with_conn(|conn| {
            query_payloads(
                conn,
                "SELECT payload FROM mappings ORDER BY data_type, mapping_name",
                params![],
            )
        })
        .await
    }

    pub async fn delete_mapping(&self, data_type: &str, name: &str) -> Result<bool> {
        let (data_type, name) = (data_type.to_string(), name.to_string());
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM mappings WHERE data_type = ?1 AND mapping_name = ?2",
                params![data_type, name],
            )? > 0)
        })
        .await
    }

    // ========================================================================
    // Schedules
    // ========================================================================

    pub async fn put_schedule(&self, schedule: &SyncSchedule) -> Result<()> {
        let id = schedule.schedule_id.clone();
        let payload = serde_json::to_string(schedule)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO schedules (schedule_id, payload) VALUES (?1, ?2)
                 ON CONFLICT(schedule_id) DO UPDATE SET payload = excluded.payload",
                params![id, payload],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_schedules(&self) -> Result<Vec<SyncSchedule>> {
        self.with_conn(|conn| {
            query_payloads(conn, "SELECT payload FROM schedules ORDER BY schedule_id", params![])
        })
        .await
    }

    pub async fn delete_schedule(&self, schedule_id: &str) -> Result<bool> {
        let id = schedule_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute("DELETE FROM schedules WHERE schedule_id = ?1", params![id])? > 0)
        })
        .await
    }

    // ========================================================================
    // Jobs & conflicts
    // ========================================================================

    /// Insert or replace a job report.
    pub async fn put_job(&self, job: &SyncJob) -> Result<()> {
        let id = job.job_id.clone();
        let schedule_id = job.schedule_id.clone();
        let status = status_str(job.status);
        let started_at = job.started_at.to_rfc3339();
        let payload = serde_json::to_string(job)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO jobs (job_id, schedule_id, status, started_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(job_id) DO UPDATE SET
                    status = excluded.status, payload = excluded.payload",
                params![id, schedule_id, status, started_at, payload],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<SyncJob>> {
        let id = job_id.to_string();
        self.with_conn(move |conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM jobs WHERE job_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            payload
                .map(|p| serde_json::from_str(&p).map_err(HubError::from))
                .transpose()
        })
        .await
    }

    /// Most recent jobs first.
    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<SyncJob>> {
        let limit = limit as i64;
        self.with_conn(move |conn| {
            query_payloads(
                conn,
                "SELECT payload FROM jobs ORDER BY started_at DESC LIMIT ?1",
                params![limit],
            )
        })
        .await
    }

    pub async fn put_conflicts(&self, conflicts: &[SyncConflict]) -> Result<()> {
        if conflicts.is_empty() {
            return Ok(());
        }
        let rows = conflicts
            .iter()
            .map(|c| Ok((c.conflict_id.clone(), c.job_id.clone(), serde_json::to_string(c)?)))
            .collect::<Result<Vec<_>>>()?;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO conflicts (conflict_id, job_id, payload) VALUES (?1, ?2, ?3)",
                )?;
                for (id, job_id, payload) in &rows {
                    stmt.execute(params![id, job_id, payload])?;
                }
            }
            tx.commit()?;
            debug!("Inserted {} conflicts", rows.len());
            Ok(())
        })
        .await
    }

    pub async fn list_conflicts(&self, job_id: &str) -> Result<Vec<SyncConflict>> {
        let id = job_id.to_string();
        self.with_conn(move |conn| {
            query_payloads(
                conn,
                "SELECT payload FROM conflicts WHERE job_id = ?1 ORDER BY conflict_id",
                params![id],
            )
        })
        .await
    }

    /// Mark every job left `running` by a previous process as failed.
    pub async fn reconcile_interrupted_jobs(&self) -> Result<Vec<String>> {
        let running: Vec<SyncJob> = self
            .with_conn(|conn| {
                query_payloads(conn, "SELECT payload FROM jobs WHERE status = 'running'", params![])
            })
            .await?;

        let mut ids = Vec::with_capacity(running.len());
        for mut job in running {
            warn!("Job {} was interrupted by a restart, marking failed", job.job_id);
            job.fail("interrupted: process restarted");
            self.put_job(&job).await?;
            ids.push(job.job_id);
        }
        Ok(ids)
    }

    // ========================================================================
    // Audit trails
    // ========================================================================

    pub async fn append_audit(&self, entries: Vec<AuditEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO sanitization_audit (job_id, field, strategy, rule_version, applied_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for e in &entries {
                    stmt.execute(params![
                        e.job_id,
                        e.field,
                        e.strategy,
                        e.rule_version,
                        e.applied_at.to_rfc3339()
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn list_audit(&self, job_id: &str) -> Result<Vec<AuditEntry>> {
        let id = job_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT job_id, field, strategy, rule_version, applied_at
                 FROM sanitization_audit WHERE job_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![id], |row| {
                let applied_at: String = row.get(4)?;
                Ok(AuditEntry {
                    job_id: row.get(0)?,
                    field: row.get(1)?,
                    strategy: row.get(2)?,
                    rule_version: row.get(3)?,
                    applied_at: chrono::DateTime::parse_from_rfc3339(&applied_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?;
            let entries = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }

    pub async fn log_notification(&self, record: &DeliveryRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO notification_log
                    (channel, severity, job_id, success, attempts, message, logged_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.channel.as_str(),
                    format!("{:?}", record.severity).to_lowercase(),
                    record.job_id,
                    record.success,
                    record.attempts,
                    record.message,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Count logged delivery attempts as `(succeeded, failed)`.
    pub async fn notification_outcomes(&self) -> Result<(usize, usize)> {
        self.with_conn(|conn| {
            let (ok, failed): (i64, i64) = conn.query_row(
                "SELECT COALESCE(SUM(success), 0), COALESCE(SUM(1 - success), 0) FROM notification_log",
                params![],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok((ok as usize, failed as usize))
        })
        .await
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Running => "running",
        JobStatus::Succeeded => "succeeded",
        JobStatus::Failed => "failed",
        JobStatus::Partial => "partial",
    }
}

/// Run a single-column payload query and deserialize every row.
fn query_payloads<T, P>(conn: &Connection, sql: &str, params: P) -> Result<Vec<T>>
where
    T: serde::de::DeserializeOwned,
    P: rusqlite::Params,
{
    let mut stmt = conn.prepare(sql)?;
    let payloads = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    payloads
        .iter()
        .map(|p| serde_json::from_str(p).map_err(HubError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobType, SourceStatus, SourceType};
    use std::collections::BTreeMap;

    fn source(id: &str) -> DataSourceConfig {
        DataSourceConfig {
            source_id: id.to_string(),
            source_type: SourceType::EmbeddedFile,
            connection_string: "/tmp/cama.sqlite".to_string(),
            refresh_interval_minutes: 30,
            enabled: true,
            status: SourceStatus::Connected,
            last_sync: None,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_source_upsert_and_delete() {
        let store = HubStore::open_in_memory().unwrap();
        store.put_source(&source("a")).await.unwrap();
        let mut updated = source("a");
        updated.refresh_interval_minutes = 90;
        store.put_source(&updated).await.unwrap();

        let all = store.list_sources().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].refresh_interval_minutes, 90);

        assert!(store.delete_source("a").await.unwrap());
        assert!(!store.delete_source("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_marks_running_jobs_failed() {
        let store = HubStore::open_in_memory().unwrap();
        let running = SyncJob::start(JobType::FullSync, Some("sch_1".into()));
        let mut done = SyncJob::start(JobType::FullSync, None);
        done.status = JobStatus::Succeeded;
        store.put_job(&running).await.unwrap();
        store.put_job(&done).await.unwrap();

        let ids = store.reconcile_interrupted_jobs().await.unwrap();
        assert_eq!(ids, vec![running.job_id.clone()]);

        let job = store.get_job(&running.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.finished_at.is_some());
        assert_eq!(store.get_job(&done.job_id).await.unwrap().unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite");
        {
            let store = HubStore::open(&path).unwrap();
            store.put_source(&source("persisted")).await.unwrap();
        }
        let store = HubStore::open(&path).unwrap();
        let all = store.list_sources().await.unwrap();
        assert_eq!(all[0].source_id, "persisted");
    }
}
