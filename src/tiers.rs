//! Production and training tiers: the destinations sync jobs load into.
//!
//! Each tier is its own SQLite database with one `records_<data_type>` table
//! keyed by the schema's natural key.

use crate::connectors::Record;
use crate::error::{HubError, Result};
use crate::models::DataType;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Production,
    Training,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Training => "training",
        }
    }
}

/// A record ready to be written: natural key, payload and last-modified time.
#[derive(Debug, Clone)]
pub struct TierRecord {
    pub key: String,
    pub record: Record,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct TierStore {
    tier: Tier,
    conn: Arc<Mutex<Connection>>,
}

fn table(data_type: DataType) -> String {
    format!("records_{}", data_type.as_str())
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

impl TierStore {
    pub fn open(path: &Path, tier: Tier) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        info!("Opened {} tier at {:?}", tier.as_str(), path);
        Self::init(conn, tier)
    }

    pub fn open_in_memory(tier: Tier) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, tier)
    }

    fn init(conn: Connection, tier: Tier) -> Result<Self> {
        for data_type in DataType::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    record_key  TEXT PRIMARY KEY,
                    payload     TEXT NOT NULL,
                    modified_at TEXT
                );",
                table(data_type)
            ))?;
        }
        Ok(Self {
            tier,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("tier connection lock poisoned");
            f(&mut conn)
        })
        .await
        .map_err(|e| HubError::Storage(format!("blocking task failed: {}", e)))?
    }

    pub async fn get(&self, data_type: DataType, key: &str) -> Result<Option<TierRecord>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, Option<String>)> = conn
                .query_row(
                    &format!("SELECT payload, modified_at FROM {} WHERE record_key = ?1", table(data_type)),
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((payload, modified_at)) => Ok(Some(TierRecord {
                    key,
                    record: serde_json::from_str(&payload)?,
                    modified_at: parse_ts(modified_at),
                })),
                None => Ok(None),
            }
        })
        .await
    }

    /// Last-modified times of the given keys that already exist.
    pub async fn existing_timestamps(
        &self,
        data_type: DataType,
        keys: Vec<String>,
    ) -> Result<HashMap<String, Option<DateTime<Utc>>>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT modified_at FROM {} WHERE record_key = ?1",
                table(data_type)
            ))?;
            let mut found = HashMap::new();
            for key in keys {
                let ts: Option<Option<String>> =
                    stmt.query_row(params![key], |row| row.get(0)).optional()?;
                if let Some(ts) = ts {
                    found.insert(key, parse_ts(ts));
                }
            }
            Ok(found)
        })
        .await
    }

    /// Insert or replace records in one transaction. Returns rows written.
    pub async fn upsert(&self, data_type: DataType, records: Vec<TierRecord>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut written = 0;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO {} (record_key, payload, modified_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(record_key) DO UPDATE SET
                        payload = excluded.payload,
                        modified_at = excluded.modified_at",
                    table(data_type)
                ))?;
                for r in &records {
                    let payload = serde_json::to_string(&r.record)?;
                    written += stmt.execute(params![
                        r.key,
                        payload,
                        r.modified_at.map(|t| t.to_rfc3339())
                    ])?;
                }
            }
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    /// All records, optionally only those modified after `since`.
    pub async fn read_all(
        &self,
        data_type: DataType,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT payload, modified_at FROM {} ORDER BY record_key",
                table(data_type)
            ))?;
            let rows = stmt
                .query_map(params![], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut records = Vec::with_capacity(rows.len());
            for (payload, modified_at) in rows {
                if let Some(since) = since {
                    match parse_ts(modified_at) {
                        Some(ts) if ts > since => {}
                        _ => continue,
                    }
                }
                records.push(serde_json::from_str(&payload)?);
            }
            Ok(records)
        })
        .await
    }

    pub async fn count(&self, data_type: DataType) -> Result<usize> {
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", table(data_type)),
                params![],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }
}
