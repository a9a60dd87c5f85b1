//! Embedded-file sources: SQLite databases opened read-only.

use super::{Connector, RawResult, SourceConnection};
use crate::error::{HubError, Result};
use crate::models::SourceType;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct SqliteConnector {
    source_id: String,
    path: PathBuf,
}

impl SqliteConnector {
    pub fn new(source_id: String, conn_str: &str) -> Self {
        let path = conn_str.trim();
        let path = path.strip_prefix("sqlite://").unwrap_or(path);
        Self {
            source_id,
            path: PathBuf::from(path),
        }
    }
}

#[async_trait::async_trait]
impl Connector for SqliteConnector {
    fn source_type(&self) -> SourceType {
        SourceType::EmbeddedFile
    }

    async fn open(&self) -> Result<Box<dyn SourceConnection>> {
        let path = self.path.clone();
        let source_id = self.source_id.clone();
        let conn = tokio::task::spawn_blocking(move || {
            Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        })
        .await
        .map_err(|e| HubError::connection(&self.source_id, e))?
        .map_err(|e| HubError::connection(&source_id, e))?;

        debug!("Opened SQLite connection for {}", self.source_id);
        Ok(Box::new(SqliteConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

pub struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConnection {
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("SQLite connection lock poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| HubError::Query(format!("blocking task failed: {}", e)))?
    }
}

#[async_trait::async_trait]
impl SourceConnection for SqliteConnection {
    async fn probe(&mut self) -> Result<()> {
        self.blocking(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|e| HubError::Query(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn query(&mut self, statement: &str, row_limit: usize) -> Result<RawResult> {
        let statement = statement.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(&statement)
                .map_err(|e| HubError::Query(e.to_string()))?;
            if !stmt.readonly() {
                return Err(HubError::QueryRejected(
                    "statement would modify the database".into(),
                ));
            }

            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let width = columns.len();
            let mut rows = stmt.query([]).map_err(|e| HubError::Query(e.to_string()))?;

            let mut kept = Vec::new();
            let mut total = 0usize;
            while let Some(row) = rows.next().map_err(|e| HubError::Query(e.to_string()))? {
                total += 1;
                if kept.len() < row_limit {
                    let mut values = Vec::with_capacity(width);
                    for i in 0..width {
                        let v = row.get_ref(i).map_err(|e| HubError::Query(e.to_string()))?;
                        values.push(value_to_json(v));
                    }
                    kept.push(values);
                }
            }

            let mut result = RawResult::from_rows(columns, kept, row_limit);
            result.truncated = total > row_limit;
            result.total_records = Some(total);
            Ok(result)
        })
        .await
    }
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<blob {} bytes>", b.len())),
    }
}
