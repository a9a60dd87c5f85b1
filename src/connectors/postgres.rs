//! Relational-B sources: PostgreSQL over a `postgres://` URL.
//!
//! Statements run through the simple-query protocol, so every value comes
//! back as text; type conformance is checked later by the pipeline. Rows are
//! read through a server-side cursor bounded by the row limit.

use super::{Connector, RawResult, SourceConnection};
use crate::error::{HubError, Result};
use crate::models::SourceType;
use serde_json::Value;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, warn};

const CURSOR: &str = "hub_extract";

pub struct PostgresConnector {
    source_id: String,
    url: String,
}

impl PostgresConnector {
    pub fn new(source_id: String, url: &str) -> Self {
        Self {
            source_id,
            url: url.trim().to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Connector for PostgresConnector {
    fn source_type(&self) -> SourceType {
        SourceType::RelationalB
    }

    async fn open(&self) -> Result<Box<dyn SourceConnection>> {
        let (client, connection) = tokio_postgres::connect(&self.url, NoTls)
            .await
            .map_err(|e| HubError::connection(&self.source_id, e))?;

        let source_id = self.source_id.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("Postgres connection for {} closed: {}", source_id, e);
            }
        });

        // Second line of defence behind the statement guard.
        client
            .batch_execute("SET default_transaction_read_only = on")
            .await
            .map_err(|e| HubError::connection(&self.source_id, e))?;

        debug!("Opened Postgres connection for {}", self.source_id);
        Ok(Box::new(PostgresConnection { client }))
    }
}

pub struct PostgresConnection {
    client: Client,
}

#[async_trait::async_trait]
impl SourceConnection for PostgresConnection {
    async fn probe(&mut self) -> Result<()> {
        if self.client.is_closed() {
            return Err(HubError::Query("connection is closed".into()));
        }
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| HubError::Query(e.to_string()))?;
        Ok(())
    }

    async fn query(&mut self, statement: &str, row_limit: usize) -> Result<RawResult> {
        let statement = statement.trim().trim_end_matches(';');
        let messages = if cursor_capable(statement) {
            self.fetch_bounded(statement, row_limit).await?
        } else {
            // SHOW and EXPLAIN return a handful of rows and cannot back a cursor.
            self.client
                .simple_query(statement)
                .await
                .map_err(|e| HubError::Query(e.to_string()))?
        };

        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<Value>> = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                if rows.len() > row_limit {
                    break;
                }
                if columns.is_empty() {
                    columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                let values = (0..row.len())
                    .map(|i| {
                        row.get(i)
                            .map(|s| Value::String(s.to_string()))
                            .unwrap_or(Value::Null)
                    })
                    .collect();
                rows.push(values);
            }
        }

        let truncated = rows.len() > row_limit;
        let mut result = RawResult::from_rows(columns, rows, row_limit);
        if truncated {
            result.total_records = None;
        }
        Ok(result)
    }
}

impl PostgresConnection {
    /// Read through a cursor so at most `row_limit + 1` rows are held in memory.
    async fn fetch_bounded(&self, statement: &str, row_limit: usize) -> Result<Vec<SimpleQueryMessage>> {
        let opened = self
            .client
            .batch_execute(&format!(
                "BEGIN READ ONLY; DECLARE {CURSOR} NO SCROLL CURSOR FOR {statement}"
            ))
            .await
            .map_err(|e| HubError::Query(e.to_string()));
        if let Err(e) = opened {
            self.rollback().await;
            return Err(e);
        }
        let fetched = self
            .client
            .simple_query(&format!("FETCH FORWARD {} FROM {CURSOR}", row_limit.saturating_add(1)))
            .await;
        self.rollback().await;
        fetched.map_err(|e| HubError::Query(e.to_string()))
    }

    /// End the read-only transaction, which also closes the cursor.
    async fn rollback(&self) {
        if let Err(e) = self.client.batch_execute("ROLLBACK").await {
            debug!("Rollback after query failed: {}", e);
        }
    }
}

/// Whether the statement is a query Postgres can declare a cursor for.
fn cursor_capable(statement: &str) -> bool {
    let head: String = statement
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_uppercase();
    matches!(head.as_str(), "SELECT" | "WITH" | "VALUES" | "TABLE")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_only_for_queries() {
        assert!(cursor_capable("SELECT * FROM parcels"));
        assert!(cursor_capable("  (select 1) union (select 2)"));
        assert!(cursor_capable("WITH t AS (SELECT 1) SELECT * FROM t"));
        assert!(!cursor_capable("SHOW search_path"));
        assert!(!cursor_capable("EXPLAIN SELECT 1"));
    }
}
