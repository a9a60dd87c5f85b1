//! Ad-hoc and extract queries against registered sources.
//!
//! Every statement passes the read-only guard before a pool is touched. Ad-hoc
//! queries and sync extracts share pools, timeout and truncation rules.

use crate::config::QuerySettings;
use crate::connectors::Record;
use crate::error::{HubError, Result};
use crate::registry::SourceRegistry;
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

const READ_ONLY_KEYWORDS: &[&str] = &["SELECT", "WITH", "SHOW", "DESCRIBE", "EXPLAIN", "VALUES"];

/// Keywords that write wherever they appear, including inside a statement that
/// starts read-only (data-modifying CTEs, `SELECT ... INTO`).
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE", "INTO",
];

/// Statement keywords that are also plausible column names (`copy`, `call`).
/// They only count where a nested statement can begin: after `(` or an
/// EXPLAIN prefix.
const STATEMENT_KEYWORDS: &[&str] = &[
    "MERGE", "UPSERT", "CALL", "EXEC", "EXECUTE", "COPY", "ATTACH", "DETACH", "VACUUM", "REINDEX",
    "PRAGMA",
];

const EXPLAIN_PREFIX: &[&str] = &["EXPLAIN", "ANALYZE", "ANALYSE", "VERBOSE"];

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+|[^\s\w]").expect("static regex"))
}

fn find_mutating_keyword(code: &str) -> Option<String> {
    let mut previous: Option<String> = None;
    for m in token_regex().find_iter(code) {
        let token = m.as_str().to_uppercase();
        if WRITE_KEYWORDS.contains(&token.as_str()) {
            return Some(token);
        }
        if STATEMENT_KEYWORDS.contains(&token.as_str()) {
            let at_statement_start = match previous.as_deref() {
                None | Some("(") => true,
                Some(p) => EXPLAIN_PREFIX.contains(&p),
            };
            if at_statement_start {
                return Some(token);
            }
        }
        previous = Some(token);
    }
    None
}

/// Result set returned to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub records: Vec<Record>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_records: Option<usize>,
}

/// Replace comments and quoted literals with spaces, leaving only SQL code.
/// Returns `None` for an unterminated comment or literal.
fn code_only(statement: &str) -> Option<String> {
    let chars: Vec<char> = statement.chars().collect();
    let mut out = String::with_capacity(statement.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                out.push(' ');
            }
            '/' if next == Some('*') => {
                i += 2;
                loop {
                    if i + 1 >= chars.len() {
                        return None;
                    }
                    if chars[i] == '*' && chars[i + 1] == '/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
                out.push(' ');
            }
            '\'' | '"' | '`' => {
                let quote = c;
                i += 1;
                loop {
                    if i >= chars.len() {
                        return None;
                    }
                    if chars[i] == quote {
                        // Doubled quote is an escaped quote.
                        if chars.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                out.push(' ');
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    Some(out)
}

/// Accept only single statements that begin with a read-only keyword.
pub fn check_read_only(statement: &str) -> Result<()> {
    let code = code_only(statement)
        .ok_or_else(|| HubError::QueryRejected("unterminated comment or literal".into()))?;

    let statements = code.split(';').filter(|s| !s.trim().is_empty()).count();
    if statements == 0 {
        return Err(HubError::QueryRejected("statement is empty".into()));
    }
    if statements > 1 {
        return Err(HubError::QueryRejected("multiple statements are not allowed".into()));
    }

    let body = code.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
    let keyword: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_uppercase();
    if !READ_ONLY_KEYWORDS.contains(&keyword.as_str()) {
        let shown = if keyword.is_empty() { "(none)" } else { keyword.as_str() };
        return Err(HubError::QueryRejected(format!(
            "only read-only statements are allowed, got {}",
            shown
        )));
    }

    if let Some(keyword) = find_mutating_keyword(&code) {
        return Err(HubError::QueryRejected(format!("statement contains {}", keyword)));
    }
    Ok(())
}

pub struct QueryExecutor {
    registry: Arc<SourceRegistry>,
    settings: QuerySettings,
}

impl QueryExecutor {
    pub fn new(registry: Arc<SourceRegistry>, settings: QuerySettings) -> Self {
        Self { registry, settings }
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    /// Run an ad-hoc statement. `row_limit` falls back to the configured default.
    pub async fn execute(
        &self,
        source_id: &str,
        statement: &str,
        row_limit: Option<usize>,
    ) -> Result<QueryResult> {
        let limit = row_limit
            .filter(|l| *l > 0)
            .unwrap_or(self.settings.default_row_limit);
        self.run(source_id, statement, limit).await
    }

    /// Run a sync extract, bounded by the sync safety cap.
    pub async fn extract(&self, source_id: &str, statement: &str) -> Result<QueryResult> {
        self.run(source_id, statement, self.settings.sync_row_cap).await
    }

    async fn run(&self, source_id: &str, statement: &str, limit: usize) -> Result<QueryResult> {
        check_read_only(statement)?;

        let pool = self.registry.pool(source_id).await?;
        let mut conn = pool.checkout().await?;

        let outcome = tokio::time::timeout(self.settings.timeout, conn.query(statement, limit)).await;
        match outcome {
            Ok(Ok(raw)) => {
                conn.release();
                debug!(
                    "Query on {} returned {} row(s){}",
                    source_id,
                    raw.records.len(),
                    if raw.truncated { " (truncated)" } else { "" }
                );
                Ok(QueryResult {
                    columns: raw.columns,
                    records: raw.records,
                    truncated: raw.truncated,
                    total_records: raw.total_records,
                })
            }
            Ok(Err(e)) => {
                warn!("Query on {} failed: {}", source_id, e);
                drop(conn);
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Query on {} timed out after {:?}; discarding connection",
                    source_id, self.settings.timeout
                );
                drop(conn);
                Err(HubError::QueryTimeout(self.settings.timeout))
            }
        }
    }
}
