//! Source connector abstraction.
//!
//! Each [`SourceType`] maps to one connector, chosen once when the source is
//! registered. A connector opens [`SourceConnection`]s, which the pool hands
//! out for probes and read-only queries.

pub mod flat_file;
pub mod mysql;
pub mod postgres;
pub mod sqlite;
#[cfg(test)]
pub mod testing;

use crate::error::{HubError, Result};
use crate::models::{DataSourceConfig, SourceType};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};

/// One record as column name -> JSON value.
pub type Record = Map<String, Value>;

/// Rows returned by a connection, already cut to the requested limit.
#[derive(Debug, Clone, Default)]
pub struct RawResult {
    pub columns: Vec<String>,
    pub records: Vec<Record>,
    pub truncated: bool,
    /// Full row count, when the driver saw every row anyway.
    pub total_records: Option<usize>,
}

impl RawResult {
    /// Build a result from row-major values, keeping at most `row_limit` rows.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>, row_limit: usize) -> Self {
        let total = rows.len();
        let records = rows
            .into_iter()
            .take(row_limit)
            .map(|values| to_record(&columns, values))
            .collect();
        Self {
            columns,
            records,
            truncated: total > row_limit,
            total_records: Some(total),
        }
    }
}

/// Zip column names with values; missing trailing values become null.
pub fn to_record(columns: &[String], values: Vec<Value>) -> Record {
    let mut values = values.into_iter();
    columns
        .iter()
        .map(|c| (c.clone(), values.next().unwrap_or(Value::Null)))
        .collect()
}

/// A live connection to a data source.
#[async_trait::async_trait]
pub trait SourceConnection: Send {
    /// Cheap liveness check. Never opens a transaction.
    async fn probe(&mut self) -> Result<()>;

    /// Run a statement that has already passed the read-only guard.
    async fn query(&mut self, statement: &str, row_limit: usize) -> Result<RawResult>;
}

/// Opens connections for one registered source.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    fn source_type(&self) -> SourceType;
    async fn open(&self) -> Result<Box<dyn SourceConnection>>;
}

/// Select the connector for a source. Called once at registration time.
pub fn connector_for(config: &DataSourceConfig) -> Result<Arc<dyn Connector>> {
    validate_connection_string(config.source_type, &config.connection_string)?;
    let id = config.source_id.clone();
    let conn_str = config.connection_string.as_str();

    let connector: Arc<dyn Connector> = match config.source_type {
        SourceType::RelationalA => Arc::new(mysql::MySqlConnector::from_key_values(id, conn_str)?),
        SourceType::RelationalB => Arc::new(postgres::PostgresConnector::new(id, conn_str)),
        SourceType::EmbeddedFile => Arc::new(sqlite::SqliteConnector::new(id, conn_str)),
        SourceType::FlatFile => Arc::new(flat_file::FlatFileConnector::new(
            id,
            conn_str,
            config.metadata.get("sheet").cloned(),
        )),
    };
    Ok(connector)
}

// ============================================================================
// Connection string shape & redaction
// ============================================================================

fn password_kv_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(pwd|password)\s*=\s*[^;]*").expect("static regex"))
}

fn url_credentials_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"://([^:/@]+):([^@]*)@").expect("static regex"))
}

/// Basic shape check per source type. Not a full parse.
pub fn validate_connection_string(source_type: SourceType, conn_str: &str) -> Result<()> {
    let s = conn_str.trim();
    if s.is_empty() {
        return Err(HubError::InvalidConfig("connection string is empty".into()));
    }

    let ok = match source_type {
        SourceType::RelationalA => mysql::KeyValueSettings::parse(s).is_ok(),
        SourceType::RelationalB => {
            (s.starts_with("postgres://") || s.starts_with("postgresql://"))
                && s.split("://").nth(1).map(|rest| !rest.is_empty()).unwrap_or(false)
        }
        SourceType::EmbeddedFile => !s.starts_with("file://"),
        SourceType::FlatFile => {
            s.starts_with("file://") && flat_file::is_supported_extension(s)
        }
    };

    if ok {
        Ok(())
    } else {
        Err(HubError::InvalidConfig(format!(
            "connection string does not match the {} format",
            source_type.as_str()
        )))
    }
}

/// Mask credentials so the string can be shown to callers and logged.
pub fn redact_connection_string(conn_str: &str) -> String {
    let redacted = password_kv_regex().replace_all(conn_str, "$1=***");
    url_credentials_regex()
        .replace_all(&redacted, "://$1:***@")
        .into_owned()
}

/// Remove any credential taken from `conn_str` out of a driver message.
pub fn scrub_credentials(message: &str, conn_str: &str) -> String {
    let mut secrets: Vec<String> = password_kv_regex()
        .find_iter(conn_str)
        .filter_map(|m| m.as_str().split_once('=').map(|(_, v)| v.trim().to_string()))
        .collect();
    secrets.extend(
        url_credentials_regex()
            .captures_iter(conn_str)
            .filter_map(|c| c.get(2).map(|m| m.as_str().to_string())),
    );

    let mut scrubbed = message.replace(conn_str, &redact_connection_string(conn_str));
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        scrubbed = scrubbed.replace(secret.as_str(), "***");
    }
    scrubbed
}

/// Parse `Key=Value;Key=Value` into lower-cased keys, preserving order.
pub fn parse_key_values(conn_str: &str) -> Vec<(String, String)> {
    conn_str
        .split(';')
        .filter_map(|part| {
            let (k, v) = part.split_once('=')?;
            let key = k.trim().to_lowercase();
            if key.is_empty() {
                None
            } else {
                Some((key, v.trim().to_string()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_key_value_password() {
        let s = "Driver={ODBC};Server=db01,1433;Database=cama;Uid=svc;Pwd=s3cr3t;";
        let redacted = redact_connection_string(s);
        assert!(!redacted.contains("s3cr3t"));
        assert!(redacted.contains("Pwd=***"));
        assert!(redacted.contains("Server=db01,1433"));
    }

    #[test]
    fn test_redact_url_password() {
        let redacted = redact_connection_string("postgres://svc:hunter2@db:5432/assess");
        assert_eq!(redacted, "postgres://svc:***@db:5432/assess");
    }

    #[test]
    fn test_redact_leaves_file_paths() {
        assert_eq!(redact_connection_string("file:///data/sales.csv"), "file:///data/sales.csv");
    }

    #[test]
    fn test_scrub_credentials_from_driver_message() {
        let conn = "Server=db;Database=cama;Uid=svc;Pwd=s3cr3t";
        let msg = "login failed using password s3cr3t for Server=db;Database=cama;Uid=svc;Pwd=s3cr3t";
        let scrubbed = scrub_credentials(msg, conn);
        assert!(!scrubbed.contains("s3cr3t"));

        let url = "postgres://svc:hunter2@db/assess";
        assert!(!scrub_credentials("bad password hunter2", url).contains("hunter2"));
    }

    #[test]
    fn test_validate_shapes() {
        assert!(validate_connection_string(
            SourceType::RelationalA,
            "Server=db;Database=cama;Uid=u;Pwd=p"
        )
        .is_ok());
        assert!(validate_connection_string(SourceType::RelationalA, "db01").is_err());
        assert!(validate_connection_string(SourceType::RelationalA, "Server=db;Uid=u").is_err());
        assert!(validate_connection_string(SourceType::RelationalB, "postgres://u:p@h/db").is_ok());
        assert!(validate_connection_string(SourceType::RelationalB, "mysql://h/db").is_err());
        assert!(validate_connection_string(SourceType::FlatFile, "file:///x/parcels.csv").is_ok());
        assert!(validate_connection_string(SourceType::FlatFile, "/x/parcels.csv").is_err());
        assert!(validate_connection_string(SourceType::FlatFile, "file:///x/parcels.pdf").is_err());
        assert!(validate_connection_string(SourceType::EmbeddedFile, "  ").is_err());
    }

    #[test]
    fn test_relational_a_accepts_ado_aliases() {
        for conn in [
            "Data Source=db;Initial Catalog=cama;User Id=u;Password=p",
            "Host=db;Port=3307;Initial Catalog=cama",
            "Server=db,1444;Database=cama",
        ] {
            assert!(
                validate_connection_string(SourceType::RelationalA, conn).is_ok(),
                "{conn}"
            );
        }
        let config = DataSourceConfig {
            source_id: "cama".into(),
            source_type: SourceType::RelationalA,
            connection_string: "Data Source=db;Initial Catalog=cama;User Id=u;Password=p".into(),
            refresh_interval_minutes: 60,
            enabled: true,
            status: crate::models::SourceStatus::Connected,
            last_sync: None,
            metadata: Default::default(),
        };
        assert!(connector_for(&config).is_ok());
    }

    #[test]
    fn test_from_rows_truncates_and_counts() {
        let cols = vec!["a".to_string()];
        let rows = (0..5).map(|i| vec![Value::from(i)]).collect();
        let result = RawResult::from_rows(cols, rows, 3);
        assert_eq!(result.records.len(), 3);
        assert!(result.truncated);
        assert_eq!(result.total_records, Some(5));
    }
}
