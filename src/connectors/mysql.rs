//! Relational-A sources: `Driver=...;Server=host[,port];Database=...;Uid=...;Pwd=...`
//! connection strings, spoken over the MySQL wire protocol.

use super::{parse_key_values, Connector, RawResult, SourceConnection};
use crate::error::{HubError, Result};
use crate::models::SourceType;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder};
use serde_json::Value;
use tracing::debug;

const DEFAULT_PORT: u16 = 3306;

/// Parsed key/value connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValueSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl KeyValueSettings {
    pub fn parse(conn_str: &str) -> Result<Self> {
        let mut host = None;
        let mut port = DEFAULT_PORT;
        let mut database = None;
        let mut user = None;
        let mut password = None;

        for (key, value) in parse_key_values(conn_str) {
            match key.as_str() {
                "server" | "host" | "data source" => {
                    // `Server=host,port` and `Server=host:port` are both common.
                    let (h, p) = match value.split_once([',', ':']) {
                        Some((h, p)) => (h, Some(p)),
                        None => (value.as_str(), None),
                    };
                    host = Some(h.trim().to_string());
                    if let Some(p) = p {
                        port = p.trim().parse().map_err(|_| {
                            HubError::InvalidConfig(format!("invalid port in Server: {:?}", p))
                        })?;
                    }
                }
                "port" => {
                    port = value
                        .parse()
                        .map_err(|_| HubError::InvalidConfig(format!("invalid Port: {:?}", value)))?;
                }
                "database" | "initial catalog" => database = Some(value),
                "uid" | "user id" | "user" => user = Some(value),
                "pwd" | "password" => password = Some(value),
                _ => {}
            }
        }

        Ok(Self {
            host: host.ok_or_else(|| HubError::InvalidConfig("missing Server".into()))?,
            port,
            database: database.ok_or_else(|| HubError::InvalidConfig("missing Database".into()))?,
            user,
            password,
        })
    }
}

pub struct MySqlConnector {
    source_id: String,
    settings: KeyValueSettings,
}

impl MySqlConnector {
    pub fn from_key_values(source_id: String, conn_str: &str) -> Result<Self> {
        Ok(Self {
            source_id,
            settings: KeyValueSettings::parse(conn_str)?,
        })
    }
}

#[async_trait::async_trait]
impl Connector for MySqlConnector {
    fn source_type(&self) -> SourceType {
        SourceType::RelationalA
    }

    async fn open(&self) -> Result<Box<dyn SourceConnection>> {
        let s = &self.settings;
        let opts = OptsBuilder::default()
            .ip_or_hostname(s.host.clone())
            .tcp_port(s.port)
            .db_name(Some(s.database.clone()))
            .user(s.user.clone())
            .pass(s.password.clone());

        let mut conn = Conn::new(opts)
            .await
            .map_err(|e| HubError::connection(&self.source_id, e))?;
        conn.query_drop("SET SESSION TRANSACTION READ ONLY")
            .await
            .map_err(|e| HubError::connection(&self.source_id, e))?;

        debug!("Opened relational-a connection for {}", self.source_id);
        Ok(Box::new(MySqlConnection { conn }))
    }
}

pub struct MySqlConnection {
    conn: Conn,
}

#[async_trait::async_trait]
impl SourceConnection for MySqlConnection {
    async fn probe(&mut self) -> Result<()> {
        self.conn
            .ping()
            .await
            .map_err(|e| HubError::Query(e.to_string()))
    }

    async fn query(&mut self, statement: &str, row_limit: usize) -> Result<RawResult> {
        let mut result = self
            .conn
            .query_iter(statement)
            .await
            .map_err(|e| HubError::Query(e.to_string()))?;

        let columns: Vec<String> = result
            .columns_ref()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();

        // Stop reading once one row past the limit shows truncation.
        let mut values: Vec<Vec<Value>> = Vec::new();
        while values.len() <= row_limit {
            let Some(row) = result
                .next()
                .await
                .map_err(|e| HubError::Query(e.to_string()))?
            else {
                break;
            };
            values.push(
                (0..columns.len())
                    .map(|i| row.as_ref(i).map(value_to_json).unwrap_or(Value::Null))
                    .collect(),
            );
        }
        let truncated = values.len() > row_limit;
        if truncated {
            // Remaining rows are read off the wire and discarded.
            result
                .drop_result()
                .await
                .map_err(|e| HubError::Query(e.to_string()))?;
        }

        let mut raw = RawResult::from_rows(columns, values, row_limit);
        if truncated {
            raw.total_records = None;
        }
        Ok(raw)
    }
}

fn value_to_json(value: &mysql_async::Value) -> Value {
    use mysql_async::Value as V;
    match value {
        V::NULL => Value::Null,
        V::Bytes(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        V::Int(i) => Value::from(*i),
        V::UInt(u) => Value::from(*u),
        V::Float(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        V::Double(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        V::Date(y, mo, d, h, mi, s, _) => {
            if *h == 0 && *mi == 0 && *s == 0 {
                Value::String(format!("{:04}-{:02}-{:02}", y, mo, d))
            } else {
                Value::String(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    y, mo, d, h, mi, s
                ))
            }
        }
        V::Time(neg, days, h, mi, s, _) => {
            let sign = if *neg { "-" } else { "" };
            let hours = u32::from(*h) + days * 24;
            Value::String(format!("{}{:02}:{:02}:{:02}", sign, hours, mi, s))
        }
    }
}
