//! Flat-file sources: CSV and Excel workbooks behind a `file://` path.
//!
//! There is no SQL engine over files. Any statement that passed the read-only
//! guard returns the whole file (or the configured sheet), bounded by the row
//! limit. The first row is the header.

use super::{Connector, RawResult, SourceConnection};
use crate::error::{HubError, Result};
use crate::models::SourceType;
use calamine::{open_workbook_auto, Data, Range, Reader};
use chrono::{Duration, NaiveDate};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SUPPORTED_EXTENSIONS: &[&str] = &["csv", "xlsx", "xlsm", "xlsb", "xls"];

fn extension_of(path: &str) -> String {
    path.rsplit('.').next().unwrap_or("").to_lowercase()
}

pub fn is_supported_extension(path: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&extension_of(path).as_str())
}

pub struct FlatFileConnector {
    source_id: String,
    path: PathBuf,
    sheet: Option<String>,
}

impl FlatFileConnector {
    pub fn new(source_id: String, conn_str: &str, sheet: Option<String>) -> Self {
        let s = conn_str.trim();
        let path = s.strip_prefix("file://").unwrap_or(s);
        Self {
            source_id,
            path: PathBuf::from(path),
            sheet,
        }
    }
}

#[async_trait::async_trait]
impl Connector for FlatFileConnector {
    fn source_type(&self) -> SourceType {
        SourceType::FlatFile
    }

    async fn open(&self) -> Result<Box<dyn SourceConnection>> {
        // Files have no session; opening only checks the path is reachable.
        tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| HubError::connection(&self.source_id, format!("{}: {}", self.path.display(), e)))?;
        Ok(Box::new(FlatFileConnection {
            path: self.path.clone(),
            sheet: self.sheet.clone(),
        }))
    }
}

pub struct FlatFileConnection {
    path: PathBuf,
    sheet: Option<String>,
}

#[async_trait::async_trait]
impl SourceConnection for FlatFileConnection {
    async fn probe(&mut self) -> Result<()> {
        tokio::fs::metadata(&self.path).await?;
        Ok(())
    }

    async fn query(&mut self, _statement: &str, row_limit: usize) -> Result<RawResult> {
        let path = self.path.clone();
        let sheet = self.sheet.clone();
        let (columns, rows) = tokio::task::spawn_blocking(move || read_table(&path, sheet.as_deref()))
            .await
            .map_err(|e| HubError::Query(format!("file reader task failed: {}", e)))??;

        debug!("Read {} rows from {}", rows.len(), self.path.display());
        Ok(RawResult::from_rows(columns, rows, row_limit))
    }
}

/// Read a file into header names and row-major values.
pub fn read_table(path: &Path, sheet: Option<&str>) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
    let name = path.to_string_lossy();
    match extension_of(&name).as_str() {
        "csv" => read_csv(path),
        "xlsx" | "xlsm" | "xlsb" | "xls" => read_workbook(path, sheet),
        other => Err(HubError::Query(format!(
            "unsupported file type: .{}. Supported: .csv, .xlsx, .xlsm, .xlsb, .xls",
            other
        ))),
    }
}

fn read_csv(path: &Path) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_path(path)
        .map_err(|e| HubError::Query(format!("failed to open CSV: {}", e)))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| HubError::Query(format!("failed to read CSV headers: {}", e)))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(HubError::Query("CSV file has no headers".into()));
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| HubError::Query(format!("failed to read CSV record: {}", e)))?;
        let row: Vec<Value> = record
            .iter()
            .map(|f| {
                if f.is_empty() {
                    Value::Null
                } else {
                    Value::String(f.to_string())
                }
            })
            .collect();
        if row.iter().all(Value::is_null) {
            continue;
        }
        rows.push(row);
    }

    Ok((headers, rows))
}

fn read_workbook(path: &Path, sheet: Option<&str>) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| HubError::Query(format!("failed to open workbook: {}", e)))?;

    let names: Vec<String> = match sheet {
        Some(s) => vec![s.to_string()],
        None => workbook.sheet_names().to_vec(),
    };

    for name in &names {
        let range = match workbook.worksheet_range(name) {
            Ok(r) => r,
            Err(e) if sheet.is_some() => {
                return Err(HubError::Query(format!("sheet '{}': {}", name, e)));
            }
            Err(e) => {
                warn!("Skipping sheet '{}': {}", name, e);
                continue;
            }
        };
        if let Some(table) = range_to_table(&range) {
            return Ok(table);
        }
    }

    Err(HubError::Query("no sheet with a header row found in workbook".into()))
}

/// First row = headers. Fully empty rows are skipped.
fn range_to_table(range: &Range<Data>) -> Option<(Vec<String>, Vec<Vec<Value>>)> {
    let mut row_iter = range.rows();
    let header_row = row_iter.next()?;
    let headers: Vec<String> = header_row
        .iter()
        .map(|c| match cell_to_value(c) {
            Value::String(s) => s.trim().to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return None;
    }

    let rows = row_iter
        .map(|row| row.iter().map(cell_to_value).collect::<Vec<_>>())
        .filter(|values| !values.iter().all(Value::is_null))
        .collect();
    Some((headers, rows))
}

fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(s) if s.is_empty() => Value::Null,
        Data::String(s) => Value::String(s.clone()),
        Data::Int(i) => Value::from(*i),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                Value::from(*f as i64)
            } else {
                serde_json::Number::from_f64(*f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => excel_serial_to_value(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(e) => Value::String(format!("#ERR:{:?}", e)),
    }
}

/// Excel serials count days from 1899-12-30 (serials after 60 already absorb
/// the phantom 1900-02-29).
fn excel_serial_to_value(serial: f64) -> Value {
    let Some(epoch) = NaiveDate::from_ymd_opt(1899, 12, 30).and_then(|d| d.and_hms_opt(0, 0, 0))
    else {
        return Value::Null;
    };
    let millis = (serial * 86_400_000.0).round() as i64;
    match epoch.checked_add_signed(Duration::milliseconds(millis)) {
        Some(dt) if serial.fract() == 0.0 => Value::String(dt.date().format("%Y-%m-%d").to_string()),
        Some(dt) => Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_extension("file:///data/sales.CSV"));
        assert!(is_supported_extension("file:///data/book.xlsx"));
        assert!(!is_supported_extension("file:///data/report.pdf"));
    }

    #[test]
    fn test_csv_empty_cells_become_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(&dir, "p.csv", "parcel_id,owner_name\nP-1,\nP-2,Jane\n,\n");
        let (headers, rows) = read_csv(&path).unwrap();
        assert_eq!(headers, vec!["parcel_id", "owner_name"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], Value::Null);
        assert_eq!(rows[1][1], Value::String("Jane".into()));
    }

    #[tokio::test]
    async fn test_connector_returns_whole_file_within_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(&dir, "s.csv", "sale_id,price\nS1,100\nS2,200\nS3,300\n");
        let conn_str = format!("file://{}", path.display());
        let connector = FlatFileConnector::new("sales".into(), &conn_str, None);

        let mut conn = connector.open().await.unwrap();
        conn.probe().await.unwrap();
        let result = conn.query("SELECT * FROM anything", 2).await.unwrap();
        assert_eq!(result.records.len(), 2);
        assert!(result.truncated);
        assert_eq!(result.total_records, Some(3));
        assert_eq!(result.records[1]["price"], Value::String("200".into()));
    }

    #[tokio::test]
    async fn test_missing_file_is_connection_error() {
        let connector = FlatFileConnector::new("x".into(), "file:///no/such/file.csv", None);
        let err = connector.open().await.err().unwrap();
        assert!(matches!(err, HubError::Connection { .. }));
    }

    #[test]
    fn test_excel_serial_dates() {
        assert_eq!(excel_serial_to_value(45292.0), Value::String("2024-01-01".into()));
        assert_eq!(
            excel_serial_to_value(45292.5),
            Value::String("2024-01-01T12:00:00".into())
        );
    }
}
