//! In-memory connector used by unit tests across the crate.

use super::{Connector, RawResult, Record, SourceConnection};
use crate::error::{HubError, Result};
use crate::models::SourceType;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct MockConnector {
    pub opens: AtomicUsize,
    /// Probe and query calls made on any connection this connector opened.
    pub calls: Arc<AtomicUsize>,
    /// Number of leading `open` calls that fail with a connection error.
    pub fail_opens: AtomicUsize,
    pub fail_probe: bool,
    pub columns: Vec<String>,
    pub records: Vec<Record>,
    pub delay: Duration,
}

impl MockConnector {
    pub fn with_records(columns: &[&str], records: Vec<Record>) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            records,
            ..Default::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    fn source_type(&self) -> SourceType {
        SourceType::EmbeddedFile
    }

    async fn open(&self) -> Result<Box<dyn SourceConnection>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(HubError::connection("mock", "connection refused"));
        }
        Ok(Box::new(MockConnection {
            calls: self.calls.clone(),
            fail_probe: self.fail_probe,
            columns: self.columns.clone(),
            records: self.records.clone(),
            delay: self.delay,
        }))
    }
}

struct MockConnection {
    calls: Arc<AtomicUsize>,
    fail_probe: bool,
    columns: Vec<String>,
    records: Vec<Record>,
    delay: Duration,
}

#[async_trait::async_trait]
impl SourceConnection for MockConnection {
    async fn probe(&mut self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_probe {
            return Err(HubError::Query("login failed for user 'svc'".into()));
        }
        Ok(())
    }

    async fn query(&mut self, _statement: &str, row_limit: usize) -> Result<RawResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let total = self.records.len();
        Ok(RawResult {
            columns: self.columns.clone(),
            records: self.records.iter().take(row_limit).cloned().collect(),
            truncated: total > row_limit,
            total_records: Some(total),
        })
    }
}
