//! Error taxonomy shared by every hub component.

use std::time::Duration;

/// Errors surfaced by the hub services.
///
/// Validation problems and sync conflicts are not errors: they are collected
/// into the job report instead of being returned through this type.
#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("data source already exists: {0}")]
    DuplicateSource(String),

    #[error("data source not found: {0}")]
    SourceNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unreachable host or authentication failure. Retried with backoff.
    #[error("connection error ({source_id}): {message}")]
    Connection { source_id: String, message: String },

    /// The pool for this source had no free slot within the checkout timeout.
    #[error("no connection available for {0}")]
    ConnectionUnavailable(String),

    #[error("query rejected: {0}")]
    QueryRejected(String),

    #[error("query timed out after {0:?}")]
    QueryTimeout(Duration),

    #[error("query failed: {0}")]
    Query(String),

    #[error("mapping not found: {0}")]
    MappingNotFound(String),

    #[error("mapping already exists: {0}")]
    DuplicateMapping(String),

    #[error("invalid mapping: {0}")]
    InvalidMapping(String),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("schedule {0} already has a running job")]
    JobAlreadyRunning(String),

    /// A declared sensitive field had no matching rule. Fatal to the job.
    #[error("sanitization failure: {0}")]
    Sanitization(String),

    #[error("notification delivery failed on {channel}: {message}")]
    Notification { channel: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HubError {
    pub fn connection(source_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Connection {
            source_id: source_id.into(),
            message: message.to_string(),
        }
    }

    /// Connection- and timeout-class errors are retried locally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::QueryTimeout(_))
    }
}

impl From<rusqlite::Error> for HubError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(HubError::connection("src", "refused").is_retryable());
        assert!(HubError::QueryTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!HubError::QueryRejected("DELETE".into()).is_retryable());
        assert!(!HubError::Sanitization("ssn".into()).is_retryable());
    }
}
