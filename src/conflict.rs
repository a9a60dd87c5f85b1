//! Conflict resolution between an incoming record and the one already loaded.
//!
//! Every comparison yields a [`SyncConflict`], whatever the outcome, so the
//! decision is always auditable.

use crate::models::{new_id, ConflictPolicy, Resolution, SyncConflict};
use chrono::{DateTime, Utc};

/// Decide between source and target for one natural key.
///
/// Under [`ConflictPolicy::Timestamp`] a strictly newer side wins; equal or
/// missing timestamps are flagged for manual review and the target is kept.
pub fn decide(
    source_ts: Option<DateTime<Utc>>,
    target_ts: Option<DateTime<Utc>>,
    policy: ConflictPolicy,
) -> Resolution {
    match policy {
        ConflictPolicy::SourceWins => Resolution::SourceWins,
        ConflictPolicy::TargetWins => Resolution::TargetWins,
        ConflictPolicy::Timestamp => match (source_ts, target_ts) {
            (Some(s), Some(t)) if s > t => Resolution::SourceWins,
            (Some(s), Some(t)) if s < t => Resolution::TargetWins,
            _ => Resolution::Flagged,
        },
    }
}

pub fn resolve(
    job_id: &str,
    record_key: &str,
    source_ts: Option<DateTime<Utc>>,
    target_ts: Option<DateTime<Utc>>,
    policy: ConflictPolicy,
) -> SyncConflict {
    SyncConflict {
        conflict_id: new_id("cfl"),
        job_id: job_id.to_string(),
        record_key: record_key.to_string(),
        source_timestamp: source_ts,
        target_timestamp: target_ts,
        resolution: decide(source_ts, target_ts, policy),
        resolved_at: Utc::now(),
    }
}

impl Resolution {
    /// Whether the incoming record replaces the stored one.
    pub fn overwrites(&self) -> bool {
        matches!(self, Resolution::SourceWins)
    }
}
