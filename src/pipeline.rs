//! ETL pipeline: Extract -> Transform -> Validate -> Load.
//!
//! A run never returns an error. Each phase reports success and a count; the
//! first failing phase stops the run and later phases are reported as skipped.
//! Cancellation is checked between phases and between Load batches.
//!
//! Progress is published to a [`JobProgress`] after every phase and every Load
//! batch, so a run stopped from outside still reports what it wrote.

use crate::conflict;
use crate::connectors::Record;
use crate::error::{HubError, Result};
use crate::mapping::{apply_mapping, MappingStore};
use crate::models::{
    FieldErrorSummary, JobParameters, JobStatus, JobType, Phase, PhaseReport, SyncConflict, SyncJob,
};
use crate::query::QueryExecutor;
use crate::registry::SourceRegistry;
use crate::sanitizer::Sanitizer;
use crate::store::HubStore;
use crate::target_schema::{parse_timestamp, schema_for, TargetSchema};
use crate::tiers::{TierRecord, TierStore};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_BATCH_SIZE: usize = 500;
const MAX_ERROR_EXAMPLES: usize = 5;
const PHASES: [Phase; 4] = [Phase::Extract, Phase::Transform, Phase::Validate, Phase::Load];

/// Final report of one run plus the conflicts it recorded.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: SyncJob,
    pub conflicts: Vec<SyncConflict>,
}

/// Job state shared between a running pipeline and whoever supervises it.
#[derive(Clone)]
pub struct JobProgress {
    state: Arc<Mutex<JobOutcome>>,
}

impl JobProgress {
    pub fn new(job: SyncJob) -> Self {
        Self {
            state: Arc::new(Mutex::new(JobOutcome {
                job,
                conflicts: Vec::new(),
            })),
        }
    }

    pub fn snapshot(&self) -> JobOutcome {
        self.lock().clone()
    }

    /// Close out a run that was stopped from outside, e.g. by a timeout. The
    /// first unreported phase fails with `message` and the rest are skipped.
    pub fn abandon(&self, message: impl Into<String>) -> JobOutcome {
        let phase = {
            let state = self.lock();
            PHASES
                .get(state.job.phases.len())
                .copied()
                .unwrap_or(Phase::Load)
        };
        self.close(None, Some(PhaseFailure::new(phase, message)))
    }

    fn publish(&self, job: &SyncJob) {
        self.lock().job = job.clone();
    }

    fn add_conflicts(&self, conflicts: Vec<SyncConflict>) {
        self.lock().conflicts.extend(conflicts);
    }

    fn close(&self, job: Option<SyncJob>, failure: Option<PhaseFailure>) -> JobOutcome {
        let mut state = self.lock();
        if let Some(job) = job {
            state.job = job;
        }
        let conflicts = state.conflicts.len();
        finish(&mut state.job, conflicts, failure);
        state.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobOutcome> {
        self.state.lock().expect("job progress lock poisoned")
    }
}

/// Record the failure, if any, and settle the final status.
fn finish(job: &mut SyncJob, conflicts: usize, failure: Option<PhaseFailure>) {
    if let Some(failure) = failure {
        warn!(
            "Job {} failed in {:?}: {}",
            job.job_id, failure.phase, failure.message
        );
        if !job.phases.iter().any(|p| p.phase == failure.phase) {
            job.phases.push(PhaseReport {
                phase: failure.phase,
                success: false,
                count: 0,
                message: Some(failure.message.clone()),
            });
        }
        let failed_at = PHASES.iter().position(|p| *p == failure.phase).unwrap_or(0);
        for phase in &PHASES[failed_at + 1..] {
            job.phases.push(PhaseReport {
                phase: *phase,
                success: false,
                count: 0,
                message: Some("skipped".into()),
            });
        }
        job.error = Some(failure.message);
    }

    job.counts.conflicts = conflicts;
    job.status = if job.error.is_some() {
        JobStatus::Failed
    } else if job.counts.invalid_records > 0 {
        JobStatus::Partial
    } else {
        JobStatus::Succeeded
    };
    job.finished_at = Some(Utc::now());
}

/// Check that the parameters carry what the job type needs.
pub fn validate_parameters(job_type: JobType, params: &JobParameters) -> Result<()> {
    let missing = |name: &str| {
        HubError::InvalidSchedule(format!("{} requires parameter {}", job_type.as_str(), name))
    };
    let needs_source = matches!(job_type, JobType::FullSync | JobType::IncrementalSync)
        || (job_type == JobType::BulkExport && params.source_id.is_some());
    if needs_source {
        if params.source_id.is_none() {
            return Err(missing("sourceId"));
        }
        if params.statement.as_deref().map(str::trim).unwrap_or("").is_empty() {
            return Err(missing("statement"));
        }
        if params.mapping_name.is_none() {
            return Err(missing("mappingName"));
        }
    }
    if job_type == JobType::BulkExport && params.destination_path.is_none() {
        return Err(missing("destinationPath"));
    }
    if params.batch_size == Some(0) {
        return Err(HubError::InvalidSchedule("batchSize must be at least 1".into()));
    }
    Ok(())
}

enum Origin {
    Source { source_id: String, statement: String },
    Tier(TierStore),
}

enum Destination {
    Tier(TierStore),
    Csv(PathBuf),
}

struct Plan {
    origin: Origin,
    destination: Destination,
    sanitize: bool,
    schema: &'static TargetSchema,
}

struct PhaseFailure {
    phase: Phase,
    message: String,
}

impl PhaseFailure {
    fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
        }
    }
}

struct ValidRecord {
    key: String,
    record: Record,
    modified_at: Option<DateTime<Utc>>,
}

pub struct EtlPipeline {
    executor: Arc<QueryExecutor>,
    registry: Arc<SourceRegistry>,
    mappings: Arc<MappingStore>,
    production: TierStore,
    training: TierStore,
    sanitizer: Arc<Sanitizer>,
    store: HubStore,
}

impl EtlPipeline {
    pub fn new(
        executor: Arc<QueryExecutor>,
        registry: Arc<SourceRegistry>,
        mappings: Arc<MappingStore>,
        production: TierStore,
        training: TierStore,
        sanitizer: Arc<Sanitizer>,
        store: HubStore,
    ) -> Self {
        Self {
            executor,
            registry,
            mappings,
            production,
            training,
            sanitizer,
            store,
        }
    }

    /// Run the job held by `progress` to completion. `watermark` bounds
    /// incremental extracts.
    pub async fn run(
        &self,
        progress: &JobProgress,
        params: &JobParameters,
        watermark: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> JobOutcome {
        let mut job = progress.snapshot().job;
        info!(
            "Starting {} job {} for {}",
            job.job_type.as_str(),
            job.job_id,
            params.data_type.as_str()
        );

        let failure = self
            .run_phases(&mut job, params, watermark, cancel, progress)
            .await
            .err();
        let outcome = progress.close(Some(job), failure);
        let job = &outcome.job;

        info!(
            "Job {} finished {:?}: extracted={} valid={} invalid={} loaded={} conflicts={}",
            job.job_id,
            job.status,
            job.counts.extracted,
            job.counts.valid_records,
            job.counts.invalid_records,
            job.counts.loaded,
            job.counts.conflicts
        );
        outcome
    }

    async fn run_phases(
        &self,
        job: &mut SyncJob,
        params: &JobParameters,
        watermark: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
        progress: &JobProgress,
    ) -> std::result::Result<(), PhaseFailure> {
        let incremental = job.job_type == JobType::IncrementalSync;
        let since = if incremental { watermark } else { None };

        // Extract
        check_cancelled(cancel, Phase::Extract)?;
        let plan = self
            .plan(job.job_type, params)
            .map_err(|e| PhaseFailure::new(Phase::Extract, e.to_string()))?;
        let (raw, note) = self
            .extract(&plan, params, since)
            .await
            .map_err(|e| PhaseFailure::new(Phase::Extract, e.to_string()))?;
        job.counts.extracted = raw.len();
        job.phases.push(PhaseReport {
            phase: Phase::Extract,
            success: true,
            count: raw.len(),
            message: note,
        });
        progress.publish(job);

        // Transform
        check_cancelled(cancel, Phase::Transform)?;
        let transformed = self
            .transform(&plan, params, &job.job_id, raw, since)
            .await
            .map_err(|e| PhaseFailure::new(Phase::Transform, e.to_string()))?;
        job.counts.transformed = transformed.len();
        job.phases.push(PhaseReport {
            phase: Phase::Transform,
            success: true,
            count: transformed.len(),
            message: plan.sanitize.then(|| format!("sanitized with rules {}", self.sanitizer.version())),
        });
        progress.publish(job);

        // Validate
        check_cancelled(cancel, Phase::Validate)?;
        let (valid, invalid, field_errors) = validate(plan.schema, transformed);
        job.counts.valid_records = valid.len();
        job.counts.invalid_records = invalid;
        job.field_errors = field_errors;
        if valid.is_empty() && invalid > 0 {
            return Err(PhaseFailure::new(
                Phase::Validate,
                format!("all {} record(s) failed validation", invalid),
            ));
        }
        job.phases.push(PhaseReport {
            phase: Phase::Validate,
            success: true,
            count: valid.len(),
            message: (invalid > 0).then(|| format!("{} invalid record(s)", invalid)),
        });
        progress.publish(job);

        // Load
        check_cancelled(cancel, Phase::Load)?;
        let batch_size = params.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1);
        match &plan.destination {
            Destination::Tier(tier) => {
                self.load_tier(tier, plan.schema, params, job, valid, batch_size, cancel, progress)
                    .await?;
            }
            Destination::Csv(path) => {
                let (written, result) =
                    write_csv(path.clone(), plan.schema, valid, batch_size, cancel.clone()).await;
                job.counts.loaded = written;
                result.map_err(|e| PhaseFailure::new(Phase::Load, e.to_string()))?;
            }
        }
        let skipped = job.counts.skipped;
        job.phases.push(PhaseReport {
            phase: Phase::Load,
            success: true,
            count: job.counts.loaded,
            message: (skipped > 0).then(|| format!("{} record(s) kept by target", skipped)),
        });
        Ok(())
    }

    fn plan(&self, job_type: JobType, params: &JobParameters) -> Result<Plan> {
        validate_parameters(job_type, params)?;
        let schema = schema_for(params.data_type);
        let source_origin = || Origin::Source {
            source_id: params.source_id.clone().unwrap_or_default(),
            statement: params.statement.clone().unwrap_or_default(),
        };

        let plan = match job_type {
            JobType::FullSync | JobType::IncrementalSync => Plan {
                origin: source_origin(),
                destination: Destination::Tier(self.production.clone()),
                sanitize: false,
                schema,
            },
            JobType::DownSync => Plan {
                origin: Origin::Tier(self.production.clone()),
                destination: Destination::Tier(self.training.clone()),
                sanitize: true,
                schema,
            },
            JobType::UpSync => Plan {
                origin: Origin::Tier(self.training.clone()),
                destination: Destination::Tier(self.production.clone()),
                sanitize: false,
                schema,
            },
            JobType::BulkExport => Plan {
                origin: if params.source_id.is_some() {
                    source_origin()
                } else {
                    Origin::Tier(self.production.clone())
                },
                destination: Destination::Csv(PathBuf::from(
                    params.destination_path.clone().unwrap_or_default(),
                )),
                sanitize: params.sanitize.unwrap_or(true),
                schema,
            },
        };
        Ok(plan)
    }

    async fn extract(
        &self,
        plan: &Plan,
        params: &JobParameters,
        since: Option<DateTime<Utc>>,
    ) -> Result<(Vec<Record>, Option<String>)> {
        match &plan.origin {
            Origin::Source { source_id, statement } => {
                let result = self.executor.extract(source_id, statement).await?;
                if let Err(e) = self.registry.mark_synced(source_id, Utc::now()).await {
                    warn!("Failed to record sync time for {}: {}", source_id, e);
                }
                let note = result.truncated.then(|| {
                    format!(
                        "stopped at the sync row cap of {} rows",
                        self.executor.settings().sync_row_cap
                    )
                });
                Ok((result.records, note))
            }
            Origin::Tier(tier) => {
                let records = tier.read_all(params.data_type, since).await?;
                debug!("Read {} record(s) from {} tier", records.len(), tier.tier().as_str());
                Ok((records, None))
            }
        }
    }

    async fn transform(
        &self,
        plan: &Plan,
        params: &JobParameters,
        job_id: &str,
        raw: Vec<Record>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Record>> {
        let mapping = match (&plan.origin, params.mapping_name.as_deref()) {
            (Origin::Source { .. }, Some(name)) => Some(self.mappings.get(params.data_type, name)?),
            _ => None,
        };
        if plan.sanitize {
            self.sanitizer.check_coverage(plan.schema)?;
        }

        let mut out = Vec::with_capacity(raw.len());
        let mut audit = Vec::new();
        for record in &raw {
            let shaped = match &mapping {
                Some(m) => apply_mapping(m, record),
                None => project(plan.schema, record),
            };
            // Tier reads already honour `since`; source rows are filtered here.
            if let (Some(since), Origin::Source { .. }) = (since, &plan.origin) {
                if let Some(ts) = shaped.get(plan.schema.timestamp_field).and_then(parse_timestamp) {
                    if ts <= since {
                        continue;
                    }
                }
            }
            if plan.sanitize {
                let (clean, entries) = self.sanitizer.sanitize(&shaped, plan.schema, job_id)?;
                audit.extend(entries);
                out.push(clean);
            } else {
                out.push(shaped);
            }
        }

        if !audit.is_empty() {
            debug!("Recording {} sanitization action(s) for {}", audit.len(), job_id);
            self.store.append_audit(audit).await?;
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    async fn load_tier(
        &self,
        tier: &TierStore,
        schema: &TargetSchema,
        params: &JobParameters,
        job: &mut SyncJob,
        valid: Vec<ValidRecord>,
        batch_size: usize,
        cancel: &CancellationToken,
        progress: &JobProgress,
    ) -> std::result::Result<(), PhaseFailure> {
        let load_err = |e: HubError| PhaseFailure::new(Phase::Load, e.to_string());
        // Keys written earlier in this run also go through the resolver.
        let mut seen: HashMap<String, Option<DateTime<Utc>>> = HashMap::new();

        for batch in valid.chunks(batch_size) {
            check_cancelled(cancel, Phase::Load)?;
            let unseen: Vec<String> = batch
                .iter()
                .filter(|r| !seen.contains_key(&r.key))
                .map(|r| r.key.clone())
                .collect();
            let existing = tier
                .existing_timestamps(schema.data_type, unseen)
                .await
                .map_err(load_err)?;
            seen.extend(existing);

            let mut writes: Vec<TierRecord> = Vec::with_capacity(batch.len());
            let mut conflicts = Vec::new();
            let (mut loaded, mut skipped) = (0, 0);
            for r in batch {
                let accept = match seen.get(&r.key) {
                    Some(target_ts) => {
                        let c = conflict::resolve(
                            &job.job_id,
                            &r.key,
                            r.modified_at,
                            *target_ts,
                            params.conflict_policy,
                        );
                        let overwrite = c.resolution.overwrites();
                        conflicts.push(c);
                        overwrite
                    }
                    None => true,
                };
                if accept {
                    seen.insert(r.key.clone(), r.modified_at);
                    writes.retain(|w| w.key != r.key);
                    writes.push(TierRecord {
                        key: r.key.clone(),
                        record: r.record.clone(),
                        modified_at: r.modified_at,
                    });
                    loaded += 1;
                } else {
                    skipped += 1;
                }
            }
            tier.upsert(schema.data_type, writes).await.map_err(load_err)?;

            job.counts.loaded += loaded;
            job.counts.skipped += skipped;
            job.counts.conflicts += conflicts.len();
            progress.add_conflicts(conflicts);
            progress.publish(job);
        }

        debug!(
            "Loaded {} record(s) into {} tier ({} kept by target)",
            job.counts.loaded,
            tier.tier().as_str(),
            job.counts.skipped
        );
        Ok(())
    }
}

fn check_cancelled(cancel: &CancellationToken, phase: Phase) -> std::result::Result<(), PhaseFailure> {
    if cancel.is_cancelled() {
        Err(PhaseFailure::new(phase, "cancelled"))
    } else {
        Ok(())
    }
}

/// Keep only schema fields, for records that are already target-shaped.
fn project(schema: &TargetSchema, record: &Record) -> Record {
    schema
        .fields
        .iter()
        .filter_map(|f| record.get(f.name).map(|v| (f.name.to_string(), v.clone())))
        .collect()
}

fn key_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Partition records into valid and invalid, collecting per-field errors.
fn validate(
    schema: &TargetSchema,
    records: Vec<Record>,
) -> (Vec<ValidRecord>, usize, BTreeMap<String, FieldErrorSummary>) {
    let mut valid = Vec::with_capacity(records.len());
    let mut invalid = 0;
    let mut field_errors: BTreeMap<String, FieldErrorSummary> = BTreeMap::new();

    for (index, record) in records.into_iter().enumerate() {
        let key = key_string(record.get(schema.key_field));
        let label = match &key {
            Some(k) => format!("record {} ({})", index + 1, k),
            None => format!("record {}", index + 1),
        };

        let mut ok = true;
        for field in schema.fields {
            let problem = match record.get(field.name) {
                None | Some(Value::Null) if field.required => Some("missing required value".to_string()),
                None | Some(Value::Null) => None,
                Some(value) => field.field_type.check(value).err().map(|msg| {
                    // Never echo sensitive values into the report.
                    if field.sensitivity.is_some() {
                        format!("expected {:?}", field.field_type)
                    } else {
                        msg
                    }
                }),
            };
            if let Some(problem) = problem {
                ok = false;
                let summary = field_errors.entry(field.name.to_string()).or_default();
                summary.count += 1;
                if summary.examples.len() < MAX_ERROR_EXAMPLES {
                    summary.examples.push(format!("{}: {}", label, problem));
                }
            }
        }

        match (ok, key) {
            (true, Some(key)) => {
                let modified_at = record.get(schema.timestamp_field).and_then(parse_timestamp);
                valid.push(ValidRecord {
                    key,
                    record,
                    modified_at,
                });
            }
            _ => invalid += 1,
        }
    }
    (valid, invalid, field_errors)
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Write records as CSV with schema-ordered columns. Returns how many rows
/// were written, even when the export stops early.
async fn write_csv(
    path: PathBuf,
    schema: &'static TargetSchema,
    records: Vec<ValidRecord>,
    batch_size: usize,
    cancel: CancellationToken,
) -> (usize, Result<()>) {
    let task = tokio::task::spawn_blocking(move || {
        let mut written = 0;
        let result = write_csv_rows(&path, schema, &records, batch_size, &cancel, &mut written);
        if result.is_ok() {
            info!("Exported {} record(s) to {:?}", written, path);
        }
        (written, result)
    });
    match task.await {
        Ok(outcome) => outcome,
        Err(e) => (0, Err(HubError::Storage(format!("export task failed: {}", e)))),
    }
}

fn write_csv_rows(
    path: &std::path::Path,
    schema: &TargetSchema,
    records: &[ValidRecord],
    batch_size: usize,
    cancel: &CancellationToken,
    written: &mut usize,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let columns: Vec<&str> = schema
        .fields
        .iter()
        .map(|f| f.name)
        .filter(|name| records.iter().any(|r| r.record.contains_key(*name)))
        .collect();

    let csv_err = |e: csv::Error| HubError::Storage(format!("CSV export: {}", e));
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    writer.write_record(&columns).map_err(csv_err)?;

    for batch in records.chunks(batch_size) {
        if cancel.is_cancelled() {
            writer.flush()?;
            return Err(HubError::Query("cancelled".into()));
        }
        for r in batch {
            let row: Vec<String> = columns.iter().map(|c| csv_cell(r.record.get(*c))).collect();
            writer.write_record(&row).map_err(csv_err)?;
            *written += 1;
        }
    }
    writer.flush()?;
    Ok(())
}
