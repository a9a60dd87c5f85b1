//! Sync scheduler and job runner.
//!
//! One coordinating loop evaluates due schedules every tick and hands each due
//! job to its own task. A schedule never has more than one running job: a
//! trigger that finds its schedule already claimed is deferred to the next tick.

use crate::config::SchedulerSettings;
use crate::error::{HubError, Result};
use crate::models::{
    new_id, JobParameters, JobStatus, JobType, NotificationEvent, ScheduleRequest, ScheduleType,
    SyncJob, SyncSchedule,
};
use crate::notify::NotificationRouter;
use crate::pipeline::{validate_parameters, EtlPipeline, JobOutcome, JobProgress};
use crate::registry::SourceRegistry;
use crate::store::HubStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Parse a five-field cron expression into the seconds-first form `cron` expects.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(HubError::InvalidSchedule(format!(
            "cron expression must have 5 fields, got {}: '{}'",
            fields.len(),
            expression
        )));
    }
    let normalized = format!("0 {}", fields.join(" "));
    cron::Schedule::from_str(&normalized)
        .map_err(|e| HubError::InvalidSchedule(format!("invalid cron expression '{}': {}", expression, e)))
}

struct ScheduleEntry {
    schedule: SyncSchedule,
    cron: Option<cron::Schedule>,
}

impl ScheduleEntry {
    fn new(schedule: SyncSchedule) -> Result<Self> {
        let cron = match (schedule.schedule_type, schedule.cron_expression.as_deref()) {
            (ScheduleType::Cron, Some(expr)) => Some(parse_cron(expr)?),
            _ => None,
        };
        Ok(Self { schedule, cron })
    }

    /// When the schedule next fires, anchored at its last run or creation.
    fn next_due(&self) -> Option<DateTime<Utc>> {
        let anchor = self.schedule.last_run.unwrap_or(self.schedule.created_at);
        match self.schedule.schedule_type {
            ScheduleType::Interval => self
                .schedule
                .interval_hours
                .map(|h| anchor + ChronoDuration::hours(i64::from(h))),
            ScheduleType::Cron => self.cron.as_ref().and_then(|c| c.after(&anchor).next()),
        }
    }

    fn refresh_next_run(&mut self) {
        self.schedule.next_run_at = self.next_due();
    }
}

/// Whether an enabled schedule should fire at `now`.
pub fn is_due(schedule: &SyncSchedule, now: DateTime<Utc>) -> bool {
    if !schedule.enabled {
        return false;
    }
    match ScheduleEntry::new(schedule.clone()) {
        Ok(entry) => entry.next_due().map(|due| due <= now).unwrap_or(false),
        Err(_) => false,
    }
}

fn validate_request(req: &ScheduleRequest) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(HubError::InvalidSchedule("name must not be empty".into()));
    }
    match req.schedule_type {
        ScheduleType::Interval => {
            if req.cron_expression.is_some() {
                return Err(HubError::InvalidSchedule(
                    "interval schedules must not set cron_expression".into(),
                ));
            }
            match req.interval_hours {
                Some(h) if h > 0 => {}
                _ => {
                    return Err(HubError::InvalidSchedule(
                        "interval schedules need interval_hours > 0".into(),
                    ))
                }
            }
        }
        ScheduleType::Cron => {
            if req.interval_hours.is_some() {
                return Err(HubError::InvalidSchedule(
                    "cron schedules must not set interval_hours".into(),
                ));
            }
            let expr = req
                .cron_expression
                .as_deref()
                .ok_or_else(|| HubError::InvalidSchedule("cron schedules need cron_expression".into()))?;
            parse_cron(expr)?;
        }
    }
    validate_parameters(req.job_type, &req.parameters)
}

#[derive(Default)]
struct ActiveJobs {
    /// schedule id -> running job id
    by_schedule: HashMap<String, String>,
    /// job id -> cancellation token
    tokens: HashMap<String, CancellationToken>,
}

pub struct SyncScheduler {
    store: HubStore,
    pipeline: Arc<EtlPipeline>,
    notifier: Arc<NotificationRouter>,
    registry: Arc<SourceRegistry>,
    settings: SchedulerSettings,
    schedules: RwLock<HashMap<String, ScheduleEntry>>,
    active: Mutex<ActiveJobs>,
}

impl SyncScheduler {
    pub fn new(
        store: HubStore,
        pipeline: Arc<EtlPipeline>,
        notifier: Arc<NotificationRouter>,
        registry: Arc<SourceRegistry>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            pipeline,
            notifier,
            registry,
            settings,
            schedules: RwLock::new(HashMap::new()),
            active: Mutex::new(ActiveJobs::default()),
        }
    }

    /// Fail jobs left running by a previous process, then load persisted schedules.
    pub async fn load(
        store: HubStore,
        pipeline: Arc<EtlPipeline>,
        notifier: Arc<NotificationRouter>,
        registry: Arc<SourceRegistry>,
        settings: SchedulerSettings,
    ) -> Result<Self> {
        let interrupted = store.reconcile_interrupted_jobs().await?;
        if !interrupted.is_empty() {
            warn!("Marked {} interrupted job(s) as failed", interrupted.len());
        }

        let persisted = store.list_schedules().await?;
        let scheduler = Self::new(store, pipeline, notifier, registry, settings);
        {
            let mut schedules = scheduler.schedules.write().await;
            for schedule in persisted {
                let id = schedule.schedule_id.clone();
                match ScheduleEntry::new(schedule) {
                    Ok(mut entry) => {
                        entry.refresh_next_run();
                        schedules.insert(id, entry);
                    }
                    Err(e) => warn!("Skipping persisted schedule {}: {}", id, e),
                }
            }
            info!("Loaded {} schedule(s)", schedules.len());
        }
        Ok(scheduler)
    }

    // ========================================================================
    // Schedule CRUD
    // ========================================================================

    pub async fn create(&self, req: ScheduleRequest) -> Result<SyncSchedule> {
        validate_request(&req)?;
        let schedule = SyncSchedule {
            schedule_id: new_id("sch"),
            name: req.name.trim().to_string(),
            job_type: req.job_type,
            schedule_type: req.schedule_type,
            interval_hours: req.interval_hours,
            cron_expression: req.cron_expression.map(|c| c.trim().to_string()),
            parameters: req.parameters,
            enabled: req.enabled,
            created_at: Utc::now(),
            last_run: None,
            last_success: None,
            last_job_id: None,
            next_run_at: None,
        };
        let mut entry = ScheduleEntry::new(schedule)?;
        entry.refresh_next_run();
        self.store.put_schedule(&entry.schedule).await?;

        let schedule = entry.schedule.clone();
        self.schedules
            .write()
            .await
            .insert(schedule.schedule_id.clone(), entry);
        info!("Created schedule {} ({})", schedule.schedule_id, schedule.name);
        Ok(schedule)
    }

    /// Replace a schedule's definition, keeping its run history.
    pub async fn update(&self, schedule_id: &str, req: ScheduleRequest) -> Result<SyncSchedule> {
        validate_request(&req)?;
        let mut schedules = self.schedules.write().await;
        let existing = schedules
            .get(schedule_id)
            .ok_or_else(|| HubError::ScheduleNotFound(schedule_id.to_string()))?;

        let schedule = SyncSchedule {
            schedule_id: schedule_id.to_string(),
            name: req.name.trim().to_string(),
            job_type: req.job_type,
            schedule_type: req.schedule_type,
            interval_hours: req.interval_hours,
            cron_expression: req.cron_expression.map(|c| c.trim().to_string()),
            parameters: req.parameters,
            enabled: req.enabled,
            created_at: existing.schedule.created_at,
            last_run: existing.schedule.last_run,
            last_success: existing.schedule.last_success,
            last_job_id: existing.schedule.last_job_id.clone(),
            next_run_at: None,
        };
        let mut entry = ScheduleEntry::new(schedule)?;
        entry.refresh_next_run();
        self.store.put_schedule(&entry.schedule).await?;

        let schedule = entry.schedule.clone();
        schedules.insert(schedule_id.to_string(), entry);
        info!("Updated schedule {}", schedule_id);
        Ok(schedule)
    }

    pub async fn delete(&self, schedule_id: &str) -> Result<()> {
        let mut schedules = self.schedules.write().await;
        if schedules.remove(schedule_id).is_none() {
            return Err(HubError::ScheduleNotFound(schedule_id.to_string()));
        }
        self.store.delete_schedule(schedule_id).await?;
        info!("Deleted schedule {}", schedule_id);
        Ok(())
    }

    pub async fn get(&self, schedule_id: &str) -> Result<SyncSchedule> {
        self.schedules
            .read()
            .await
            .get(schedule_id)
            .map(|e| e.schedule.clone())
            .ok_or_else(|| HubError::ScheduleNotFound(schedule_id.to_string()))
    }

    pub async fn list(&self) -> Vec<SyncSchedule> {
        let mut list: Vec<SyncSchedule> = self
            .schedules
            .read()
            .await
            .values()
            .map(|e| e.schedule.clone())
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    // ========================================================================
    // Job dispatch
    // ========================================================================

    /// Start a run of the schedule now. Fails if one is already running.
    pub async fn trigger(self: &Arc<Self>, schedule_id: &str) -> Result<SyncJob> {
        let schedule = self.get(schedule_id).await?;
        let job = SyncJob::start(schedule.job_type, Some(schedule.schedule_id.clone()));
        let cancel = self.claim(Some(&schedule.schedule_id), &job.job_id)?;

        if let Err(e) = self.store.put_job(&job).await {
            self.release(Some(&schedule.schedule_id), &job.job_id);
            return Err(e);
        }
        info!(
            "Dispatching {} job {} for schedule {}",
            job.job_type.as_str(),
            job.job_id,
            schedule.schedule_id
        );
        self.spawn_worker(job.clone(), schedule.parameters, schedule.last_success, cancel);
        Ok(job)
    }

    /// Start an ad-hoc job that belongs to no schedule.
    pub async fn run_adhoc(self: &Arc<Self>, job_type: JobType, params: JobParameters) -> Result<SyncJob> {
        validate_parameters(job_type, &params)?;
        let job = SyncJob::start(job_type, None);
        let cancel = self.claim(None, &job.job_id)?;
        if let Err(e) = self.store.put_job(&job).await {
            self.release(None, &job.job_id);
            return Err(e);
        }
        info!("Dispatching ad-hoc {} job {}", job_type.as_str(), job.job_id);
        self.spawn_worker(job.clone(), params, None, cancel);
        Ok(job)
    }

    /// Request cooperative cancellation of a running job.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        let active = self.active.lock().expect("active job table poisoned");
        match active.tokens.get(job_id) {
            Some(token) => {
                info!("Cancelling job {}", job_id);
                token.cancel();
                Ok(())
            }
            None => Err(HubError::JobNotFound(format!("{} is not running", job_id))),
        }
    }

    pub fn is_running(&self, schedule_id: &str) -> bool {
        self.active
            .lock()
            .expect("active job table poisoned")
            .by_schedule
            .contains_key(schedule_id)
    }

    fn claim(&self, schedule_id: Option<&str>, job_id: &str) -> Result<CancellationToken> {
        let mut active = self.active.lock().expect("active job table poisoned");
        if let Some(id) = schedule_id {
            if active.by_schedule.contains_key(id) {
                return Err(HubError::JobAlreadyRunning(id.to_string()));
            }
            active.by_schedule.insert(id.to_string(), job_id.to_string());
        }
        let token = CancellationToken::new();
        active.tokens.insert(job_id.to_string(), token.clone());
        Ok(token)
    }

    fn release(&self, schedule_id: Option<&str>, job_id: &str) {
        let mut active = self.active.lock().expect("active job table poisoned");
        if let Some(id) = schedule_id {
            active.by_schedule.remove(id);
        }
        active.tokens.remove(job_id);
    }

    fn spawn_worker(
        self: &Arc<Self>,
        job: SyncJob,
        params: JobParameters,
        watermark: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.execute(job, params, watermark, cancel).await;
        });
    }

    async fn execute(
        &self,
        job: SyncJob,
        params: JobParameters,
        watermark: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) {
        let job_id = job.job_id.clone();
        let schedule_id = job.schedule_id.clone();
        let started_at = job.started_at;
        let limit = self.settings.job_timeout;

        let progress = JobProgress::new(job);
        let run = self.pipeline.run(&progress, &params, watermark, &cancel);
        let JobOutcome { job, conflicts } = match tokio::time::timeout(limit, run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Dropping the run future discards any checked-out connection.
                cancel.cancel();
                error!("Job {} timed out after {:?}", job_id, limit);
                progress.abandon(format!("job timed out after {:?}", limit))
            }
        };

        if let Some(id) = &schedule_id {
            self.record_run(id, started_at, &job).await;
        }
        if let Err(e) = self.store.put_conflicts(&conflicts).await {
            error!("Failed to persist conflicts for {}: {}", job_id, e);
        }
        if let Err(e) = self.store.put_job(&job).await {
            error!("Failed to persist job {}: {}", job_id, e);
        }
        self.release(schedule_id.as_deref(), &job_id);

        let deliveries = self.notifier.notify(&NotificationEvent::for_job(&job, &conflicts)).await;
        debug!("Job {} notified {} channel(s)", job_id, deliveries.len());
    }

    async fn record_run(&self, schedule_id: &str, started_at: DateTime<Utc>, job: &SyncJob) {
        let mut schedules = self.schedules.write().await;
        let Some(entry) = schedules.get_mut(schedule_id) else {
            debug!("Schedule {} was deleted while job {} ran", schedule_id, job.job_id);
            return;
        };
        entry.schedule.last_run = Some(started_at);
        if matches!(job.status, JobStatus::Succeeded | JobStatus::Partial) {
            entry.schedule.last_success = Some(started_at);
        }
        entry.schedule.last_job_id = Some(job.job_id.clone());
        entry.refresh_next_run();
        if let Err(e) = self.store.put_schedule(&entry.schedule).await {
            error!("Failed to persist schedule {}: {}", schedule_id, e);
        }
    }

    // ========================================================================
    // Coordinating loop
    // ========================================================================

    /// Evaluate every schedule once and dispatch the due ones.
    pub async fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<String> {
        let due: Vec<String> = self
            .schedules
            .read()
            .await
            .values()
            .filter(|e| e.schedule.enabled && e.next_due().map(|d| d <= now).unwrap_or(false))
            .map(|e| e.schedule.schedule_id.clone())
            .collect();

        let mut started = Vec::new();
        for schedule_id in due {
            match self.trigger(&schedule_id).await {
                Ok(job) => started.push(job.job_id),
                Err(HubError::JobAlreadyRunning(_)) => {
                    debug!("Schedule {} still running, deferring to next tick", schedule_id)
                }
                Err(e) => error!("Failed to dispatch schedule {}: {}", schedule_id, e),
            }
        }

        let evicted = self.registry.evict_idle_connections().await;
        if evicted > 0 {
            debug!("Evicted {} idle connection(s)", evicted);
        }
        started
    }

    /// Run the tick loop until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Scheduler started, tick every {:?}", self.settings.tick_interval);
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }

        let tokens: Vec<CancellationToken> = self
            .active
            .lock()
            .expect("active job table poisoned")
            .tokens
            .values()
            .cloned()
            .collect();
        for token in tokens {
            token.cancel();
        }
        info!("Scheduler stopped");
    }
}
