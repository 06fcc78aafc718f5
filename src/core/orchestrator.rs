//! Drives backup jobs from validation to a persisted terminal state.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::AppContext;
use crate::core::backup_engine::{
    BackupEngine, BackupOutcome, BackupRequest, BackupResult, EngineEvent,
};
use crate::core::filters::FilterRules;
use crate::core::inventory::Inventory;
use crate::core::models::{BackupJob, Device, JobStatus, JobTarget, JobType, Share};
use crate::core::notifications::{JobEvent, NotificationChannel};
use crate::core::protocol::{PluginRegistry, ProtocolPlugin};
use crate::core::registry::JobFilter;
use crate::db;
use crate::error::{Error, Result};
use crate::logging::LogThrottle;

const EVENT_CAPACITY: usize = 256;
const ENGINE_EVENT_BUFFER: usize = 64;
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
/// Time given to cancelled stragglers to unmount during shutdown.
const UNWIND_GRACE: Duration = Duration::from_secs(10);

/// A share that passed validation and is ready to run.
struct PreparedShare {
    device: Device,
    share: Share,
    filters: FilterRules,
    plugin: Arc<dyn ProtocolPlugin>,
}

struct Inner {
    ctx: AppContext,
    inventory: Arc<dyn Inventory>,
    plugins: PluginRegistry,
    engine: Arc<dyn BackupEngine>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    workers: Arc<Semaphore>,
    events: broadcast::Sender<JobEvent>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        ctx: AppContext,
        inventory: Arc<dyn Inventory>,
        plugins: PluginRegistry,
        engine: Arc<dyn BackupEngine>,
        notifier: Option<Arc<dyn NotificationChannel>>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(ctx.config.max_concurrent_backups.max(1)));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                ctx,
                inventory,
                plugins,
                engine,
                notifier,
                workers,
                events,
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.inner.ctx
    }

    pub fn inventory(&self) -> Arc<dyn Inventory> {
        self.inner.inventory.clone()
    }

    /// Live job events. Slow receivers miss events rather than block jobs.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Back up every enabled share of a device and wait for all of them.
    ///
    /// Shares that are already being backed up are skipped.
    pub async fn execute_device_backup(
        &self,
        device_id: &str,
        job_type: JobType,
    ) -> Result<Vec<BackupJob>> {
        let started = self.start_shares(device_id, job_type, |_| true).await?;

        let mut set = JoinSet::new();
        for (index, (prepared, job, cancel)) in started.into_iter().enumerate() {
            let this = self.clone();
            set.spawn(async move { (index, this.run_job(prepared, job, cancel).await) });
        }

        let mut finished = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(done) => finished.push(done),
                Err(e) => error!(device_id, error = %e, "Share backup task failed"),
            }
        }
        finished.sort_by_key(|(index, _)| *index);
        Ok(finished.into_iter().map(|(_, job)| job).collect())
    }

    /// Back up one share and return the job in its terminal state.
    pub async fn execute_share_backup(
        &self,
        device_id: &str,
        share_id: &str,
        job_type: JobType,
    ) -> Result<BackupJob> {
        self.ensure_running()?;
        let prepared = self.prepare_share(device_id, share_id).await?;
        let target = JobTarget::share(device_id, share_id);
        let (job, cancel) = self
            .inner
            .ctx
            .jobs
            .try_start(BackupJob::new(&target, job_type))
            .await?;

        Ok(self.run_job(prepared, job, cancel).await)
    }

    /// Validate and start one share in the background, returning the Running job.
    pub async fn start_share_backup(
        &self,
        device_id: &str,
        share_id: &str,
        job_type: JobType,
    ) -> Result<BackupJob> {
        self.ensure_running()?;
        let prepared = self.prepare_share(device_id, share_id).await?;
        let target = JobTarget::share(device_id, share_id);
        let (job, cancel) = self
            .inner
            .ctx
            .jobs
            .try_start(BackupJob::new(&target, job_type))
            .await?;

        self.spawn_job(prepared, job.clone(), cancel);
        Ok(job)
    }

    /// Start every enabled share of a device in the background.
    pub async fn start_device_backup(
        &self,
        device_id: &str,
        job_type: JobType,
    ) -> Result<Vec<BackupJob>> {
        self.start_device_shares(device_id, job_type, |_| true).await
    }

    /// Start the enabled shares of a device selected by `select`.
    pub(crate) async fn start_device_shares(
        &self,
        device_id: &str,
        job_type: JobType,
        select: impl Fn(&Share) -> bool,
    ) -> Result<Vec<BackupJob>> {
        let started = self.start_shares(device_id, job_type, select).await?;

        let mut jobs = Vec::with_capacity(started.len());
        for (prepared, job, cancel) in started {
            jobs.push(job.clone());
            self.spawn_job(prepared, job, cancel);
        }
        Ok(jobs)
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<BackupJob> {
        if let Some(job) = self.inner.ctx.jobs.get(job_id).await {
            return Ok(job);
        }

        match db::jobs::get(&self.inner.ctx.db, job_id.to_string()).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(Error::JobNotFound(job_id.to_string())),
            Err(e) => {
                warn!(job_id, error = %e, "Failed to read job history");
                Err(Error::JobNotFound(job_id.to_string()))
            }
        }
    }

    pub async fn list_jobs(&self) -> Vec<BackupJob> {
        self.inner.ctx.jobs.list(&JobFilter::default()).await
    }

    pub async fn list_jobs_for_device(&self, device_id: &str) -> Vec<BackupJob> {
        let filter = JobFilter {
            device_id: Some(device_id.to_string()),
            ..JobFilter::default()
        };
        self.inner.ctx.jobs.list(&filter).await
    }

    pub async fn list_jobs_by_status(&self, status: JobStatus) -> Vec<BackupJob> {
        let filter = JobFilter {
            status: Some(status),
            ..JobFilter::default()
        };
        self.inner.ctx.jobs.list(&filter).await
    }

    /// Mark a job Cancelled and signal its execution to stop.
    pub async fn cancel_job(&self, job_id: &str) -> Result<BackupJob> {
        let job = self.inner.ctx.jobs.request_cancellation(job_id).await?;
        info!(job_id, target = %job.target(), "Cancellation requested");
        self.persist(&job).await;
        Ok(job)
    }

    /// Schedule a new attempt of a Failed or PartiallyCompleted job.
    ///
    /// The attempt is registered Pending and starts once `next_retry_at` passes.
    pub async fn retry_failed_job(&self, job_id: &str) -> Result<BackupJob> {
        self.ensure_running()?;
        let failed = self.get_job_status(job_id).await?;

        if !matches!(
            failed.status,
            JobStatus::Failed | JobStatus::PartiallyCompleted
        ) {
            return Err(Error::InvalidState(format!(
                "job {} is {}, only failed or partial jobs can be retried",
                job_id, failed.status
            )));
        }
        if failed.share_id.is_none() {
            return Err(Error::InvalidState(format!(
                "job {} has no share to retry",
                job_id
            )));
        }

        let retry = &self.inner.ctx.config.retry;
        let attempt = failed.retry_attempt + 1;
        if attempt > retry.max_attempts {
            return Err(Error::InvalidState(format!(
                "job {} already used {} of {} retry attempts",
                job_id, failed.retry_attempt, retry.max_attempts
            )));
        }

        match db::jobs::find_retry(&self.inner.ctx.db, failed.id.clone()).await {
            Ok(Some(existing)) => {
                return Err(Error::InvalidState(format!(
                    "job {} was already retried as {}",
                    job_id, existing
                )));
            }
            Ok(None) => {}
            Err(e) => warn!(job_id, error = %e, "Failed to read retry history"),
        }

        let now = Utc::now();
        let base = failed.completed_at.map_or(now, |done| done.max(now));
        let delay = chrono::Duration::from_std(retry.delay_for(attempt))
            .map_err(|e| Error::InvalidState(format!("retry delay out of range: {}", e)))?;
        let next_retry_at = base + delay;

        let mut job = BackupJob::new(&failed.target(), JobType::Retry);
        job.retry_attempt = attempt;
        job.next_retry_at = Some(next_retry_at);
        job.retry_of = Some(failed.id.clone());

        let cancel = self.inner.ctx.jobs.create(job.clone()).await?;
        self.persist(&job).await;

        info!(
            job_id = %job.id,
            retry_of = %failed.id,
            attempt,
            next_retry_at = %next_retry_at,
            "Retry scheduled"
        );
        self.emit(JobEvent::RetryScheduled {
            job_id: job.id.clone(),
            retry_of: failed.id.clone(),
            attempt,
            next_retry_at,
        });

        let this = self.clone();
        let retry_id = job.id.clone();
        self.inner
            .tasks
            .spawn(async move { this.run_retry(retry_id, cancel).await });

        Ok(job)
    }

    /// Wait up to `timeout` for active jobs, then cancel what is left.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.shutdown.cancel();
        let deadline = Instant::now() + timeout;

        loop {
            let active = self.inner.ctx.jobs.active_ids().await;
            if active.is_empty() {
                info!("All jobs finished");
                break;
            }
            if Instant::now() >= deadline {
                warn!(count = active.len(), "Shutdown timeout reached, cancelling jobs");
                for job_id in active {
                    if let Err(e) = self.cancel_job(&job_id).await {
                        debug!(job_id = %job_id, error = %e, "Job already finished");
                    }
                }
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        self.inner.tasks.close();
        if tokio::time::timeout(UNWIND_GRACE, self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!("Some jobs did not unwind before exit");
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::InvalidState("orchestrator is shutting down".into()));
        }
        Ok(())
    }

    /// Resolve and validate a share. Nothing is registered here.
    async fn prepare_share(&self, device_id: &str, share_id: &str) -> Result<PreparedShare> {
        let device = self.inner.inventory.get_device(device_id).await?;
        let share = device
            .share(share_id)
            .cloned()
            .ok_or_else(|| Error::ShareNotFound(format!("{}/{}", device_id, share_id)))?;
        if !share.enabled {
            return Err(Error::ShareDisabled(format!("{}/{}", device_id, share_id)));
        }
        self.prepare(device, share)
    }

    fn prepare(&self, device: Device, share: Share) -> Result<PreparedShare> {
        let filters = FilterRules::resolve(
            share.filters.as_ref(),
            device.filters.as_ref(),
            &self.inner.ctx.config.default_filters,
        )
        .clone();
        filters.validate()?;
        let plugin = self.inner.plugins.get(device.protocol)?;

        Ok(PreparedShare {
            device,
            share,
            filters,
            plugin,
        })
    }

    /// Validate the selected shares of a device and claim each one.
    async fn start_shares(
        &self,
        device_id: &str,
        job_type: JobType,
        select: impl Fn(&Share) -> bool,
    ) -> Result<Vec<(PreparedShare, BackupJob, CancellationToken)>> {
        self.ensure_running()?;
        let device = self.inner.inventory.get_device(device_id).await?;

        let prepared = device
            .enabled_shares()
            .filter(|share| select(share))
            .map(|share| self.prepare(device.clone(), share.clone()))
            .collect::<Result<Vec<_>>>()?;
        if prepared.is_empty() {
            return Err(Error::NoEnabledShares(device_id.to_string()));
        }

        let mut started = Vec::with_capacity(prepared.len());
        let mut conflict = None;
        for share in prepared {
            let target = JobTarget::share(&share.device.id, &share.share.id);
            match self
                .inner
                .ctx
                .jobs
                .try_start(BackupJob::new(&target, job_type))
                .await
            {
                Ok((job, cancel)) => started.push((share, job, cancel)),
                Err(e @ Error::JobConflict { .. }) => {
                    warn!(device_id, share_id = %share.share.id, error = %e, "Skipping share");
                    conflict.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        match (started.is_empty(), conflict) {
            (true, Some(e)) => Err(e),
            _ => Ok(started),
        }
    }

    fn spawn_job(&self, prepared: PreparedShare, job: BackupJob, cancel: CancellationToken) {
        let this = self.clone();
        self.inner
            .tasks
            .spawn(async move { this.run_job(prepared, job, cancel).await });
    }

    async fn run_retry(&self, job_id: String, cancel: CancellationToken) {
        let Some(job) = self.inner.ctx.jobs.get(&job_id).await else {
            return;
        };

        let wait = job
            .next_retry_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        debug!(job_id = %job_id, wait_secs = wait.as_secs(), "Waiting for retry slot");

        tokio::select! {
            _ = cancel.cancelled() => {
                self.abandon(&job_id, JobStatus::Cancelled, None).await;
                return;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let prepared = match self
            .prepare_share(&job.device_id, job.share_id.as_deref().unwrap_or_default())
            .await
        {
            Ok(prepared) => prepared,
            Err(e) => {
                self.abandon(&job_id, JobStatus::Failed, Some(e.to_string())).await;
                return;
            }
        };

        match self.inner.ctx.jobs.promote(&job_id).await {
            Ok(running) => {
                self.run_job(prepared, running, cancel).await;
            }
            Err(Error::Cancelled) => self.abandon(&job_id, JobStatus::Cancelled, None).await,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Retry could not start");
                self.abandon(&job_id, JobStatus::Failed, Some(e.to_string())).await;
            }
        }
    }

    /// Finish a job that never reached execution.
    async fn abandon(&self, job_id: &str, status: JobStatus, error: Option<String>) {
        let Some(job) = self
            .inner
            .ctx
            .jobs
            .finish(job_id, status, |j| j.error_message = error)
            .await
        else {
            return;
        };
        self.persist(&job).await;
        self.emit_terminal(&job, Duration::ZERO);
    }

    async fn run_job(
        &self,
        prepared: PreparedShare,
        job: BackupJob,
        cancel: CancellationToken,
    ) -> BackupJob {
        let span = info_span!(
            "backup",
            job_id = %job.id,
            device_id = %job.device_id,
            share_id = job.share_id.as_deref().unwrap_or("-")
        );

        async {
            let started = Instant::now();
            self.persist(&job).await;
            self.record(&job.id, "info", format!("{:?} backup started", job.job_type))
                .await;

            let outcome = self.perform(&prepared, &job, &cancel).await;
            let final_job = self.complete(&job, outcome).await;

            self.emit_terminal(&final_job, started.elapsed());
            final_job
        }
        .instrument(span)
        .await
    }

    /// Wake, mount, back up, unmount.
    async fn perform(
        &self,
        prepared: &PreparedShare,
        job: &BackupJob,
        cancel: &CancellationToken,
    ) -> Result<BackupResult> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.inner.workers.clone().acquire_owned() => {
                permit.map_err(|_| Error::Cancelled)?
            }
        };

        if prepared.device.wake_on_lan {
            self.wake(prepared, job, cancel).await?;
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Dropping an unfinished mount kills its helper and leaves the
        // mount slot free.
        let plugin = &prepared.plugin;
        let mount_path = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Cancelled while mounting");
                return Err(Error::Cancelled);
            }
            mounted = plugin.mount_share(&prepared.device, &prepared.share) => mounted?,
        };
        info!(path = %mount_path.display(), "Share mounted");

        let result = self.back_up(prepared, job, &mount_path, cancel).await;

        if cancel.is_cancelled() {
            debug!("Cancelled, unmounting");
        }
        if let Err(e) = plugin.unmount_share(&mount_path).await {
            warn!(path = %mount_path.display(), error = %e, "Unmount failed");
            self.record(&job.id, "warn", format!("Unmount failed: {}", e))
                .await;
        }

        result
    }

    /// Best effort: failures are logged and the backup continues.
    async fn wake(
        &self,
        prepared: &PreparedShare,
        job: &BackupJob,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let plugin = &prepared.plugin;
        let device = &prepared.device;

        if !plugin.supports_wake() {
            debug!(protocol = %device.protocol, "Protocol cannot wake devices");
            return Ok(());
        }
        if let Err(e) = plugin.wake_device(device).await {
            warn!(error = %e, "Wake-on-LAN failed, trying anyway");
            self.record(&job.id, "warn", format!("Wake failed: {}", e))
                .await;
            return Ok(());
        }

        let wake = &self.inner.ctx.config.wake;
        let deadline = Instant::now() + Duration::from_secs(wake.wait_timeout_secs);
        let poll = Duration::from_secs(wake.poll_interval_secs.max(1));

        loop {
            if plugin.test_connection(device).await {
                debug!("Device is reachable");
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    wait_secs = wake.wait_timeout_secs,
                    "Device still unreachable after wake"
                );
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    async fn back_up(
        &self,
        prepared: &PreparedShare,
        job: &BackupJob,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<BackupResult> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let request = BackupRequest {
            job_id: job.id.clone(),
            repository: self.inner.ctx.config.repository.clone(),
            host: prepared.device.id.clone(),
            device_id: prepared.device.id.clone(),
            share_id: Some(prepared.share.id.clone()),
            source: source.to_path_buf(),
            filters: prepared.filters.clone(),
        };

        self.emit(JobEvent::Started {
            job_id: job.id.clone(),
            device_id: job.device_id.clone(),
            share_id: job.share_id.clone(),
            source: source.to_path_buf(),
        });

        let (tx, mut rx) = mpsc::channel(ENGINE_EVENT_BUFFER);
        let backup = self
            .inner
            .engine
            .create_backup(&request, tx, cancel.clone());

        let throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);
        let forward = async {
            while let Some(event) = rx.recv().await {
                self.on_engine_event(&job.id, event, &throttle).await;
            }
        };

        let (result, ()) = tokio::join!(backup, forward);
        result
    }

    async fn on_engine_event(&self, job_id: &str, event: EngineEvent, throttle: &LogThrottle) {
        let jobs = &self.inner.ctx.jobs;
        match event {
            EngineEvent::Progress {
                percent,
                current_file,
                files_done,
                bytes_done,
                total_files,
                ..
            } => {
                let file = current_file.clone();
                jobs.update(job_id, |j| {
                    j.percent_done = percent;
                    j.current_file = file;
                    j.files_processed = files_done;
                    j.bytes_processed = bytes_done;
                })
                .await;

                if throttle.should_log() {
                    info!(
                        percent = %format!("{:.1}", percent),
                        files_done,
                        total_files,
                        "Backup progress"
                    );
                }
                self.emit(JobEvent::Progress {
                    job_id: job_id.to_string(),
                    percent,
                    current_file,
                    files_done,
                    bytes_done,
                });
            }
            EngineEvent::Warning(message) | EngineEvent::Error(message) => {
                jobs.update(job_id, |j| j.warning_count += 1).await;
                warn!(message = %message, "Engine reported a problem");
                self.record(job_id, "warn", message.clone()).await;
                self.emit(JobEvent::Warning {
                    job_id: job_id.to_string(),
                    message,
                });
            }
        }
    }

    /// Classify the outcome, finish the registry entry and persist it.
    async fn complete(&self, job: &BackupJob, outcome: Result<BackupResult>) -> BackupJob {
        let (status, result, error) = match outcome {
            Ok(result) => {
                let status = match result.outcome {
                    BackupOutcome::Success => JobStatus::Completed,
                    BackupOutcome::Partial => JobStatus::PartiallyCompleted,
                    BackupOutcome::Failed => JobStatus::Failed,
                };
                let error = result.message.clone();
                (status, Some(result), error)
            }
            Err(Error::Cancelled) => (JobStatus::Cancelled, None, None),
            Err(e) => (JobStatus::Failed, None, Some(e.to_string())),
        };

        let finished = self
            .inner
            .ctx
            .jobs
            .finish(&job.id, status, |j| {
                if let Some(result) = &result {
                    j.files_new = result.files_new;
                    j.files_changed = result.files_changed;
                    j.files_unmodified = result.files_unmodified;
                    j.files_processed = result.files_processed();
                    j.bytes_added = result.bytes_added;
                    j.bytes_processed = result.bytes_processed;
                    j.snapshot_id = result.snapshot_id.clone();
                    if status == JobStatus::Completed {
                        j.percent_done = 100.0;
                    }
                }
                j.current_file = None;
                j.error_message = error.clone();
            })
            .await;

        let final_job = finished.unwrap_or_else(|| {
            let mut job = job.clone();
            job.status = status;
            job.completed_at = Some(Utc::now());
            job
        });

        match final_job.status {
            JobStatus::Completed | JobStatus::PartiallyCompleted => info!(
                status = %final_job.status,
                files = final_job.files_processed,
                snapshot_id = final_job.snapshot_id.as_deref().unwrap_or("-"),
                "Backup finished"
            ),
            JobStatus::Cancelled => info!("Backup cancelled"),
            _ => error!(
                error = final_job.error_message.as_deref().unwrap_or("unknown"),
                "Backup failed"
            ),
        }

        let summary = match &final_job.error_message {
            Some(message) => format!("{}: {}", final_job.status, message),
            None => final_job.status.to_string(),
        };
        let level = if final_job.status == JobStatus::Failed {
            "error"
        } else {
            "info"
        };
        self.record(&final_job.id, level, summary).await;
        self.persist(&final_job).await;
        final_job
    }

    fn emit_terminal(&self, job: &BackupJob, elapsed: Duration) {
        let event = match job.status {
            JobStatus::Completed | JobStatus::PartiallyCompleted => JobEvent::Completed {
                job_id: job.id.clone(),
                device_id: job.device_id.clone(),
                share_id: job.share_id.clone(),
                status: job.status,
                files_processed: job.files_processed,
                bytes_added: job.bytes_added,
                snapshot_id: job.snapshot_id.clone(),
                warning_count: job.warning_count,
                duration_secs: elapsed.as_secs(),
            },
            JobStatus::Failed => JobEvent::Failed {
                job_id: job.id.clone(),
                device_id: job.device_id.clone(),
                share_id: job.share_id.clone(),
                error: job
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            },
            JobStatus::Cancelled => JobEvent::Cancelled {
                job_id: job.id.clone(),
                device_id: job.device_id.clone(),
                share_id: job.share_id.clone(),
            },
            JobStatus::Pending | JobStatus::Running => return,
        };

        if let Some(notifier) = &self.inner.notifier {
            let notifier = notifier.clone();
            let event = event.clone();
            self.inner.tasks.spawn(async move {
                if let Err(e) = notifier.notify(event).await {
                    warn!(error = %e, "Failed to send notification");
                }
            });
        }
        self.emit(event);
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    async fn persist(&self, job: &BackupJob) {
        if let Err(e) = db::jobs::upsert(&self.inner.ctx.db, job).await {
            warn!(job_id = %job.id, error = %e, "Failed to persist job");
        }
    }

    /// Append to the job's execution log.
    async fn record(&self, job_id: &str, level: &'static str, message: String) {
        if let Err(e) =
            db::jobs::append_log(&self.inner.ctx.db, job_id.to_string(), level, message).await
        {
            debug!(job_id, error = %e, "Failed to write execution log");
        }
    }
}
