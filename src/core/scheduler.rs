//! Recurring backup triggers.
//!
//! Triggers are checked on a fixed tick. Due triggers are handed to the
//! orchestrator on their own task so a slow mount or engine never delays
//! other triggers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::cron::{CronExpr, normalize_cron};
use crate::core::models::{BackupJob, Device, JobType, Schedule, Share};
use crate::core::orchestrator::Orchestrator;
use crate::error::{Error, Result};

/// Finished jobs stay queryable in memory this long.
const JOB_RETENTION: Duration = Duration::from_secs(24 * 3600);
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TriggerKey {
    Device(String),
    Share(String),
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKey::Device(id) => write!(f, "device:{}", id),
            TriggerKey::Share(id) => write!(f, "share:{}", id),
        }
    }
}

/// A registered recurring trigger.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub key: TriggerKey,
    pub device_id: String,
    pub share_id: Option<String>,
    /// Schedule with its cron in normalized form.
    pub schedule: Schedule,
    pub expr: CronExpr,
    pub next_fire: Option<DateTime<Local>>,
}

struct LoopHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Scheduler {
    orchestrator: Orchestrator,
    triggers: Arc<RwLock<HashMap<TriggerKey, Trigger>>>,
    tick: Duration,
    running: Arc<Mutex<Option<LoopHandle>>>,
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator, tick: Duration) -> Self {
        Self {
            orchestrator,
            triggers: Arc::new(RwLock::new(HashMap::new())),
            tick,
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Register triggers for every scheduled device and share, then start
    /// the tick loop. Calling it again while running does nothing.
    ///
    /// Entries with an invalid schedule are logged and left unregistered.
    pub async fn start(&self) -> Result<usize> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Scheduler already running");
            return Ok(self.triggers.read().await.len());
        }

        let devices = self.orchestrator.inventory().list_devices().await?;
        for device in &devices {
            if let Some(schedule) = &device.schedule {
                if let Err(e) = self.schedule_device_backup(device, schedule).await {
                    error!(device_id = %device.id, error = %e, "Device schedule rejected");
                }
            }
            for share in device.enabled_shares() {
                if let Some(schedule) = &share.schedule {
                    if let Err(e) = self.schedule_share_backup(device, share, schedule).await {
                        error!(
                            device_id = %device.id,
                            share_id = %share.id,
                            error = %e,
                            "Share schedule rejected"
                        );
                    }
                }
            }
        }

        let cancel = CancellationToken::new();
        let this = self.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { this.run(loop_cancel).await });
        *running = Some(LoopHandle { cancel, handle });

        let count = self.triggers.read().await.len();
        info!(triggers = count, "Scheduler started");
        Ok(count)
    }

    /// Stop firing triggers. Jobs already running are left alone.
    pub async fn stop(&self) {
        let Some(LoopHandle { cancel, handle }) = self.running.lock().await.take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Scheduler loop ended abnormally");
        }
        info!("Scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Register (or replace) the trigger for a whole device.
    pub async fn schedule_device_backup(
        &self,
        device: &Device,
        schedule: &Schedule,
    ) -> Result<Trigger> {
        let trigger = build_trigger(
            TriggerKey::Device(device.id.clone()),
            &device.id,
            None,
            schedule,
        )?;
        Ok(self.register(trigger).await)
    }

    /// Register (or replace) the trigger for one share.
    pub async fn schedule_share_backup(
        &self,
        device: &Device,
        share: &Share,
        schedule: &Schedule,
    ) -> Result<Trigger> {
        if !share.enabled {
            return Err(Error::ShareDisabled(format!("{}/{}", device.id, share.id)));
        }
        let trigger = build_trigger(
            TriggerKey::Share(share.id.clone()),
            &device.id,
            Some(&share.id),
            schedule,
        )?;
        Ok(self.register(trigger).await)
    }

    pub async fn unschedule_device_backup(&self, device_id: &str) -> bool {
        self.unregister(&TriggerKey::Device(device_id.to_string()))
            .await
    }

    pub async fn unschedule_share_backup(&self, share_id: &str) -> bool {
        self.unregister(&TriggerKey::Share(share_id.to_string()))
            .await
    }

    /// One-off backup outside the cron cycle. Returns the started jobs.
    pub async fn trigger_immediate_backup(
        &self,
        device_id: &str,
        share_id: Option<&str>,
    ) -> Result<Vec<BackupJob>> {
        info!(device_id, share_id = share_id.unwrap_or("*"), "Immediate backup requested");
        match share_id {
            Some(share_id) => Ok(vec![
                self.orchestrator
                    .start_share_backup(device_id, share_id, JobType::Manual)
                    .await?,
            ]),
            None => {
                self.orchestrator
                    .start_device_backup(device_id, JobType::Manual)
                    .await
            }
        }
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<BackupJob> {
        self.orchestrator.cancel_job(job_id).await
    }

    /// Registered triggers, ordered by key.
    pub async fn triggers(&self) -> Vec<Trigger> {
        let mut triggers: Vec<Trigger> = self.triggers.read().await.values().cloned().collect();
        triggers.sort_by(|a, b| a.key.cmp(&b.key));
        triggers
    }

    /// Dispatch every trigger due at `now` and advance it. Returns the
    /// number of backups dispatched; the tick loop calls this.
    pub async fn fire_due(&self, now: DateTime<Local>) -> usize {
        let mut due = Vec::new();
        {
            let mut triggers = self.triggers.write().await;
            for trigger in triggers.values_mut() {
                if trigger.next_fire.is_some_and(|next| next <= now) {
                    due.push(trigger.clone());
                    trigger.next_fire = trigger.expr.next_after(&now);
                }
            }
        }

        let mut dispatched = 0;
        for trigger in due {
            if !trigger.schedule.window_contains(now.time()) {
                info!(trigger = %trigger.key, "Trigger fired outside its backup window, skipped");
                continue;
            }

            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move { fire(orchestrator, trigger).await });
            dispatched += 1;
        }
        dispatched
    }

    async fn register(&self, trigger: Trigger) -> Trigger {
        info!(
            trigger = %trigger.key,
            cron = %trigger.schedule.cron,
            next_fire = ?trigger.next_fire,
            "Trigger registered"
        );
        self.triggers
            .write()
            .await
            .insert(trigger.key.clone(), trigger.clone());
        trigger
    }

    async fn unregister(&self, key: &TriggerKey) -> bool {
        let removed = self.triggers.write().await.remove(key).is_some();
        if removed {
            info!(trigger = %key, "Trigger removed");
        }
        removed
    }

    async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.fire_due(Local::now()).await;
                }
                _ = prune.tick() => {
                    let pruned = self
                        .orchestrator
                        .context()
                        .jobs
                        .prune_terminal(JOB_RETENTION)
                        .await;
                    if pruned > 0 {
                        debug!(pruned, "Pruned finished jobs");
                    }
                }
            }
        }
    }
}

fn build_trigger(
    key: TriggerKey,
    device_id: &str,
    share_id: Option<&str>,
    schedule: &Schedule,
) -> Result<Trigger> {
    let cron = normalize_cron(&schedule.cron)?;
    let expr = CronExpr::parse(&cron).map_err(|e| Error::invalid_schedule(&cron, e.to_string()))?;
    schedule.validate_window()?;

    let next_fire = expr.next_after(&Local::now());
    if next_fire.is_none() {
        return Err(Error::invalid_schedule(&schedule.cron, "never fires"));
    }

    Ok(Trigger {
        key,
        device_id: device_id.to_string(),
        share_id: share_id.map(str::to_string),
        schedule: Schedule {
            cron,
            ..schedule.clone()
        },
        expr,
        next_fire,
    })
}

async fn fire(orchestrator: Orchestrator, trigger: Trigger) {
    let result = match &trigger.share_id {
        Some(share_id) => orchestrator
            .start_share_backup(&trigger.device_id, share_id, JobType::Scheduled)
            .await
            .map(|job| vec![job]),
        // Shares with their own schedule have their own trigger
        None => {
            orchestrator
                .start_device_shares(&trigger.device_id, JobType::Scheduled, |share| {
                    share.schedule.is_none()
                })
                .await
        }
    };

    match result {
        Ok(jobs) => info!(trigger = %trigger.key, jobs = jobs.len(), "Scheduled backup started"),
        Err(e @ Error::JobConflict { .. }) => {
            warn!(trigger = %trigger.key, error = %e, "Previous backup still running, skipped")
        }
        Err(Error::NoEnabledShares(_)) => {
            debug!(trigger = %trigger.key, "No shares follow the device schedule")
        }
        Err(e) => error!(trigger = %trigger.key, error = %e, "Scheduled backup could not start"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_trigger_normalizes_cron() {
        let trigger = build_trigger(
            TriggerKey::Device("nas".into()),
            "nas",
            None,
            &Schedule::new("0 0 0 * * *"),
        )
        .unwrap();
        assert_eq!(trigger.schedule.cron, "0 0 0 * * ?");
        assert!(trigger.next_fire.is_some());
    }

    #[test]
    fn test_build_trigger_rejects_blank_and_never() {
        for cron in ["", "  ", "0 0 0 30 2 ?"] {
            let err = build_trigger(
                TriggerKey::Share("photos".into()),
                "nas",
                Some("photos"),
                &Schedule::new(cron),
            )
            .unwrap_err();
            assert!(matches!(err, Error::InvalidSchedule { .. }), "{:?}", cron);
        }
    }

    #[test]
    fn test_trigger_key_display() {
        assert_eq!(TriggerKey::Device("nas".into()).to_string(), "device:nas");
        assert_eq!(TriggerKey::Share("photos".into()).to_string(), "share:photos");
    }
}
