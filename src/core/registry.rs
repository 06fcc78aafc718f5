//! In-memory store of live and recently finished jobs.
//!
//! Every execution holds a claim on its (device, share) target from the
//! moment it starts until it has fully unwound, unmount included. A second
//! execution of a claimed target is refused. Cancelling a job flips its
//! status right away but the claim stays until the execution calls `finish`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::core::models::{BackupJob, JobStatus, JobTarget};
use crate::error::{Error, Result};

struct Entry {
    job: BackupJob,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<String, Entry>,
    /// Target to the id of the job executing it.
    claims: HashMap<JobTarget, String>,
}

impl RegistryState {
    fn claim(&mut self, job: &BackupJob) -> Result<()> {
        let target = job.target();
        if let Some(running) = self.claims.get(&target) {
            return Err(Error::JobConflict {
                target: target.to_string(),
                running_job: running.clone(),
            });
        }
        self.claims.insert(target, job.id.clone());
        Ok(())
    }

    fn release(&mut self, job: &BackupJob) {
        let target = job.target();
        if self.claims.get(&target) == Some(&job.id) {
            self.claims.remove(&target);
        }
    }
}

/// Filter for [`JobRegistry::list`]. Empty matches everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub device_id: Option<String>,
    pub status: Option<JobStatus>,
}

#[derive(Clone, Default)]
pub struct JobRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a Pending job without claiming its target.
    ///
    /// A retry is refused when another retry of the same job exists.
    pub async fn create(&self, mut job: BackupJob) -> Result<CancellationToken> {
        job.status = JobStatus::Pending;
        let cancel = CancellationToken::new();
        let mut state = self.inner.write().await;
        if let Some(source) = &job.retry_of {
            let existing = state
                .jobs
                .values()
                .find(|e| e.job.retry_of.as_ref() == Some(source));
            if let Some(existing) = existing {
                return Err(Error::InvalidState(format!(
                    "job {} was already retried as {}",
                    source, existing.job.id
                )));
            }
        }
        state.jobs.insert(
            job.id.clone(),
            Entry {
                job,
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    /// Claim the job's target and register it as Running.
    pub async fn try_start(&self, mut job: BackupJob) -> Result<(BackupJob, CancellationToken)> {
        let mut state = self.inner.write().await;
        state.claim(&job)?;

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        let cancel = CancellationToken::new();
        state.jobs.insert(
            job.id.clone(),
            Entry {
                job: job.clone(),
                cancel: cancel.clone(),
            },
        );
        Ok((job, cancel))
    }

    /// Move a Pending job to Running, claiming its target.
    pub async fn promote(&self, job_id: &str) -> Result<BackupJob> {
        let mut state = self.inner.write().await;
        let job = state
            .jobs
            .get(job_id)
            .map(|e| e.job.clone())
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        match job.status {
            JobStatus::Pending => {}
            JobStatus::Cancelled => return Err(Error::Cancelled),
            other => {
                return Err(Error::InvalidState(format!(
                    "job {} is {}, expected Pending",
                    job_id, other
                )));
            }
        }

        state.claim(&job)?;
        let entry = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        entry.job.status = JobStatus::Running;
        entry.job.started_at = Some(Utc::now());
        Ok(entry.job.clone())
    }

    pub async fn get(&self, job_id: &str) -> Option<BackupJob> {
        let state = self.inner.read().await;
        state.jobs.get(job_id).map(|e| e.job.clone())
    }

    /// Matching jobs, oldest first.
    pub async fn list(&self, filter: &JobFilter) -> Vec<BackupJob> {
        let state = self.inner.read().await;
        let mut jobs: Vec<BackupJob> = state
            .jobs
            .values()
            .map(|e| &e.job)
            .filter(|job| {
                filter
                    .device_id
                    .as_ref()
                    .is_none_or(|device| &job.device_id == device)
                    && filter.status.is_none_or(|status| job.status == status)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Apply `apply` to a job that has not reached a terminal state.
    ///
    /// Returns false when the job is unknown or already terminal.
    pub async fn update(&self, job_id: &str, apply: impl FnOnce(&mut BackupJob)) -> bool {
        let mut state = self.inner.write().await;
        match state.jobs.get_mut(job_id) {
            Some(entry) if !entry.job.status.is_terminal() => {
                apply(&mut entry.job);
                true
            }
            _ => false,
        }
    }

    /// Record the final state of an execution and release its claim.
    ///
    /// A job cancelled while it ran stays Cancelled whatever `status` says.
    pub async fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        apply: impl FnOnce(&mut BackupJob),
    ) -> Option<BackupJob> {
        let mut state = self.inner.write().await;
        let entry = state.jobs.get_mut(job_id)?;

        apply(&mut entry.job);
        if entry.job.status != JobStatus::Cancelled {
            entry.job.status = status;
        }
        entry.job.completed_at = Some(Utc::now());
        let job = entry.job.clone();

        state.release(&job);
        Some(job)
    }

    /// Mark a job Cancelled and signal its token. The execution unwinds on
    /// its own and keeps the target claimed until it finishes.
    pub async fn request_cancellation(&self, job_id: &str) -> Result<BackupJob> {
        let mut state = self.inner.write().await;
        let entry = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        if entry.job.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "job {} already {}",
                job_id, entry.job.status
            )));
        }

        entry.job.status = JobStatus::Cancelled;
        entry.job.completed_at = Some(Utc::now());
        entry.cancel.cancel();
        Ok(entry.job.clone())
    }

    /// Drop a terminal job from memory.
    pub async fn remove(&self, job_id: &str) -> Result<BackupJob> {
        let mut state = self.inner.write().await;
        let is_claimed = state.claims.values().any(|id| id == job_id);
        let entry = state
            .jobs
            .get(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        if !entry.job.status.is_terminal() || is_claimed {
            return Err(Error::InvalidState(format!("job {} is still active", job_id)));
        }

        state
            .jobs
            .remove(job_id)
            .map(|e| e.job)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    /// Remove terminal jobs that completed more than `older_than` ago.
    pub async fn prune_terminal(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut state = self.inner.write().await;
        let claimed: HashSet<String> = state.claims.values().cloned().collect();

        let before = state.jobs.len();
        state.jobs.retain(|id, entry| {
            !(entry.job.status.is_terminal()
                && !claimed.contains(id)
                && entry.job.completed_at.is_some_and(|t| t <= cutoff))
        });
        before - state.jobs.len()
    }

    /// Jobs that are not terminal or are still unwinding.
    pub async fn active_ids(&self) -> Vec<String> {
        let state = self.inner.read().await;
        let mut ids: HashSet<String> = state.claims.values().cloned().collect();
        ids.extend(
            state
                .jobs
                .iter()
                .filter(|(_, e)| !e.job.status.is_terminal())
                .map(|(id, _)| id.clone()),
        );
        let mut ids: Vec<String> = ids.into_iter().collect();
        ids.sort();
        ids
    }

    pub async fn active_count(&self) -> usize {
        self.active_ids().await.len()
    }

    /// Id of the job currently holding `target`.
    pub async fn claimant(&self, target: &JobTarget) -> Option<String> {
        self.inner.read().await.claims.get(target).cloned()
    }
}
