use std::fmt;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::credentials::Credentials;
use crate::core::filters::FilterRules;
use crate::error::{Error, Result};

/// Network protocol a device is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    Smb,
    Ssh,
    Rsync,
}

impl ProtocolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smb => "smb",
            Self::Ssh => "ssh",
            Self::Rsync => "rsync",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Smb => 445,
            Self::Ssh => 22,
            Self::Rsync => 873,
        }
    }

    pub fn all() -> [ProtocolType; 3] {
        [Self::Smb, Self::Ssh, Self::Rsync]
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backup source reachable over the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub protocol: ProtocolType,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub wake_on_lan: bool,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,
    #[serde(default)]
    pub filters: Option<FilterRules>,
    #[serde(default)]
    pub shares: Vec<Share>,
}

impl Device {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    pub fn share(&self, share_id: &str) -> Option<&Share> {
        self.shares.iter().find(|s| s.id == share_id)
    }

    pub fn enabled_shares(&self) -> impl Iterator<Item = &Share> {
        self.shares.iter().filter(|s| s.enabled)
    }

    /// Retention policy for a share, falling back to the device policy.
    pub fn effective_retention(&self, share: &Share) -> Option<RetentionPolicy> {
        share.retention.clone().or_else(|| self.retention.clone())
    }
}

fn default_enabled() -> bool {
    true
}

/// A path on a device that gets backed up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    pub id: String,
    /// Owning device. Filled in by the inventory when loaded from a file.
    #[serde(default)]
    pub device_id: String,
    pub path: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,
    #[serde(default)]
    pub filters: Option<FilterRules>,
}

/// Cron expression plus an optional time-of-day window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub cron: String,
    #[serde(default)]
    pub window_start: Option<NaiveTime>,
    #[serde(default)]
    pub window_end: Option<NaiveTime>,
}

impl Schedule {
    pub fn new(cron: impl Into<String>) -> Self {
        Self {
            cron: cron.into(),
            window_start: None,
            window_end: None,
        }
    }

    pub fn with_window(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.window_start = Some(start);
        self.window_end = Some(end);
        self
    }

    /// Checks the window bounds. The cron expression is checked by the scheduler.
    pub fn validate_window(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.window_start, self.window_end) {
            if end <= start {
                return Err(Error::invalid_schedule(
                    &self.cron,
                    format!("window end {} must be after window start {}", end, start),
                ));
            }
        }
        Ok(())
    }

    /// Whether a backup may start at the given time of day.
    pub fn window_contains(&self, time: NaiveTime) -> bool {
        let after_start = self.window_start.is_none_or(|start| time >= start);
        let before_end = self.window_end.is_none_or(|end| time < end);
        after_start && before_end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub keep_last: Option<u32>,
    #[serde(default)]
    pub keep_daily: Option<u32>,
    #[serde(default)]
    pub keep_weekly: Option<u32>,
    #[serde(default)]
    pub keep_monthly: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobType {
    Scheduled,
    Manual,
    Retry,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "Scheduled",
            Self::Manual => "Manual",
            Self::Retry => "Retry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    PartiallyCompleted,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::PartiallyCompleted | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::PartiallyCompleted => "PartiallyCompleted",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (device, share) pair a job backs up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobTarget {
    pub device_id: String,
    pub share_id: Option<String>,
}

impl JobTarget {
    pub fn share(device_id: impl Into<String>, share_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            share_id: Some(share_id.into()),
        }
    }
}

impl fmt::Display for JobTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.share_id {
            Some(share) => write!(f, "{}/{}", self.device_id, share),
            None => write!(f, "{}/*", self.device_id),
        }
    }
}

/// One tracked execution attempt of a backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub device_id: String,
    pub share_id: Option<String>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub snapshot_id: Option<String>,
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub bytes_added: u64,
    pub percent_done: f64,
    pub current_file: Option<String>,
    pub warning_count: u32,
    pub error_message: Option<String>,
    pub retry_attempt: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub retry_of: Option<String>,
}

impl BackupJob {
    pub fn new(target: &JobTarget, job_type: JobType) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            device_id: target.device_id.clone(),
            share_id: target.share_id.clone(),
            job_type,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            snapshot_id: None,
            files_processed: 0,
            bytes_processed: 0,
            files_new: 0,
            files_changed: 0,
            files_unmodified: 0,
            bytes_added: 0,
            percent_done: 0.0,
            current_file: None,
            warning_count: 0,
            error_message: None,
            retry_attempt: 0,
            next_retry_at: None,
            retry_of: None,
        }
    }

    pub fn target(&self) -> JobTarget {
        JobTarget {
            device_id: self.device_id.clone(),
            share_id: self.share_id.clone(),
        }
    }
}
