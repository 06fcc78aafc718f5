mod slack;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{NotificationChannelType, NotificationConfig};
use crate::core::models::JobStatus;

pub use slack::SlackNotifier;

/// Job lifecycle events, broadcast to subscribers as they happen.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Started {
        job_id: String,
        device_id: String,
        share_id: Option<String>,
        source: PathBuf,
    },
    Progress {
        job_id: String,
        percent: f64,
        current_file: Option<String>,
        files_done: u64,
        bytes_done: u64,
    },
    Warning {
        job_id: String,
        message: String,
    },
    /// Completed or PartiallyCompleted.
    Completed {
        job_id: String,
        device_id: String,
        share_id: Option<String>,
        status: JobStatus,
        files_processed: u64,
        bytes_added: u64,
        snapshot_id: Option<String>,
        warning_count: u32,
        duration_secs: u64,
    },
    Failed {
        job_id: String,
        device_id: String,
        share_id: Option<String>,
        error: String,
    },
    Cancelled {
        job_id: String,
        device_id: String,
        share_id: Option<String>,
    },
    RetryScheduled {
        job_id: String,
        retry_of: String,
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Warning { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id, .. }
            | JobEvent::RetryScheduled { job_id, .. } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Completed { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled { .. }
        )
    }
}

/// Outbound notification transport (Slack, Discord, etc.)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, event: JobEvent) -> Result<()>;
}

pub fn create_notifier(config: &NotificationConfig) -> Option<Arc<dyn NotificationChannel>> {
    match &config.channel {
        NotificationChannelType::None => None,
        NotificationChannelType::Slack => {
            let webhook = config.slack_webhook.as_ref()?;
            if webhook.is_empty() {
                return None;
            }
            Some(Arc::new(SlackNotifier::new(webhook.clone())))
        }
    }
}
