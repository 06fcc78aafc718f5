pub mod restic;
pub mod simulated;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, EngineType};
use crate::core::filters::FilterRules;
use crate::error::Result;

/// Everything the engine needs to snapshot one mounted share.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub job_id: String,
    pub repository: PathBuf,
    /// Recorded as the snapshot host.
    pub host: String,
    pub device_id: String,
    pub share_id: Option<String>,
    pub source: PathBuf,
    pub filters: FilterRules,
}

/// Streamed while a backup runs.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Progress {
        percent: f64,
        current_file: Option<String>,
        files_done: u64,
        bytes_done: u64,
        total_files: u64,
        total_bytes: u64,
    },
    Warning(String),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupOutcome {
    Success,
    /// Some files could not be read but a snapshot was written.
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResult {
    pub outcome: BackupOutcome,
    pub files_new: u64,
    pub files_changed: u64,
    pub files_unmodified: u64,
    pub bytes_added: u64,
    pub bytes_processed: u64,
    pub snapshot_id: Option<String>,
    pub message: Option<String>,
}

impl BackupResult {
    pub fn files_processed(&self) -> u64 {
        self.files_new + self.files_changed + self.files_unmodified
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            outcome: BackupOutcome::Failed,
            files_new: 0,
            files_changed: 0,
            files_unmodified: 0,
            bytes_added: 0,
            bytes_processed: 0,
            snapshot_id: None,
            message: Some(message.into()),
        }
    }
}

/// Client for the content-addressed backup tool.
///
/// Cancelling `cancel` must stop the underlying work and resolve to
/// `Error::Cancelled`.
pub trait BackupEngine: Send + Sync {
    fn create_backup(
        &self,
        req: &BackupRequest,
        tx: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<BackupResult>> + Send>>;
}

pub fn get_engine(config: &AppConfig) -> Arc<dyn BackupEngine> {
    match config.engine {
        EngineType::Restic if !config.simulation => Arc::new(restic::ResticEngine::new(
            config.restic_binary.clone(),
            config.repository_password_file.clone(),
        )),
        _ => Arc::new(simulated::SimulatedEngine::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_processed_sums_counters() {
        let result = BackupResult {
            outcome: BackupOutcome::Success,
            files_new: 10,
            files_changed: 5,
            files_unmodified: 100,
            bytes_added: 0,
            bytes_processed: 0,
            snapshot_id: None,
            message: None,
        };
        assert_eq!(result.files_processed(), 115);
    }
}
