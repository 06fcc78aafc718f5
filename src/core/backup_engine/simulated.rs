use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::core::backup_engine::{
    BackupEngine, BackupOutcome, BackupRequest, BackupResult, EngineEvent,
};
use crate::error::{Error, Result};

/// Engine that pretends to back up a fixed number of files.
pub struct SimulatedEngine {
    pub total_files: u64,
    pub file_size: u64,
    pub tick: Duration,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self {
            total_files: 20,
            file_size: 4 * 1024 * 1024,
            tick: Duration::from_millis(250),
        }
    }
}

impl BackupEngine for SimulatedEngine {
    fn create_backup(
        &self,
        req: &BackupRequest,
        tx: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<BackupResult>> + Send>> {
        let req = req.clone();
        let total_files = self.total_files.max(1);
        let file_size = self.file_size;
        let tick = self.tick;

        Box::pin(async move {
            let total_bytes = total_files * file_size;
            let step = (total_files / 4).max(1);
            let mut files_done = 0;

            while files_done < total_files {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = sleep(tick) => {}
                }

                files_done = (files_done + step).min(total_files);
                let _ = tx
                    .send(EngineEvent::Progress {
                        percent: files_done as f64 * 100.0 / total_files as f64,
                        current_file: Some(format!(
                            "{}/simulated_{:04}.dat",
                            req.source.display(),
                            files_done
                        )),
                        files_done,
                        bytes_done: files_done * file_size,
                        total_files,
                        total_bytes,
                    })
                    .await;
            }

            let snapshot_id = Uuid::now_v7().simple().to_string()[..8].to_string();
            info!(job_id = %req.job_id, snapshot_id = %snapshot_id, "(Simulated) Snapshot saved");

            Ok(BackupResult {
                outcome: BackupOutcome::Success,
                files_new: total_files,
                files_changed: 0,
                files_unmodified: 0,
                bytes_added: total_bytes,
                bytes_processed: total_bytes,
                snapshot_id: Some(snapshot_id),
                message: None,
            })
        })
    }
}
