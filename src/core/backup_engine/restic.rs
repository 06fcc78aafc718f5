use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::backup_engine::{
    BackupEngine, BackupOutcome, BackupRequest, BackupResult, EngineEvent,
};
use crate::core::filters::RegexFilter;
use crate::error::{Error, Result};

/// Restic exits with 3 when some source files could not be read.
const EXIT_INCOMPLETE: i32 = 3;

/// Drives the `restic` CLI in `--json` mode.
pub struct ResticEngine {
    binary: String,
    password_file: Option<PathBuf>,
}

impl ResticEngine {
    pub fn new(binary: String, password_file: Option<PathBuf>) -> Self {
        Self {
            binary,
            password_file,
        }
    }
}

impl BackupEngine for ResticEngine {
    fn create_backup(
        &self,
        req: &BackupRequest,
        tx: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<BackupResult>> + Send>> {
        let req = req.clone();
        let binary = self.binary.clone();
        let password_file = self.password_file.clone();

        Box::pin(async move {
            let (files_from, skipped) = if req.filters.has_regex() {
                let selection = write_file_list(&req).await?;
                (Some(selection.list), selection.skipped)
            } else {
                (None, Vec::new())
            };
            for message in &skipped {
                let _ = tx.send(EngineEvent::Warning(message.clone())).await;
            }

            let result = run_backup(&binary, password_file.as_deref(), &req, files_from.as_deref(), &tx, &cancel).await;

            if let Some(list) = files_from {
                if let Err(e) = tokio::fs::remove_file(&list).await {
                    debug!(path = %list.display(), error = %e, "Failed to remove file list");
                }
            }

            result.map(|result| mark_skipped(result, skipped.len()))
        })
    }
}

/// Directories the regex scan could not read make a clean run partial.
fn mark_skipped(mut result: BackupResult, skipped: usize) -> BackupResult {
    if skipped > 0 && result.outcome == BackupOutcome::Success {
        result.outcome = BackupOutcome::Partial;
        result.message = Some(format!("{} directories could not be read", skipped));
    }
    result
}

async fn run_backup(
    binary: &str,
    password_file: Option<&Path>,
    req: &BackupRequest,
    files_from: Option<&Path>,
    tx: &mpsc::Sender<EngineEvent>,
    cancel: &CancellationToken,
) -> Result<BackupResult> {
    let mut cmd = Command::new(binary);
    cmd.args(backup_args(req, files_from))
        .current_dir(&req.source)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(file) = password_file {
        cmd.env("RESTIC_PASSWORD_FILE", file);
    }

    info!(
        job_id = %req.job_id,
        source = %req.source.display(),
        repository = %req.repository.display(),
        "Starting restic backup"
    );

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Engine(format!("failed to spawn {}: {}", binary, e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Engine("failed to capture restic stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Engine("failed to capture restic stderr".into()))?;

    let mut stdout = BufReader::new(stdout).lines();
    let mut stderr = BufReader::new(stderr).lines();
    let mut tally = Tally::default();
    let (mut stdout_open, mut stderr_open) = (true, true);

    while stdout_open || stderr_open {
        tokio::select! {
            _ = cancel.cancelled() => return Err(abort(&mut child, &req.job_id).await),
            line = stdout.next_line(), if stdout_open => match line {
                Ok(Some(line)) => tally.handle(&line, tx).await,
                _ => stdout_open = false,
            },
            line = stderr.next_line(), if stderr_open => match line {
                Ok(Some(line)) => tally.handle(&line, tx).await,
                _ => stderr_open = false,
            },
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => return Err(abort(&mut child, &req.job_id).await),
        status = child.wait() => status
            .map_err(|e| Error::Engine(format!("failed to wait for restic: {}", e)))?,
    };

    Ok(tally.finish(status.code()))
}

async fn abort(child: &mut Child, job_id: &str) -> Error {
    warn!(job_id = %job_id, "Cancelling restic backup");
    if let Err(e) = child.kill().await {
        debug!(job_id = %job_id, error = %e, "Failed to kill restic");
    }
    Error::Cancelled
}

fn backup_args(req: &BackupRequest, files_from: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "-r".to_string(),
        req.repository.display().to_string(),
        "backup".to_string(),
        "--json".to_string(),
        "--host".to_string(),
        req.host.clone(),
        "--tag".to_string(),
        format!("device:{}", req.device_id),
    ];
    if let Some(share) = &req.share_id {
        args.push("--tag".to_string());
        args.push(format!("share:{}", share));
    }

    let exclude_flag = if req.filters.case_insensitive {
        "--iexclude"
    } else {
        "--exclude"
    };
    for pattern in &req.filters.exclude {
        args.push(exclude_flag.to_string());
        args.push(pattern.clone());
    }
    for marker in &req.filters.exclude_if_present {
        args.push("--exclude-if-present".to_string());
        args.push(marker.clone());
    }

    match files_from {
        Some(list) => {
            args.push("--files-from-verbatim".to_string());
            args.push(list.display().to_string());
        }
        None => args.push(".".to_string()),
    }
    args
}

struct FileSelection {
    list: PathBuf,
    /// One message per directory that could not be scanned.
    skipped: Vec<String>,
}

/// Select files with the regex rules and write them, one per line, for
/// `--files-from-verbatim`.
async fn write_file_list(req: &BackupRequest) -> Result<FileSelection> {
    let filter = req.filters.regex_filter()?;
    let source = req.source.clone();

    let (selected, skipped) = tokio::task::spawn_blocking(move || {
        let mut selected = Vec::new();
        let mut skipped = Vec::new();
        collect_matching(&source, &source, &filter, &mut selected, &mut skipped)?;
        Ok::<_, Error>((selected, skipped))
    })
    .await
    .map_err(|e| Error::Engine(format!("file scan panicked: {}", e)))??;

    if selected.is_empty() {
        return Err(Error::Engine(format!(
            "regex rules selected no files under {}",
            req.source.display()
        )));
    }

    debug!(job_id = %req.job_id, files = selected.len(), "Regex rules selected files");

    let list = std::env::temp_dir().join(format!("netbksd-{}.files", req.job_id));
    let mut contents = selected
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    contents.push('\n');
    tokio::fs::write(&list, contents).await?;
    Ok(FileSelection { list, skipped })
}

/// Only an unreadable `base` is an error. Subdirectories that cannot be read
/// are logged and recorded in `skipped`.
fn collect_matching(
    base: &Path,
    current: &Path,
    filter: &RegexFilter,
    selected: &mut Vec<PathBuf>,
    skipped: &mut Vec<String>,
) -> Result<()> {
    let entries = match std::fs::read_dir(current) {
        Ok(entries) => entries,
        Err(e) if current != base => {
            warn!(path = %current.display(), error = %e, "Skipping unreadable directory");
            skipped.push(format!("{}: {}", current.display(), e));
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                warn!(path = %current.display(), error = %e, "Directory listing interrupted");
                skipped.push(format!("{}: {}", current.display(), e));
                continue;
            }
        };

        // Do not follow symlinked directories
        let metadata = match path.symlink_metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            collect_matching(base, &path, filter, selected, skipped)?;
            continue;
        }

        let Ok(relative) = path.strip_prefix(base) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if filter.selects(&relative) {
            selected.push(path);
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
enum ResticMessage {
    Status(StatusMessage),
    Error(ErrorMessage),
    Summary(SummaryMessage),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StatusMessage {
    #[serde(default)]
    percent_done: f64,
    #[serde(default)]
    total_files: u64,
    #[serde(default)]
    files_done: u64,
    #[serde(default)]
    total_bytes: u64,
    #[serde(default)]
    bytes_done: u64,
    #[serde(default)]
    current_files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorMessage {
    /// A string in older restic releases, `{"message": ...}` in newer ones.
    #[serde(default)]
    error: serde_json::Value,
    #[serde(default)]
    item: Option<String>,
}

impl ErrorMessage {
    fn text(&self) -> String {
        let message = match &self.error {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => map
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
            other => other.to_string(),
        };
        match &self.item {
            Some(item) => format!("{}: {}", item, message),
            None => message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SummaryMessage {
    #[serde(default)]
    files_new: u64,
    #[serde(default)]
    files_changed: u64,
    #[serde(default)]
    files_unmodified: u64,
    #[serde(default)]
    data_added: u64,
    #[serde(default)]
    total_bytes_processed: u64,
    #[serde(default)]
    snapshot_id: Option<String>,
}

/// Accumulates what restic reported over one run.
#[derive(Default)]
struct Tally {
    summary: Option<SummaryMessage>,
    last_error: Option<String>,
}

impl Tally {
    async fn handle(&mut self, line: &str, tx: &mpsc::Sender<EngineEvent>) {
        if let Some(event) = self.apply(line) {
            let _ = tx.send(event).await;
        }
    }

    fn apply(&mut self, line: &str) -> Option<EngineEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        match serde_json::from_str::<ResticMessage>(line) {
            Ok(ResticMessage::Status(status)) => Some(EngineEvent::Progress {
                percent: (status.percent_done * 100.0).clamp(0.0, 100.0),
                current_file: status.current_files.into_iter().next(),
                files_done: status.files_done,
                bytes_done: status.bytes_done,
                total_files: status.total_files,
                total_bytes: status.total_bytes,
            }),
            Ok(ResticMessage::Error(error)) => {
                let text = error.text();
                self.last_error = Some(text.clone());
                Some(EngineEvent::Error(text))
            }
            Ok(ResticMessage::Summary(summary)) => {
                self.summary = Some(summary);
                None
            }
            Ok(ResticMessage::Other) => None,
            // Plain text goes to stderr: lock warnings, fatal errors
            Err(_) => {
                self.last_error = Some(line.to_string());
                Some(EngineEvent::Warning(line.to_string()))
            }
        }
    }

    fn finish(self, exit_code: Option<i32>) -> BackupResult {
        let snapshot_id = self
            .summary
            .as_ref()
            .and_then(|s| s.snapshot_id.clone());

        let outcome = match exit_code {
            Some(0) => BackupOutcome::Success,
            Some(EXIT_INCOMPLETE) if snapshot_id.is_some() => BackupOutcome::Partial,
            _ => BackupOutcome::Failed,
        };

        let message = match outcome {
            BackupOutcome::Success => None,
            BackupOutcome::Partial => Some("some files could not be read".to_string()),
            BackupOutcome::Failed => Some(self.last_error.clone().unwrap_or_else(|| match exit_code {
                Some(code) => format!("restic exited with code {}", code),
                None => "restic was terminated by a signal".to_string(),
            })),
        };

        let summary = self.summary.unwrap_or(SummaryMessage {
            files_new: 0,
            files_changed: 0,
            files_unmodified: 0,
            data_added: 0,
            total_bytes_processed: 0,
            snapshot_id: None,
        });

        BackupResult {
            outcome,
            files_new: summary.files_new,
            files_changed: summary.files_changed,
            files_unmodified: summary.files_unmodified,
            bytes_added: summary.data_added,
            bytes_processed: summary.total_bytes_processed,
            snapshot_id,
            message,
        }
    }
}
