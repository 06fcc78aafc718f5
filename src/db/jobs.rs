use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::{Connection, params, rusqlite};
use uuid::Uuid;

use crate::core::models::{BackupJob, JobStatus, JobType};

/// One line of a job's execution log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: String,
    pub message: String,
}

/// Insert or replace the stored record for a job.
pub async fn upsert(conn: &Connection, job: &BackupJob) -> Result<()> {
    let job = job.clone();
    conn.call(move |c| {
        c.execute(
            "INSERT INTO backup_jobs (
                id, device_id, share_id, job_type, status, created_at, started_at,
                completed_at, snapshot_id, files_processed, bytes_processed, files_new,
                files_changed, files_unmodified, bytes_added, warning_count,
                error_message, retry_attempt, next_retry_at, retry_of)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                snapshot_id = excluded.snapshot_id,
                files_processed = excluded.files_processed,
                bytes_processed = excluded.bytes_processed,
                files_new = excluded.files_new,
                files_changed = excluded.files_changed,
                files_unmodified = excluded.files_unmodified,
                bytes_added = excluded.bytes_added,
                warning_count = excluded.warning_count,
                error_message = excluded.error_message,
                next_retry_at = excluded.next_retry_at,
                updated_at = CURRENT_TIMESTAMP",
            params![
                &job.id,
                &job.device_id,
                &job.share_id,
                job.job_type.as_str(),
                job.status.as_str(),
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
                &job.snapshot_id,
                job.files_processed as i64,
                job.bytes_processed as i64,
                job.files_new as i64,
                job.files_changed as i64,
                job.files_unmodified as i64,
                job.bytes_added as i64,
                job.warning_count,
                &job.error_message,
                job.retry_attempt,
                job.next_retry_at.map(|t| t.to_rfc3339()),
                &job.retry_of,
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn append_log(
    conn: &Connection,
    job_id: String,
    level: &'static str,
    message: String,
) -> Result<()> {
    conn.call(move |c| {
        let log_id = Uuid::now_v7().to_string();
        c.execute(
            "INSERT INTO job_log (id, job_id, level, message) VALUES (?1, ?2, ?3, ?4)",
            params![log_id, job_id, level, message],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(())
}

pub async fn log_entries(conn: &Connection, job_id: String) -> Result<Vec<LogEntry>> {
    let entries = conn
        .call(move |c| {
            let mut stmt =
                c.prepare("SELECT level, message FROM job_log WHERE job_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![job_id], |row| {
                Ok(LogEntry {
                    level: row.get(0)?,
                    message: row.get(1)?,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await?;

    Ok(entries)
}

pub async fn get(conn: &Connection, job_id: String) -> Result<Option<BackupJob>> {
    let row = conn
        .call(move |c| {
            c.query_row(
                &format!("{} WHERE id = ?1", SELECT_JOB),
                params![job_id],
                StoredJob::from_row,
            )
            .optional()
        })
        .await
        .map_err(|e| anyhow!("Failed to get job: {}", e))?;

    row.map(StoredJob::into_job).transpose()
}

/// Id of a job recorded as a retry of `job_id`, if any.
pub async fn find_retry(conn: &Connection, job_id: String) -> Result<Option<String>> {
    let id = conn
        .call(move |c| {
            c.query_row(
                "SELECT id FROM backup_jobs WHERE retry_of = ?1 LIMIT 1",
                params![job_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .await
        .map_err(|e| anyhow!("Failed to look up retries: {}", e))?;

    Ok(id)
}

/// Most recent jobs for a device, newest first.
pub async fn list_for_device(
    conn: &Connection,
    device_id: String,
    limit: usize,
) -> Result<Vec<BackupJob>> {
    let rows = conn
        .call(move |c| {
            let mut stmt = c.prepare(&format!(
                "{} WHERE device_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
                SELECT_JOB
            ))?;
            let rows = stmt.query_map(params![device_id, limit as i64], StoredJob::from_row)?;
            rows.collect::<Result<Vec<_>, _>>()
        })
        .await?;

    rows.into_iter().map(StoredJob::into_job).collect()
}

const SELECT_JOB: &str = "SELECT id, device_id, share_id, job_type, status, created_at,
    started_at, completed_at, snapshot_id, files_processed, bytes_processed, files_new,
    files_changed, files_unmodified, bytes_added, warning_count, error_message,
    retry_attempt, next_retry_at, retry_of
    FROM backup_jobs";

/// Raw row; converted outside the connection thread.
struct StoredJob {
    id: String,
    device_id: String,
    share_id: Option<String>,
    job_type: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    snapshot_id: Option<String>,
    counters: [i64; 6],
    warning_count: u32,
    error_message: Option<String>,
    retry_attempt: u32,
    next_retry_at: Option<String>,
    retry_of: Option<String>,
}

impl StoredJob {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            device_id: row.get(1)?,
            share_id: row.get(2)?,
            job_type: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
            snapshot_id: row.get(8)?,
            counters: [
                row.get(9)?,
                row.get(10)?,
                row.get(11)?,
                row.get(12)?,
                row.get(13)?,
                row.get(14)?,
            ],
            warning_count: row.get(15)?,
            error_message: row.get(16)?,
            retry_attempt: row.get(17)?,
            next_retry_at: row.get(18)?,
            retry_of: row.get(19)?,
        })
    }

    fn into_job(self) -> Result<BackupJob> {
        let [files_processed, bytes_processed, files_new, files_changed, files_unmodified, bytes_added] =
            self.counters.map(|v| v.max(0) as u64);

        Ok(BackupJob {
            id: self.id,
            device_id: self.device_id,
            share_id: self.share_id,
            job_type: parse_job_type(&self.job_type)?,
            status: parse_status(&self.status)?,
            created_at: parse_time(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_time).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
            snapshot_id: self.snapshot_id,
            files_processed,
            bytes_processed,
            files_new,
            files_changed,
            files_unmodified,
            bytes_added,
            percent_done: 0.0,
            current_file: None,
            warning_count: self.warning_count,
            error_message: self.error_message,
            retry_attempt: self.retry_attempt,
            next_retry_at: self.next_retry_at.as_deref().map(parse_time).transpose()?,
            retry_of: self.retry_of,
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| anyhow!("Bad timestamp '{}': {}", value, e))?
        .with_timezone(&Utc))
}

fn parse_status(value: &str) -> Result<JobStatus> {
    Ok(match value {
        "Pending" => JobStatus::Pending,
        "Running" => JobStatus::Running,
        "Completed" => JobStatus::Completed,
        "Failed" => JobStatus::Failed,
        "PartiallyCompleted" => JobStatus::PartiallyCompleted,
        "Cancelled" => JobStatus::Cancelled,
        other => return Err(anyhow!("Unknown job status '{}'", other)),
    })
}

fn parse_job_type(value: &str) -> Result<JobType> {
    Ok(match value {
        "Scheduled" => JobType::Scheduled,
        "Manual" => JobType::Manual,
        "Retry" => JobType::Retry,
        other => return Err(anyhow!("Unknown job type '{}'", other)),
    })
}
