mod common;

use common::{ScriptedEngine, device, harness, harness_with, wait_for, wait_terminal};
use netbksd::core::backup_engine::{BackupOutcome, BackupResult};
use netbksd::core::notifications::JobEvent;
use netbksd::core::{JobStatus, JobType};
use netbksd::db;
use netbksd::error::{Error, ErrorKind};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Wait for the terminal event of `job_id`, which is emitted after the job
/// has unwound and released its target.
async fn terminal_event(
    events: &mut broadcast::Receiver<JobEvent>,
    job_id: &str,
    limit: Duration,
) -> JobEvent {
    timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) if event.is_terminal() && event.job_id() == job_id => break event,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {:?}", e),
            }
        }
    })
    .await
    .expect("terminal event in time")
}

#[tokio::test]
async fn test_share_backup_completes_with_counts() {
    let h = harness(vec![device("nas", &["photos"])]).await;

    let job = h
        .orchestrator
        .execute_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.files_processed, 115);
    assert_eq!(job.files_new, 10);
    assert_eq!(job.snapshot_id.as_deref(), Some("1f2e3d4c"));
    assert_eq!(job.percent_done, 100.0);
    assert!(job.started_at.is_some());
    assert!(job.completed_at >= job.started_at);
    assert_eq!(h.simulator.mount_count(), 1);
    assert_eq!(h.simulator.unmount_count(), 1);

    let stored = db::jobs::get(&h.orchestrator.context().db, job.id.clone())
        .await
        .unwrap()
        .expect("job persisted");
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.files_processed, 115);

    let log = db::jobs::log_entries(&h.orchestrator.context().db, job.id.clone())
        .await
        .unwrap();
    assert!(log.iter().any(|e| e.message.contains("backup started")));
}

#[tokio::test]
async fn test_request_uses_device_as_host() {
    let h = harness(vec![device("nas", &["photos", "docs"])]).await;

    let jobs = h
        .orchestrator
        .execute_device_backup("nas", JobType::Scheduled)
        .await
        .unwrap();

    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].share_id.as_deref(), Some("photos"));
    assert_eq!(jobs[1].share_id.as_deref(), Some("docs"));
    assert!(jobs.iter().all(|j| j.status == JobStatus::Completed));
    assert!(jobs.iter().all(|j| j.job_type == JobType::Scheduled));

    let requests = h.engine.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.host == "nas"));
}

#[tokio::test]
async fn test_device_without_enabled_shares() {
    let mut nas = device("nas", &["photos"]);
    nas.shares[0].enabled = false;
    let h = harness(vec![nas]).await;

    let err = h
        .orchestrator
        .execute_device_backup("nas", JobType::Manual)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoEnabledShares(_)));
    assert!(h.orchestrator.list_jobs().await.is_empty());
}

#[tokio::test]
async fn test_disabled_share_creates_no_job() {
    let mut nas = device("nas", &["photos", "docs"]);
    nas.shares[1].enabled = false;
    let h = harness(vec![nas]).await;

    let err = h
        .orchestrator
        .start_share_backup("nas", "docs", JobType::Manual)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ShareDisabled(_)));

    let err = h
        .orchestrator
        .execute_share_backup("nas", "docs", JobType::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShareDisabled(_)));

    assert!(h.orchestrator.list_jobs().await.is_empty());
    assert_eq!(h.simulator.mount_count(), 0);
    assert_eq!(h.engine.calls(), 0);
}

#[tokio::test]
async fn test_unknown_device_and_share() {
    let h = harness(vec![device("nas", &["photos"])]).await;

    let err = h
        .orchestrator
        .start_device_backup("printer", JobType::Manual)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h
        .orchestrator
        .start_share_backup("nas", "music", JobType::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShareNotFound(_)));
}

#[tokio::test]
async fn test_second_backup_of_same_share_conflicts() {
    let h = harness(vec![device("nas", &["photos"])]).await;
    h.engine.hold(true);

    let first = h
        .orchestrator
        .start_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();
    assert_eq!(first.status, JobStatus::Running);

    let err = h
        .orchestrator
        .start_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap_err();
    match err {
        Error::JobConflict { running_job, .. } => assert_eq!(running_job, first.id),
        other => panic!("expected conflict, got {:?}", other),
    }

    h.orchestrator.cancel_job(&first.id).await.unwrap();
    wait_terminal(&h.orchestrator, &first.id).await;
    h.engine.hold(false);

    // The claim is released once the first job has unwound
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let second = loop {
        match h
            .orchestrator
            .start_share_backup("nas", "photos", JobType::Manual)
            .await
        {
            Ok(job) => break job,
            Err(Error::JobConflict { .. }) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    };
    let second = wait_terminal(&h.orchestrator, &second.id).await;
    assert_eq!(second.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_cancel_running_job_unmounts_once() {
    let h = harness(vec![device("nas", &["photos"])]).await;
    h.engine.hold(true);
    let mut events = h.orchestrator.subscribe();

    let job = h
        .orchestrator
        .start_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();
    wait_for(&h.orchestrator, &job.id, |j| j.percent_done >= 50.0).await;

    let cancelled = h.orchestrator.cancel_job(&job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let terminal = terminal_event(&mut events, &job.id, Duration::from_secs(5)).await;
    assert!(matches!(terminal, JobEvent::Cancelled { .. }));

    let finished = h.orchestrator.get_job_status(&job.id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Cancelled);
    assert!(finished.completed_at.is_some());
    assert_eq!(h.simulator.mount_count(), 1);
    assert_eq!(h.simulator.unmount_count(), 1);

    let err = h.orchestrator.cancel_job(&job.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_cancel_unknown_job() {
    let h = harness(vec![device("nas", &["photos"])]).await;
    let err = h.orchestrator.cancel_job("missing").await.unwrap_err();
    assert!(matches!(err, Error::JobNotFound(_)));
}

#[tokio::test]
async fn test_mount_failure_fails_job() {
    let h = harness(vec![device("nas", &["photos"])]).await;
    h.simulator.fail_mount("photos");

    let job = h
        .orchestrator
        .execute_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("refused"));
    assert_eq!(h.engine.calls(), 0);
    assert_eq!(h.simulator.unmount_count(), 0);
}

#[tokio::test]
async fn test_partial_result() {
    let engine = ScriptedEngine::returning(BackupResult {
        outcome: BackupOutcome::Partial,
        files_new: 3,
        files_changed: 0,
        files_unmodified: 7,
        bytes_added: 10,
        bytes_processed: 20,
        snapshot_id: Some("abcd1234".into()),
        message: Some("2 files could not be read".into()),
    });
    let h = harness_with(vec![device("nas", &["photos"])], engine, |_| {}).await;

    let job = h
        .orchestrator
        .execute_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::PartiallyCompleted);
    assert_eq!(job.files_processed, 10);
    assert_eq!(job.snapshot_id.as_deref(), Some("abcd1234"));
}

#[tokio::test]
async fn test_retry_failed_job() {
    let engine = ScriptedEngine::returning(BackupResult::failed("repository locked"));
    let h = harness_with(vec![device("nas", &["photos"])], engine, |_| {}).await;

    let failed = h
        .orchestrator
        .execute_share_backup("nas", "photos", JobType::Scheduled)
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("repository locked"));

    h.engine.set_result(common::success(2, 0, 8));
    let retry = h.orchestrator.retry_failed_job(&failed.id).await.unwrap();

    assert_ne!(retry.id, failed.id);
    assert_eq!(retry.job_type, JobType::Retry);
    assert_eq!(retry.status, JobStatus::Pending);
    assert_eq!(retry.retry_attempt, failed.retry_attempt + 1);
    assert_eq!(retry.retry_of.as_deref(), Some(failed.id.as_str()));
    assert!(retry.next_retry_at.unwrap() > failed.completed_at.unwrap());

    let err = h.orchestrator.retry_failed_job(&failed.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    let done = wait_terminal(&h.orchestrator, &retry.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.started_at.unwrap() >= retry.next_retry_at.unwrap());

    // Still refused once the retry has finished
    let err = h.orchestrator.retry_failed_job(&failed.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    let retries = h
        .orchestrator
        .list_jobs()
        .await
        .into_iter()
        .filter(|j| j.job_type == JobType::Retry)
        .count();
    assert_eq!(retries, 1);
}

#[tokio::test]
async fn test_retry_rejects_completed_and_exhausted_jobs() {
    let h = harness_with(
        vec![device("nas", &["photos"])],
        ScriptedEngine::succeeding(1, 0, 0),
        |config| config.retry.max_attempts = 0,
    )
    .await;

    let done = h
        .orchestrator
        .execute_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();
    let err = h.orchestrator.retry_failed_job(&done.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    h.engine.set_result(BackupResult::failed("boom"));
    let failed = h
        .orchestrator
        .execute_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();
    let err = h.orchestrator.retry_failed_job(&failed.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_wake_before_backup() {
    let mut nas = device("nas", &["photos"]);
    nas.wake_on_lan = true;
    nas.mac_address = Some("00:11:22:33:44:55".into());
    let h = harness(vec![nas]).await;

    let job = h
        .orchestrator
        .execute_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(h.simulator.wake_count(), 1);
}

#[tokio::test]
async fn test_no_new_jobs_after_shutdown() {
    let h = harness(vec![device("nas", &["photos"])]).await;
    h.orchestrator.shutdown(Duration::from_millis(100)).await;

    let err = h
        .orchestrator
        .start_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_shutdown_cancels_stragglers() {
    let h = harness(vec![device("nas", &["photos"])]).await;
    h.engine.hold(true);

    let job = h
        .orchestrator
        .start_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();
    h.orchestrator.shutdown(Duration::from_millis(200)).await;

    let finished = h.orchestrator.get_job_status(&job.id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Cancelled);
    assert_eq!(h.simulator.unmount_count(), h.simulator.mount_count());
}

#[tokio::test]
async fn test_unreachable_device_is_still_attempted() {
    let mut nas = device("nas", &["photos"]);
    nas.wake_on_lan = true;
    nas.mac_address = Some("00:11:22:33:44:55".into());
    let h = harness(vec![nas]).await;
    h.simulator.set_reachable(false);

    let job = h
        .orchestrator
        .execute_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();

    assert_eq!(h.simulator.wake_count(), 1);
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_list_jobs_by_device_and_status() {
    let h = harness(vec![device("nas", &["photos"]), device("laptop", &["home"])]).await;

    h.orchestrator
        .execute_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();
    h.engine.hold(true);
    let running = h
        .orchestrator
        .start_share_backup("laptop", "home", JobType::Manual)
        .await
        .unwrap();
    wait_for(&h.orchestrator, &running.id, |job| job.status == JobStatus::Running).await;

    let nas_jobs = h.orchestrator.list_jobs_for_device("nas").await;
    assert_eq!(nas_jobs.len(), 1);
    assert_eq!(nas_jobs[0].device_id, "nas");

    let active = h.orchestrator.list_jobs_by_status(JobStatus::Running).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, running.id);
    assert_eq!(h.orchestrator.list_jobs().await.len(), 2);

    h.orchestrator.cancel_job(&running.id).await.unwrap();
}

#[tokio::test]
async fn test_cancel_while_waiting_for_worker() {
    let h = harness_with(
        vec![device("nas", &["photos", "docs"])],
        ScriptedEngine::succeeding(1, 0, 0),
        |config| config.max_concurrent_backups = 1,
    )
    .await;
    h.engine.hold(true);
    let mut events = h.orchestrator.subscribe();

    let busy = h
        .orchestrator
        .start_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();
    wait_for(&h.orchestrator, &busy.id, |j| j.percent_done >= 50.0).await;

    let queued = h
        .orchestrator
        .start_share_backup("nas", "docs", JobType::Manual)
        .await
        .unwrap();
    h.orchestrator.cancel_job(&queued.id).await.unwrap();

    let event = terminal_event(&mut events, &queued.id, Duration::from_secs(1)).await;
    assert!(matches!(event, JobEvent::Cancelled { .. }));
    assert_eq!(h.engine.calls(), 1);
    assert_eq!(h.simulator.mount_count(), 1);

    h.orchestrator.cancel_job(&busy.id).await.unwrap();
    terminal_event(&mut events, &busy.id, Duration::from_secs(5)).await;
    assert_eq!(h.simulator.unmount_count(), h.simulator.mount_count());
}

#[tokio::test]
async fn test_cancel_during_wake_wait() {
    let mut nas = device("nas", &["photos"]);
    nas.wake_on_lan = true;
    nas.mac_address = Some("00:11:22:33:44:55".into());
    let h = harness_with(vec![nas], ScriptedEngine::succeeding(1, 0, 0), |config| {
        config.wake.wait_timeout_secs = 60;
    })
    .await;
    h.simulator.set_reachable(false);
    let mut events = h.orchestrator.subscribe();

    let job = h
        .orchestrator
        .start_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.simulator.wake_count() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "wake never sent");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.orchestrator.cancel_job(&job.id).await.unwrap();

    let event = terminal_event(&mut events, &job.id, Duration::from_secs(2)).await;
    assert!(matches!(event, JobEvent::Cancelled { .. }));
    assert_eq!(h.simulator.mount_count(), 0);
    assert_eq!(h.engine.calls(), 0);
}

#[tokio::test]
async fn test_cancel_during_slow_mount() {
    let h = harness(vec![device("nas", &["photos"])]).await;
    h.simulator.set_mount_delay(Duration::from_secs(3));
    let mut events = h.orchestrator.subscribe();

    let job = h
        .orchestrator
        .start_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.orchestrator.cancel_job(&job.id).await.unwrap();

    let event = terminal_event(&mut events, &job.id, Duration::from_secs(1)).await;
    assert!(matches!(event, JobEvent::Cancelled { .. }));
    assert_eq!(h.simulator.mount_count(), 0);
    assert_eq!(h.simulator.unmount_count(), 0);
    assert_eq!(h.engine.calls(), 0);

    // The target is free again and the abandoned mount left no stale slot
    h.simulator.set_mount_delay(Duration::ZERO);
    let next = h
        .orchestrator
        .execute_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();
    assert_eq!(next.status, JobStatus::Completed);
    assert_eq!(h.simulator.mount_count(), 1);
    assert_eq!(h.simulator.unmount_count(), 1);
}

#[tokio::test]
async fn test_shutdown_waits_for_notifications() {
    let h = harness(vec![device("nas", &["photos"])]).await;
    h.notifier.set_delay(Duration::from_millis(300));

    let job = h
        .orchestrator
        .execute_share_backup("nas", "photos", JobType::Manual)
        .await
        .unwrap();
    h.orchestrator.shutdown(Duration::from_secs(1)).await;

    let sent = h.notifier.events();
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], JobEvent::Completed { job_id, .. } if *job_id == job.id));
}
