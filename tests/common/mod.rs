#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netbksd::adapters::{SimulatedPlugin, Simulator};
use netbksd::config::AppConfig;
use netbksd::context::AppContext;
use netbksd::core::backup_engine::{
    BackupEngine, BackupOutcome, BackupRequest, BackupResult, EngineEvent,
};
use async_trait::async_trait;
use netbksd::core::notifications::{JobEvent, NotificationChannel};
use netbksd::core::{
    BackupJob, Device, Orchestrator, PluginRegistry, ProtocolType, StaticInventory, Share,
};
use netbksd::db;
use netbksd::error::{Error, Result};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub fn share(id: &str) -> Share {
    Share {
        id: id.to_string(),
        device_id: String::new(),
        path: format!("/{}", id),
        enabled: true,
        schedule: None,
        retention: None,
        filters: None,
    }
}

pub fn device(id: &str, shares: &[&str]) -> Device {
    Device {
        id: id.to_string(),
        name: format!("{} (test)", id),
        protocol: ProtocolType::Smb,
        host: "10.0.0.5".to_string(),
        port: None,
        credentials: None,
        wake_on_lan: false,
        mac_address: None,
        schedule: None,
        retention: None,
        filters: None,
        shares: shares.iter().map(|s| share(s)).collect(),
    }
}

pub fn test_config(root: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.repository = root.join("repository");
    config.mount_root = root.join("mounts");
    config.database_path = root.join("netbksd.db");
    config.max_concurrent_backups = 4;
    config.retry.base_delay_secs = 1;
    config.retry.max_delay_secs = 1;
    config.retry.max_attempts = 2;
    config.wake.wait_timeout_secs = 0;
    config.wake.poll_interval_secs = 1;
    config
}

pub fn success(files_new: u64, files_changed: u64, files_unmodified: u64) -> BackupResult {
    BackupResult {
        outcome: BackupOutcome::Success,
        files_new,
        files_changed,
        files_unmodified,
        bytes_added: 4096,
        bytes_processed: 8192,
        snapshot_id: Some("1f2e3d4c".to_string()),
        message: None,
    }
}

struct ScriptState {
    result: Mutex<BackupResult>,
    hold: AtomicBool,
    calls: AtomicUsize,
    requests: Mutex<Vec<BackupRequest>>,
}

/// Engine whose result is set by the test. When holding, it runs until
/// cancelled.
#[derive(Clone)]
pub struct ScriptedEngine {
    state: Arc<ScriptState>,
}

impl ScriptedEngine {
    pub fn returning(result: BackupResult) -> Self {
        Self {
            state: Arc::new(ScriptState {
                result: Mutex::new(result),
                hold: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn succeeding(files_new: u64, files_changed: u64, files_unmodified: u64) -> Self {
        Self::returning(success(files_new, files_changed, files_unmodified))
    }

    pub fn set_result(&self, result: BackupResult) {
        *self.state.result.lock().unwrap() = result;
    }

    pub fn hold(&self, hold: bool) {
        self.state.hold.store(hold, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<BackupRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl BackupEngine for ScriptedEngine {
    fn create_backup(
        &self,
        req: &BackupRequest,
        tx: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<BackupResult>> + Send>> {
        let state = self.state.clone();
        let req = req.clone();

        Box::pin(async move {
            state.calls.fetch_add(1, Ordering::SeqCst);
            state.requests.lock().unwrap().push(req);

            let _ = tx
                .send(EngineEvent::Progress {
                    percent: 50.0,
                    current_file: Some("docs/report.pdf".to_string()),
                    files_done: 1,
                    bytes_done: 1024,
                    total_files: 2,
                    total_bytes: 2048,
                })
                .await;

            if state.hold.load(Ordering::SeqCst) {
                cancel.cancelled().await;
                return Err(Error::Cancelled);
            }

            let result = state.result.lock().unwrap().clone();
            Ok(result)
        })
    }
}

/// Notifier that keeps what it was sent, optionally after a delay.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    delay_ms: Arc<AtomicU64>,
    events: Arc<Mutex<Vec<JobEvent>>>,
}

impl RecordingNotifier {
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingNotifier {
    async fn notify(&self, event: JobEvent) -> anyhow::Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub engine: ScriptedEngine,
    pub simulator: Simulator,
    pub notifier: RecordingNotifier,
    pub config: AppConfig,
    _dir: TempDir,
}

pub async fn harness(devices: Vec<Device>) -> Harness {
    harness_with(devices, ScriptedEngine::succeeding(10, 5, 100), |_| {}).await
}

pub async fn harness_with(
    devices: Vec<Device>,
    engine: ScriptedEngine,
    configure: impl FnOnce(&mut AppConfig),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    configure(&mut config);

    let simulator = Simulator::default();
    let mut plugins = PluginRegistry::new();
    for protocol in ProtocolType::all() {
        plugins.register(Arc::new(SimulatedPlugin::with_simulator(
            protocol,
            config.mount_root.clone(),
            &simulator,
        )));
    }

    let notifier = RecordingNotifier::default();
    let db_conn = db::init_in_memory().await.unwrap();
    let ctx = AppContext::new(config.clone(), db_conn);
    let orchestrator = Orchestrator::new(
        ctx,
        Arc::new(StaticInventory::new(devices)),
        plugins,
        Arc::new(engine.clone()),
        Some(Arc::new(notifier.clone())),
    );

    Harness {
        orchestrator,
        engine,
        simulator,
        notifier,
        config,
        _dir: dir,
    }
}

/// Poll until the job satisfies `done`, panicking after five seconds.
pub async fn wait_for(
    orchestrator: &Orchestrator,
    job_id: &str,
    done: impl Fn(&BackupJob) -> bool,
) -> BackupJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = orchestrator.get_job_status(job_id).await.unwrap();
        if done(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {} (status {})",
            job_id,
            job.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_terminal(orchestrator: &Orchestrator, job_id: &str) -> BackupJob {
    wait_for(orchestrator, job_id, |job| job.status.is_terminal()).await
}
