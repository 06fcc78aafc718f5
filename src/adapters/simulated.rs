use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::core::models::{Device, ProtocolType, Share};
use crate::core::protocol::{MountKey, MountTable, ProtocolPlugin, mount_point};
use crate::core::wake;
use crate::error::{Error, Result};

struct SimulatorState {
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
    wakes: AtomicUsize,
    reachable: AtomicBool,
    mount_delay_ms: AtomicU64,
    failing_shares: Mutex<HashSet<String>>,
}

impl Default for SimulatorState {
    fn default() -> Self {
        Self {
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
            wakes: AtomicUsize::new(0),
            reachable: AtomicBool::new(true),
            mount_delay_ms: AtomicU64::new(0),
            failing_shares: Mutex::new(HashSet::new()),
        }
    }
}

/// Controller handle for simulated plugins: inject failures and inspect calls.
#[derive(Clone, Default)]
pub struct Simulator {
    state: Arc<SimulatorState>,
}

impl Simulator {
    /// Make every mount of `share_id` fail.
    pub fn fail_mount(&self, share_id: &str) {
        self.state
            .failing_shares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(share_id.to_string());
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_mount_delay(&self, delay: Duration) {
        self.state
            .mount_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn mount_count(&self) -> usize {
        self.state.mounts.load(Ordering::SeqCst)
    }

    pub fn unmount_count(&self) -> usize {
        self.state.unmounts.load(Ordering::SeqCst)
    }

    pub fn wake_count(&self) -> usize {
        self.state.wakes.load(Ordering::SeqCst)
    }

    fn mount_fails(&self, share_id: &str) -> bool {
        self.state
            .failing_shares
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(share_id)
    }
}

/// Plugin that "mounts" shares as local directories.
pub struct SimulatedPlugin {
    protocol: ProtocolType,
    root: PathBuf,
    mounts: MountTable,
    simulator: Simulator,
}

impl SimulatedPlugin {
    pub fn new(protocol: ProtocolType, root: PathBuf) -> (Self, Simulator) {
        let simulator = Simulator::default();
        let plugin = Self::with_simulator(protocol, root, &simulator);
        (plugin, simulator)
    }

    pub fn with_simulator(protocol: ProtocolType, root: PathBuf, simulator: &Simulator) -> Self {
        Self {
            protocol,
            root,
            mounts: MountTable::new(),
            simulator: simulator.clone(),
        }
    }
}

#[async_trait]
impl ProtocolPlugin for SimulatedPlugin {
    fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    fn supports_wake(&self) -> bool {
        true
    }

    fn requires_auth(&self) -> bool {
        false
    }

    async fn test_connection(&self, _device: &Device) -> bool {
        self.simulator.state.reachable.load(Ordering::SeqCst)
    }

    async fn mount_share(&self, device: &Device, share: &Share) -> Result<PathBuf> {
        let key = MountKey::new(device, share);
        let target = mount_point(&self.root, &key);

        self.mounts
            .acquire(key, || async {
                let delay = self.simulator.state.mount_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }

                if self.simulator.mount_fails(&share.id) {
                    return Err(Error::MountFailed(format!(
                        "(Simulated) //{}/{} refused the connection",
                        device.host, share.path
                    )));
                }

                tokio::fs::create_dir_all(&target).await?;
                self.simulator.state.mounts.fetch_add(1, Ordering::SeqCst);
                info!(path = %target.display(), "(Simulated) Share mounted");
                Ok(target.clone())
            })
            .await
    }

    async fn unmount_share(&self, local_path: &Path) -> Result<()> {
        self.mounts
            .release(local_path, || async {
                self.simulator.state.unmounts.fetch_add(1, Ordering::SeqCst);
                info!(path = %local_path.display(), "(Simulated) Share unmounted");
                Ok(())
            })
            .await
    }

    async fn wake_device(&self, device: &Device) -> Result<()> {
        if !device.wake_on_lan {
            return Ok(());
        }
        let mac = device
            .mac_address
            .as_deref()
            .ok_or_else(|| Error::MissingWakeAddress(device.id.clone()))?;
        wake::parse_mac(mac)?;

        self.simulator.state.wakes.fetch_add(1, Ordering::SeqCst);
        info!(device_id = %device.id, "(Simulated) Wake packet sent");
        Ok(())
    }
}
