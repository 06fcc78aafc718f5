use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::models::{Device, ProtocolType, Share};
use crate::error::{Error, Result};

/// Capability set every network-share protocol provides.
#[async_trait]
pub trait ProtocolPlugin: Send + Sync {
    fn protocol(&self) -> ProtocolType;

    fn supports_wake(&self) -> bool;

    fn requires_auth(&self) -> bool;

    /// Whether the device answers on its protocol port.
    async fn test_connection(&self, device: &Device) -> bool;

    /// Make the share available locally and return the local path.
    ///
    /// Mounting a share that is already mounted returns the existing path.
    async fn mount_share(&self, device: &Device, share: &Share) -> Result<PathBuf>;

    /// Release a path returned by `mount_share`. Unknown paths are ignored.
    async fn unmount_share(&self, local_path: &Path) -> Result<()>;

    async fn wake_device(&self, device: &Device) -> Result<()>;
}

/// Protocol type to plugin lookup.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<ProtocolType, Arc<dyn ProtocolPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin, replacing any previous plugin for the same protocol.
    pub fn register(&mut self, plugin: Arc<dyn ProtocolPlugin>) {
        debug!(protocol = %plugin.protocol(), "Registered protocol plugin");
        self.plugins.insert(plugin.protocol(), plugin);
    }

    pub fn get(&self, protocol: ProtocolType) -> Result<Arc<dyn ProtocolPlugin>> {
        self.plugins
            .get(&protocol)
            .cloned()
            .ok_or(Error::UnsupportedProtocol(protocol))
    }

    pub fn all(&self) -> Vec<Arc<dyn ProtocolPlugin>> {
        let mut plugins: Vec<_> = self.plugins.values().cloned().collect();
        plugins.sort_by_key(|p| p.protocol().as_str());
        plugins
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MountKey {
    pub device_id: String,
    pub share_id: String,
}

impl MountKey {
    pub fn new(device: &Device, share: &Share) -> Self {
        Self {
            device_id: device.id.clone(),
            share_id: share.id.clone(),
        }
    }
}

#[derive(Default)]
struct MountSlot {
    path: Option<PathBuf>,
    refs: usize,
}

#[derive(Default)]
struct MountIndex {
    slots: HashMap<MountKey, Arc<Mutex<MountSlot>>>,
    paths: HashMap<PathBuf, MountKey>,
}

/// Reference-counted record of active mounts, shared by a plugin's callers.
///
/// Concurrent mounts of the same key serialize on that key's slot, so only
/// one physical mount happens and every caller gets the same path. The
/// physical unmount runs when the last holder releases the path.
#[derive(Default)]
pub struct MountTable {
    index: Mutex<MountIndex>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire<F, Fut>(&self, key: MountKey, mount: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PathBuf>>,
    {
        let slot = {
            let mut index = self.index.lock().await;
            index.slots.entry(key.clone()).or_default().clone()
        };

        let mut slot = slot.lock().await;
        if let Some(path) = slot.path.clone() {
            slot.refs += 1;
            debug!(path = %path.display(), refs = slot.refs, "Reusing active mount");
            return Ok(path);
        }

        let path = mount().await?;
        slot.path = Some(path.clone());
        slot.refs = 1;

        self.index.lock().await.paths.insert(path.clone(), key);
        Ok(path)
    }

    /// Drop one reference to `path`, running `unmount` when it was the last.
    pub async fn release<F, Fut>(&self, path: &Path, unmount: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let slot = {
            let index = self.index.lock().await;
            index
                .paths
                .get(path)
                .and_then(|key| index.slots.get(key))
                .cloned()
        };

        let Some(slot) = slot else {
            debug!(path = %path.display(), "Unmount requested for a path that is not mounted");
            return Ok(());
        };

        let mut slot = slot.lock().await;
        if slot.path.as_deref() != Some(path) {
            debug!(path = %path.display(), "Mount already released");
            return Ok(());
        }

        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            debug!(path = %path.display(), refs = slot.refs, "Mount still in use");
            return Ok(());
        }

        // A failed unmount keeps the record, so the next acquire reuses the
        // live mount and the next release tries again.
        unmount().await?;
        slot.path = None;
        self.index.lock().await.paths.remove(path);
        info!(path = %path.display(), "Share unmounted");
        Ok(())
    }

    pub async fn is_mounted(&self, path: &Path) -> bool {
        self.index.lock().await.paths.contains_key(path)
    }

    pub async fn active(&self) -> Vec<(MountKey, PathBuf)> {
        let index = self.index.lock().await;
        index
            .paths
            .iter()
            .map(|(path, key)| (key.clone(), path.clone()))
            .collect()
    }
}

/// Local mount point for a share: `<root>/<device>/<share>`.
pub fn mount_point(root: &Path, key: &MountKey) -> PathBuf {
    root.join(path_segment(&key.device_id))
        .join(path_segment(&key.share_id))
}

/// Percent-encode everything outside `[A-Za-z0-9_-]`, so distinct ids never
/// share a directory and no id can escape the root.
fn path_segment(id: &str) -> String {
    let mut segment = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            segment.push(byte as char);
        } else {
            segment.push_str(&format!("%{:02X}", byte));
        }
    }
    segment
}

/// TCP reachability probe used by `test_connection`.
pub async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "Connection probe failed");
            false
        }
        Err(_) => {
            debug!(host, port, "Connection probe timed out");
            false
        }
    }
}
