use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{PluginSettings, run_command};
use crate::core::credentials::reveal_password;
use crate::core::models::{Device, ProtocolType, Share};
use crate::core::protocol::{MountKey, MountTable, ProtocolPlugin, mount_point, probe_tcp};
use crate::core::wake;
use crate::error::{Error, Result};

/// Rsync daemon modules.
///
/// Rsync has no mount, so "mounting" pulls the module into a local staging
/// directory. The staging copy is kept on unmount so the next pull only
/// transfers what changed.
pub struct RsyncPlugin {
    settings: PluginSettings,
    mounts: MountTable,
}

impl RsyncPlugin {
    pub fn new(settings: PluginSettings) -> Self {
        Self {
            settings,
            mounts: MountTable::new(),
        }
    }

    fn source_url(device: &Device, share: &Share) -> String {
        let user = device
            .credentials
            .as_ref()
            .map(|c| format!("{}@", c.username))
            .unwrap_or_default();
        format!(
            "rsync://{}{}:{}/{}/",
            user,
            device.host,
            device.port(),
            share.path.trim_matches('/')
        )
    }

    fn pull_args(device: &Device, share: &Share, target: &Path) -> Vec<String> {
        vec![
            "-a".to_string(),
            "--delete".to_string(),
            "--partial".to_string(),
            Self::source_url(device, share),
            format!("{}/", target.display()),
        ]
    }
}

#[async_trait]
impl ProtocolPlugin for RsyncPlugin {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Rsync
    }

    fn supports_wake(&self) -> bool {
        true
    }

    fn requires_auth(&self) -> bool {
        false
    }

    async fn test_connection(&self, device: &Device) -> bool {
        probe_tcp(&device.host, device.port(), self.settings.connect_timeout).await
    }

    async fn mount_share(&self, device: &Device, share: &Share) -> Result<PathBuf> {
        let key = MountKey::new(device, share);
        let target = mount_point(&self.settings.mount_root, &key);

        self.mounts
            .acquire(key, || async {
                tokio::fs::create_dir_all(&target).await?;

                let password = reveal_password(&self.settings.secrets, device.credentials.as_ref())?;
                let mut cmd = Command::new("rsync");
                cmd.args(Self::pull_args(device, share, &target));
                if let Some(password) = password {
                    cmd.env("RSYNC_PASSWORD", password);
                }

                // Pulls can take as long as a backup, so no command timeout here.
                // A cancelled job drops this future, which kills rsync.
                run_command(cmd, None, None)
                    .await
                    .map_err(Error::MountFailed)?;

                info!(
                    device_id = %device.id,
                    module = %share.path,
                    path = %target.display(),
                    "Rsync module staged"
                );
                Ok(target.clone())
            })
            .await
    }

    async fn unmount_share(&self, local_path: &Path) -> Result<()> {
        self.mounts
            .release(local_path, || async {
                debug!(path = %local_path.display(), "Keeping rsync staging directory");
                Ok(())
            })
            .await
    }

    async fn wake_device(&self, device: &Device) -> Result<()> {
        wake::wake_device(device, self.settings.wake_broadcast).await
    }
}
