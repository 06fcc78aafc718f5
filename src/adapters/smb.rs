use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::{MntFlags, umount2};
use tokio::process::Command;
use tracing::{debug, info};

use super::{PluginSettings, run_command};
use crate::core::credentials::reveal_password;
use crate::core::models::{Device, ProtocolType, Share};
use crate::core::protocol::{MountKey, MountTable, ProtocolPlugin, mount_point, probe_tcp};
use crate::core::wake;
use crate::error::{Error, Result};

/// SMB/CIFS shares mounted read-only through `mount.cifs`.
pub struct SmbPlugin {
    settings: PluginSettings,
    mounts: MountTable,
}

impl SmbPlugin {
    pub fn new(settings: PluginSettings) -> Self {
        Self {
            settings,
            mounts: MountTable::new(),
        }
    }

    /// Arguments for `mount`. The password travels in the `PASSWD` environment
    /// variable so it never shows up in the process list.
    fn mount_args(device: &Device, share: &Share, target: &Path) -> Vec<String> {
        let mut options = vec!["ro".to_string(), format!("port={}", device.port())];
        match &device.credentials {
            Some(creds) => {
                options.push(format!("username={}", creds.username));
                if let Some(domain) = &creds.domain {
                    options.push(format!("domain={}", domain));
                }
            }
            None => options.push("guest".to_string()),
        }

        vec![
            "-t".to_string(),
            "cifs".to_string(),
            format!("//{}/{}", device.host, share.path.trim_start_matches('/')),
            target.display().to_string(),
            "-o".to_string(),
            options.join(","),
        ]
    }
}

#[async_trait]
impl ProtocolPlugin for SmbPlugin {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Smb
    }

    fn supports_wake(&self) -> bool {
        true
    }

    fn requires_auth(&self) -> bool {
        true
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
                let mut cmd = Command::new("mount");
                cmd.args(Self::mount_args(device, share, &target));
                if let Some(password) = password {
                    cmd.env("PASSWD", password);
                }

                run_command(cmd, None, self.settings.command_timeout)
                    .await
                    .map_err(Error::MountFailed)?;

                info!(
                    device_id = %device.id,
                    share = %share.path,
                    path = %target.display(),
                    "SMB share mounted"
                );
                Ok(target.clone())
            })
            .await
    }

    async fn unmount_share(&self, local_path: &Path) -> Result<()> {
        self.mounts
            .release(local_path, || async {
                let path = local_path.to_path_buf();
                let result = tokio::task::spawn_blocking(move || umount2(&path, MntFlags::MNT_DETACH))
                    .await
                    .map_err(|e| Error::UnmountFailed(e.to_string()))?;

                match result {
                    Ok(()) => Ok(()),
                    Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
                        debug!(path = %local_path.display(), "Path was not mounted");
                        Ok(())
                    }
                    Err(e) => Err(Error::UnmountFailed(format!(
                        "{}: {}",
                        local_path.display(),
                        e
                    ))),
                }
            })
            .await
    }

    async fn wake_device(&self, device: &Device) -> Result<()> {
        wake::wake_device(device, self.settings.wake_broadcast).await
    }
}
