use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::{PluginSettings, run_command};
use crate::core::credentials::reveal_password;
use crate::core::models::{Device, ProtocolType, Share};
use crate::core::protocol::{MountKey, MountTable, ProtocolPlugin, mount_point, probe_tcp};
use crate::core::wake;
use crate::error::{Error, Result};

/// SSH/SFTP shares mounted read-only through `sshfs`.
pub struct SftpPlugin {
    settings: PluginSettings,
    mounts: MountTable,
}

impl SftpPlugin {
    pub fn new(settings: PluginSettings) -> Self {
        Self {
            settings,
            mounts: MountTable::new(),
        }
    }

    fn mount_args(device: &Device, share: &Share, target: &Path, with_password: bool) -> Vec<String> {
        let remote = match &device.credentials {
            Some(creds) => format!("{}@{}:{}", creds.username, device.host, share.path),
            None => format!("{}:{}", device.host, share.path),
        };

        let mut options = vec![
            "ro".to_string(),
            format!("port={}", device.port()),
            "reconnect".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if with_password {
            options.push("password_stdin".to_string());
        }

        vec![
            remote,
            target.display().to_string(),
            "-o".to_string(),
            options.join(","),
        ]
    }
}

#[async_trait]
impl ProtocolPlugin for SftpPlugin {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Ssh
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
                let mut cmd = Command::new("sshfs");
                cmd.args(Self::mount_args(device, share, &target, password.is_some()));

                run_command(cmd, password, self.settings.command_timeout)
                    .await
                    .map_err(Error::MountFailed)?;

                info!(
                    device_id = %device.id,
                    share = %share.path,
                    path = %target.display(),
                    "SFTP share mounted"
                );
                Ok(target.clone())
            })
            .await
    }

    async fn unmount_share(&self, local_path: &Path) -> Result<()> {
        self.mounts
            .release(local_path, || async {
                let mut cmd = Command::new("fusermount");
                cmd.arg("-u").arg(local_path);
                run_command(cmd, None, self.settings.command_timeout)
                    .await
                    .map_err(Error::UnmountFailed)
            })
            .await
    }

    async fn wake_device(&self, device: &Device) -> Result<()> {
        wake::wake_device(device, self.settings.wake_broadcast).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::credentials::Credentials;

    fn device(credentials: Option<Credentials>) -> Device {
        Device {
            id: "pi".into(),
            name: "Raspberry Pi".into(),
            protocol: ProtocolType::Ssh,
            host: "pi.lan".into(),
            port: Some(2222),
            credentials,
            wake_on_lan: false,
            mac_address: None,
            schedule: None,
            retention: None,
            filters: None,
            shares: Vec::new(),
        }
    }

    fn share() -> Share {
        Share {
            id: "home".into(),
            device_id: "pi".into(),
            path: "/home/pi".into(),
            enabled: true,
            schedule: None,
            retention: None,
            filters: None,
        }
    }

    #[test]
    fn test_mount_args_with_password() {
        let creds = Credentials {
            username: "pi".into(),
            domain: None,
            secret: None,
        };
        let args = SftpPlugin::mount_args(&device(Some(creds)), &share(), Path::new("/mnt/pi/home"), true);

        assert_eq!(args[0], "pi@pi.lan:/home/pi");
        assert_eq!(args[1], "/mnt/pi/home");
        assert!(args[3].contains("port=2222"));
        assert!(args[3].ends_with("password_stdin"));
    }

    #[test]
    fn test_mount_args_key_auth() {
        let args = SftpPlugin::mount_args(&device(None), &share(), Path::new("/mnt/pi/home"), false);

        assert_eq!(args[0], "pi.lan:/home/pi");
        assert!(!args[3].contains("password_stdin"));
    }
}
