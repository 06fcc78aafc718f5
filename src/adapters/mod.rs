//! Protocol plugin implementations.

mod rsync;
mod sftp;
mod simulated;
mod smb;

pub use rsync::RsyncPlugin;
pub use sftp::SftpPlugin;
pub use simulated::{SimulatedPlugin, Simulator};
pub use smb::SmbPlugin;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::AppConfig;
use crate::core::credentials::SecretResolver;
use crate::core::models::ProtocolType;
use crate::core::protocol::PluginRegistry;

/// Settings shared by every plugin.
#[derive(Clone)]
pub struct PluginSettings {
    pub mount_root: PathBuf,
    pub connect_timeout: Duration,
    /// Upper bound for mount/unmount helper commands. `None` waits forever.
    pub command_timeout: Option<Duration>,
    pub wake_broadcast: IpAddr,
    pub secrets: Arc<dyn SecretResolver>,
}

impl PluginSettings {
    pub fn from_config(config: &AppConfig, secrets: Arc<dyn SecretResolver>) -> Self {
        Self {
            mount_root: config.mount_root.clone(),
            connect_timeout: Duration::from_secs(config.protocols.connect_timeout_secs),
            command_timeout: config
                .protocols
                .command_timeout_secs
                .map(Duration::from_secs),
            wake_broadcast: config.wake.broadcast_address,
            secrets,
        }
    }
}

/// Build the registry for the configured mode.
///
/// In simulation mode every protocol is served by a simulated plugin that
/// never touches the network.
pub fn build_registry(config: &AppConfig, secrets: Arc<dyn SecretResolver>) -> PluginRegistry {
    let settings = PluginSettings::from_config(config, secrets);
    let mut registry = PluginRegistry::new();

    if config.simulation {
        let simulator = Simulator::default();
        for protocol in ProtocolType::all() {
            registry.register(Arc::new(SimulatedPlugin::with_simulator(
                protocol,
                settings.mount_root.clone(),
                &simulator,
            )));
        }
        return registry;
    }

    registry.register(Arc::new(SmbPlugin::new(settings.clone())));
    registry.register(Arc::new(SftpPlugin::new(settings.clone())));
    registry.register(Arc::new(RsyncPlugin::new(settings)));
    registry
}

/// Run a helper command to completion, returning stderr on failure.
async fn run_command(
    mut cmd: Command,
    stdin: Option<String>,
    timeout: Option<Duration>,
) -> Result<(), String> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::null())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let program = cmd.as_std().get_program().to_string_lossy().to_string();
    debug!(program = %program, "Running helper command");

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {}", program, e))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|e| format!("failed to write to {}: {}", program, e))?;
        pipe.write_all(b"\n")
            .await
            .map_err(|e| format!("failed to write to {}: {}", program, e))?;
    }

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| format!("{} timed out after {}s", program, limit.as_secs()))?,
        None => child.wait_with_output().await,
    }
    .map_err(|e| format!("failed to wait for {}: {}", program, e))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(format!("{} exited with {}: {}", program, output.status, stderr.trim()))
    }
}
