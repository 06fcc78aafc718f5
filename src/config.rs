use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::filters::FilterRules;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/netbksd/config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Restic,
    Simulated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Slack,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub channel: NotificationChannelType,
    pub slack_webhook: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub connect_timeout_secs: u64,
    /// Limit for mount/unmount helpers. Unset means no limit.
    pub command_timeout_secs: Option<u64>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            command_timeout_secs: Some(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 60,
            max_delay_secs: 3600,
            max_attempts: 3,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry attempt `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let secs = self
            .base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeConfig {
    pub broadcast_address: IpAddr,
    /// How long to wait for a woken device to answer.
    pub wait_timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            wait_timeout_secs: 120,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub repository: PathBuf,
    pub repository_password_file: Option<PathBuf>,
    pub mount_root: PathBuf,
    pub database_path: PathBuf,
    pub inventory_path: PathBuf,
    pub engine: EngineType,
    pub restic_binary: String,
    pub max_concurrent_backups: usize,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub shutdown_timeout_secs: u64,
    pub protocols: ProtocolConfig,
    pub retry: RetryConfig,
    pub wake: WakeConfig,
    pub scheduler: SchedulerConfig,
    pub notifications: NotificationConfig,
    /// Rules for shares and devices that define none.
    pub default_filters: FilterRules,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            repository: PathBuf::from("/var/lib/netbksd/repository"),
            repository_password_file: None,
            mount_root: PathBuf::from("/var/lib/netbksd/mounts"),
            database_path: PathBuf::from("/var/lib/netbksd/netbksd.db"),
            inventory_path: PathBuf::from("/etc/netbksd/devices.toml"),
            engine: EngineType::Restic,
            restic_binary: "restic".to_string(),
            max_concurrent_backups: 2,
            simulation: false,
            verbose: false,
            json_logs: false,
            shutdown_timeout_secs: 30,
            protocols: ProtocolConfig::default(),
            retry: RetryConfig::default(),
            wake: WakeConfig::default(),
            scheduler: SchedulerConfig::default(),
            notifications: NotificationConfig::default(),
            default_filters: FilterRules::default(),
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `NETBKSD_*` variables and CLI overrides.
    ///
    /// A missing file at the default location is fine; an explicit path must exist.
    pub fn new<T: Serialize>(config_path: Option<&Path>, cli_args: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        match config_path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("config file not found: {}", path.display());
                }
                figment = figment.merge(Toml::file(path));
            }
            None => figment = figment.merge(Toml::file(DEFAULT_CONFIG_PATH)),
        }

        figment = figment.merge(Env::prefixed("NETBKSD_").split("__"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        let config: AppConfig = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent_backups == 0 {
            anyhow::bail!("max_concurrent_backups must be at least 1");
        }
        if self.retry.base_delay_secs == 0 {
            anyhow::bail!("retry.base_delay_secs must be at least 1");
        }
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            anyhow::bail!(
                "retry.max_delay_secs ({}) must not be below retry.base_delay_secs ({})",
                self.retry.max_delay_secs,
                self.retry.base_delay_secs
            );
        }
        self.default_filters
            .validate()
            .context("Invalid default_filters")?;
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
