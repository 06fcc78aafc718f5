//! Read-only source of device and share definitions.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use figment::{
    Figment,
    providers::{Format, Toml},
};
use serde::Deserialize;

use crate::core::models::Device;
use crate::error::{Error, Result};

#[async_trait]
pub trait Inventory: Send + Sync {
    async fn get_device(&self, device_id: &str) -> Result<Device>;

    async fn list_devices(&self) -> Result<Vec<Device>>;
}

#[derive(Deserialize)]
struct InventoryFile {
    #[serde(default)]
    devices: Vec<Device>,
}

/// Fixed device list, usually loaded once from a TOML file.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    devices: BTreeMap<String, Device>,
}

impl StaticInventory {
    pub fn new(devices: Vec<Device>) -> Self {
        let devices = devices
            .into_iter()
            .map(|mut device| {
                for share in &mut device.shares {
                    share.device_id = device.id.clone();
                }
                (device.id.clone(), device)
            })
            .collect();
        Self { devices }
    }

    /// Load `[[devices]]` tables, each with nested `[[devices.shares]]`.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let file: InventoryFile = Figment::from(Toml::file(path))
            .extract()
            .with_context(|| format!("Failed to load inventory from {}", path.display()))?;

        for device in &file.devices {
            validate_device(device)
                .with_context(|| format!("Invalid device '{}' in inventory", device.id))?;
        }

        Ok(Self::new(file.devices))
    }
}

fn validate_device(device: &Device) -> Result<()> {
    if let Some(schedule) = &device.schedule {
        schedule.validate_window()?;
    }
    if let Some(filters) = &device.filters {
        filters.validate()?;
    }
    for share in &device.shares {
        if let Some(schedule) = &share.schedule {
            schedule.validate_window()?;
        }
        if let Some(filters) = &share.filters {
            filters.validate()?;
        }
    }
    Ok(())
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn get_device(&self, device_id: &str) -> Result<Device> {
        self.devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self.devices.values().cloned().collect())
    }
}
