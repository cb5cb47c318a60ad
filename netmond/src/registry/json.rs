use std::collections::HashMap;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use shared::types::{Device, DeviceState, OpenService};
use super::{MemoryRegistry, Registry};

/// Registry kept in a flat JSON file, rewritten on every change.
///
/// Also reads the older `known_devices.json` layout, where each entry only
/// carries `mac_address`, `ip_address` and `vendor` and every listed device
/// is known.
pub struct JsonRegistry {
    path: PathBuf,
    inner: MemoryRegistry,
}

/// On-disk record; everything but the address is optional for older files
#[derive(Debug, Deserialize)]
struct StoredDevice {
    #[serde(alias = "mac_address")]
    hardware_address: String,
    #[serde(default, alias = "ip_address")]
    network_address: Option<String>,
    #[serde(default)]
    vendor: String,
    #[serde(default = "default_known")]
    known: bool,
    #[serde(default = "default_state")]
    state: DeviceState,
    #[serde(default)]
    first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    open_services: Vec<OpenService>,
}

fn default_known() -> bool {
    true
}

fn default_state() -> DeviceState {
    DeviceState::Down
}

impl StoredDevice {
    fn into_device(self, loaded_at: DateTime<Utc>) -> Device {
        let first_seen = self.first_seen.unwrap_or(loaded_at);
        let last_seen = self.last_seen.unwrap_or(first_seen).max(first_seen);
        let network_address = self
            .network_address
            .filter(|a| !a.trim().is_empty() && !a.eq_ignore_ascii_case("unknown"));

        Device {
            hardware_address: self.hardware_address,
            network_address,
            vendor: self.vendor,
            known: self.known,
            state: self.state,
            first_seen,
            last_seen,
            open_services: self.open_services,
        }
    }
}

impl JsonRegistry {
    /// Open the registry file, starting empty if it does not exist yet
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let inner = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read registry file: {}", path.display()))?;
            let stored: Vec<StoredDevice> = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse registry file: {}", path.display()))?;

            let now = Utc::now();
            let registry = MemoryRegistry::with_devices(stored.into_iter().map(|s| s.into_device(now)));
            tracing::info!("Loaded {} devices from {}", registry.devices().count(), path.display());
            registry
        } else {
            tracing::warn!("No registry file found at {}, starting empty", path.display());
            MemoryRegistry::default()
        };

        Ok(Self { path, inner })
    }

    /// Write the whole registry through a temporary file and rename
    fn save(&self, registry: &MemoryRegistry) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let mut devices: Vec<&Device> = registry.devices().collect();
        devices.sort_by(|a, b| a.hardware_address.cmp(&b.hardware_address));

        let json = serde_json::to_string_pretty(&devices).context("Failed to serialize registry")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(())
    }

    /// Apply a change to a copy, and keep it only once the file is written.
    /// A failed save leaves memory matching what is on disk.
    fn commit<T>(&mut self, change: impl FnOnce(&mut MemoryRegistry) -> Result<T>) -> Result<T> {
        let mut staged = self.inner.clone();
        let result = change(&mut staged)?;
        self.save(&staged)?;
        self.inner = staged;
        Ok(result)
    }
}

impl Registry for JsonRegistry {
    fn load_all(&self) -> Result<HashMap<String, Device>> {
        self.inner.load_all()
    }

    fn get(&self, hardware_address: &str) -> Result<Option<Device>> {
        self.inner.get(hardware_address)
    }

    fn upsert(&mut self, device: &Device) -> Result<bool> {
        self.commit(|registry| registry.upsert(device))
    }

    fn replace_known(&mut self, devices: &[Device]) -> Result<()> {
        self.commit(|registry| registry.replace_known(devices))
    }

    fn promote(&mut self, hardware_address: &str) -> Result<bool> {
        if self.inner.get(hardware_address)?.is_none() {
            return Ok(false);
        }
        self.commit(|registry| registry.promote(hardware_address))
    }
}
