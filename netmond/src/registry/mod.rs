pub mod db;
pub mod hash;
pub mod json;
pub mod memory;

use std::collections::HashMap;
use anyhow::Result;
use shared::types::Device;
use crate::config::{RegistryBackend, RegistryConfig};

pub use db::SqliteRegistry;
pub use json::JsonRegistry;
pub use memory::MemoryRegistry;

/// Durable store of every device ever seen, keyed by hardware address.
///
/// Implementations are driven from a single thread (see `RegistryHandle`),
/// so they need `Send` but not `Sync`.
pub trait Registry: Send {
    /// Load every stored device
    fn load_all(&self) -> Result<HashMap<String, Device>>;

    fn get(&self, hardware_address: &str) -> Result<Option<Device>>;

    /// Insert or update one device. Returns true if stored data changed.
    ///
    /// `first_seen` is written only on insert, `last_seen` never moves
    /// backwards and `known` is never cleared.
    fn upsert(&mut self, device: &Device) -> Result<bool>;

    /// Drop the current known set and store `devices` as the new one
    fn replace_known(&mut self, devices: &[Device]) -> Result<()>;

    /// Mark a device as known. Returns false if it does not exist.
    fn promote(&mut self, hardware_address: &str) -> Result<bool>;
}

/// Open the backend selected in the configuration
pub fn open(config: &RegistryConfig) -> Result<Box<dyn Registry>> {
    let registry: Box<dyn Registry> = match config.backend {
        RegistryBackend::Sqlite => Box::new(SqliteRegistry::open(&config.db_path)?),
        RegistryBackend::Json => Box::new(JsonRegistry::open(&config.json_path)?),
        RegistryBackend::Memory => Box::new(MemoryRegistry::default()),
    };
    Ok(registry)
}

/// Apply upsert semantics for stores that keep whole records in memory.
pub(crate) fn merge_record(existing: Option<&Device>, incoming: &Device) -> Device {
    let mut merged = incoming.clone();
    if let Some(old) = existing {
        merged.first_seen = old.first_seen;
        merged.last_seen = old.last_seen.max(incoming.last_seen);
        merged.known = old.known || incoming.known;
    }
    merged.last_seen = merged.last_seen.max(merged.first_seen);
    merged
}

/// Compare the fields that describe a device, ignoring persistence timestamps.
pub(crate) fn device_data_changed(old: &Device, new: &Device) -> bool {
    old.network_address != new.network_address
        || old.vendor != new.vendor
        || old.known != new.known
        || old.state != new.state
        || old.open_services != new.open_services
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use super::testing::{t0, test_device};

    #[test]
    fn test_merge_record_keeps_first_seen_and_known() {
        let mut old = test_device("B8:27:EB:01:02:03");
        old.known = true;
        let mut incoming = test_device("B8:27:EB:01:02:03");
        incoming.first_seen = t0() + Duration::days(1);
        incoming.last_seen = t0() + Duration::days(1);

        let merged = merge_record(Some(&old), &incoming);

        assert_eq!(merged.first_seen, t0());
        assert_eq!(merged.last_seen, t0() + Duration::days(1));
        assert!(merged.known);
    }

    #[test]
    fn test_timestamps_are_not_data_changes() {
        let old = test_device("B8:27:EB:01:02:03");
        let mut new = old.clone();
        new.last_seen = t0() + Duration::minutes(5);
        assert!(!device_data_changed(&old, &new));

        new.network_address = Some("192.168.1.21".to_string());
        assert!(device_data_changed(&old, &new));
    }
}
