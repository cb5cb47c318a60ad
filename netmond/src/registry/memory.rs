use std::collections::HashMap;
use anyhow::Result;
use shared::mac::normalize_hardware_address;
use shared::types::Device;
use super::{device_data_changed, merge_record, Registry};

/// Registry held in process memory. Contents are lost on exit.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    devices: HashMap<String, Device>,
}

impl MemoryRegistry {
    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let mut registry = Self::default();
        for device in devices {
            registry.insert_raw(device);
        }
        registry
    }

    /// Store a record as-is, only normalizing its key
    pub(crate) fn insert_raw(&mut self, mut device: Device) {
        let key = normalize_hardware_address(&device.hardware_address)
            .unwrap_or_else(|| device.hardware_address.to_ascii_uppercase());
        device.hardware_address = key.clone();
        self.devices.insert(key, device);
    }

    pub(crate) fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    fn key(hardware_address: &str) -> String {
        normalize_hardware_address(hardware_address)
            .unwrap_or_else(|| hardware_address.to_ascii_uppercase())
    }
}

impl Registry for MemoryRegistry {
    fn load_all(&self) -> Result<HashMap<String, Device>> {
        Ok(self.devices.clone())
    }

    fn get(&self, hardware_address: &str) -> Result<Option<Device>> {
        Ok(self.devices.get(&Self::key(hardware_address)).cloned())
    }

    fn upsert(&mut self, device: &Device) -> Result<bool> {
        let key = Self::key(&device.hardware_address);
        let existing = self.devices.get(&key);

        let mut merged = merge_record(existing, device);
        merged.hardware_address = key.clone();
        let changed = existing.map_or(true, |old| device_data_changed(old, &merged));

        self.devices.insert(key, merged);
        Ok(changed)
    }

    fn replace_known(&mut self, devices: &[Device]) -> Result<()> {
        self.devices.retain(|_, d| !d.known);
        for device in devices {
            self.upsert(device)?;
        }
        Ok(())
    }

    fn promote(&mut self, hardware_address: &str) -> Result<bool> {
        match self.devices.get_mut(&Self::key(hardware_address)) {
            Some(device) => {
                device.known = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::testing;

    #[test]
    fn test_upsert_semantics() {
        testing::exercise_upsert_semantics(&mut MemoryRegistry::default());
    }

    #[test]
    fn test_replace_known() {
        testing::exercise_replace_known(&mut MemoryRegistry::default());
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = MemoryRegistry::with_devices([testing::test_device("b8:27:eb:01:02:03")]);
        assert!(registry.get("B8:27:EB:01:02:03").unwrap().is_some());
        assert!(registry.load_all().unwrap().contains_key("B8:27:EB:01:02:03"));
    }
}
