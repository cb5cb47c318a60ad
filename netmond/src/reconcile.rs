//! Merges one scan snapshot into the device registry.
//!
//! Everything here is pure: the registry contents, the vendor resolver and
//! the clock are passed in, and the result says which devices need to be
//! written back. Persistence is the caller's job.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use chrono::{DateTime, Utc};
use shared::mac::normalize_hardware_address;
use shared::types::{is_unresolved_vendor, Device, DeviceState, ObservedHost, OpenService, ScanSnapshot};
use crate::vendor::VendorResolver;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Every device after the merge, keyed by hardware address
    pub devices: BTreeMap<String, Device>,
    /// Devices that must be persisted this cycle, ordered by hardware address
    pub changes: Vec<Device>,
    pub stats: ReconcileStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Devices observed up in this snapshot
    pub up: usize,
    /// Devices newly transitioned to down
    pub went_down: usize,
    /// Hardware addresses never seen before
    pub discovered: usize,
    /// Up hosts dropped for lack of a hardware address
    pub skipped: usize,
}

/// Hosts reported up, keyed by normalized hardware address.
/// Duplicates collapse to the last observation.
fn identified_hosts(snapshot: &ScanSnapshot) -> (BTreeMap<String, &ObservedHost>, usize) {
    let mut found = BTreeMap::new();
    let mut skipped = 0;

    for host in snapshot.hosts_up() {
        let mac = host
            .hardware_address
            .as_deref()
            .and_then(normalize_hardware_address);

        match mac {
            Some(mac) => {
                if found.insert(mac.clone(), host).is_some() {
                    tracing::debug!("Hardware address {} reported more than once, keeping last", mac);
                }
            }
            None => {
                skipped += 1;
                tracing::warn!(
                    "Host {} is up but has no usable hardware address, skipping",
                    host.network_address.as_deref().unwrap_or("<no address>")
                );
            }
        }
    }

    (found, skipped)
}

/// Vendor for a newly observed address: resolver first, scanner hint second.
fn resolve_vendor(mac: &str, host: &ObservedHost, vendors: &dyn VendorResolver) -> String {
    let resolved = vendors.resolve(mac);
    if !is_unresolved_vendor(&resolved) {
        return resolved;
    }
    match host.scanner_vendor.as_deref() {
        Some(hint) if !is_unresolved_vendor(hint) => hint.trim().to_string(),
        _ => resolved,
    }
}

fn normalized_services(host: &ObservedHost) -> Vec<OpenService> {
    let mut services = host.open_services.clone();
    services.sort();
    services.dedup();
    services
}

/// Merge `snapshot` into `registry`.
///
/// Known devices keep their vendor unless it is still unresolved. Devices
/// absent from the snapshot go down, and are only written when that is a
/// transition. `first_seen` and `known` of existing devices are never touched.
pub fn reconcile(
    snapshot: &ScanSnapshot,
    registry: HashMap<String, Device>,
    vendors: &dyn VendorResolver,
    now: DateTime<Utc>,
) -> Reconciliation {
    let mut devices: BTreeMap<String, Device> = BTreeMap::new();
    for (key, mut device) in registry {
        let Some(mac) = normalize_hardware_address(&device.hardware_address)
            .or_else(|| normalize_hardware_address(&key))
        else {
            tracing::warn!("Registry entry {:?} has an invalid hardware address, ignoring", key);
            continue;
        };
        device.hardware_address = mac.clone();
        if devices.insert(mac.clone(), device).is_some() {
            tracing::warn!("Registry holds {} under more than one key, keeping one", mac);
        }
    }

    let (found, skipped) = identified_hosts(snapshot);
    let mut stats = ReconcileStats {
        skipped,
        up: found.len(),
        ..Default::default()
    };
    let mut changes = Vec::new();

    for (mac, host) in &found {
        match devices.entry(mac.clone()) {
            Entry::Occupied(mut entry) => {
                let device = entry.get_mut();
                if let Some(address) = &host.network_address {
                    device.network_address = Some(address.clone());
                }
                if device.vendor_unresolved() {
                    device.vendor = resolve_vendor(mac, host, vendors);
                }
                if device.state != DeviceState::Up {
                    tracing::debug!("Device {} is back up", mac);
                }
                device.state = DeviceState::Up;
                device.open_services = normalized_services(host);
                device.last_seen = now.max(device.first_seen);
                changes.push(device.clone());
            }
            Entry::Vacant(entry) => {
                let mut device = Device::discovered(mac.clone(), now);
                device.network_address = host.network_address.clone();
                device.vendor = resolve_vendor(mac, host, vendors);
                device.open_services = normalized_services(host);
                stats.discovered += 1;
                tracing::debug!(
                    "Discovered unknown device {} at {} ({})",
                    mac,
                    device.network_address.as_deref().unwrap_or("<no address>"),
                    device.vendor
                );
                changes.push(entry.insert(device).clone());
            }
        }
    }

    for (mac, device) in devices.iter_mut() {
        if found.contains_key(mac) || device.state == DeviceState::Down {
            continue;
        }
        tracing::debug!("Device {} not seen, marking down", mac);
        device.state = DeviceState::Down;
        device.last_seen = now.max(device.first_seen);
        stats.went_down += 1;
        changes.push(device.clone());
    }

    changes.sort_by(|a, b| a.hardware_address.cmp(&b.hardware_address));

    Reconciliation { devices, changes, stats }
}

/// Build the initial known set from a scan, for the bootstrap mode.
///
/// Every identified up host becomes a known device in state up. Hosts without
/// a hardware address are dropped with a warning. No prior history is merged.
pub fn bootstrap(
    snapshot: &ScanSnapshot,
    vendors: &dyn VendorResolver,
    now: DateTime<Utc>,
) -> Vec<Device> {
    let (found, _) = identified_hosts(snapshot);

    found
        .into_iter()
        .map(|(mac, host)| {
            let mut device = Device::discovered(mac.clone(), now);
            device.known = true;
            device.network_address = host.network_address.clone();
            device.vendor = resolve_vendor(&mac, host, vendors);
            device.open_services = normalized_services(host);
            device
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use chrono::Duration;
    use shared::protocol::UNKNOWN_VENDOR;
    use shared::types::HostStatus;

    /// Resolver that answers for one prefix and counts calls
    #[derive(Default)]
    struct StubVendors {
        calls: AtomicUsize,
    }

    impl VendorResolver for StubVendors {
        fn resolve(&self, hardware_address: &str) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if hardware_address.starts_with("11:22:33") {
                "Acme Networks".to_string()
            } else {
                UNKNOWN_VENDOR.to_string()
            }
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn known_device(mac: &str, state: DeviceState) -> Device {
        let mut device = Device::discovered(mac.to_string(), t0() - Duration::days(3));
        device.known = true;
        device.state = state;
        device.vendor = "Espressif Inc.".to_string();
        device.network_address = Some("10.0.0.9".to_string());
        device
    }

    fn registry_of(devices: Vec<Device>) -> HashMap<String, Device> {
        devices
            .into_iter()
            .map(|d| (d.hardware_address.clone(), d))
            .collect()
    }

    #[test]
    fn test_absent_device_goes_down() {
        let registry = registry_of(vec![known_device("AA:BB:CC:DD:EE:FF", DeviceState::Up)]);
        let snapshot = ScanSnapshot::new("10.0.0.0/24", vec![]);

        let result = reconcile(&snapshot, registry, &StubVendors::default(), t0());

        assert_eq!(result.devices["AA:BB:CC:DD:EE:FF"].state, DeviceState::Down);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.stats.went_down, 1);
    }

    #[test]
    fn test_new_device_is_unknown_and_up() {
        let vendors = StubVendors::default();
        let snapshot = ScanSnapshot::new(
            "10.0.0.0/24",
            vec![ObservedHost::up("10.0.0.5", Some("11:22:33:44:55:66"))],
        );

        let result = reconcile(&snapshot, HashMap::new(), &vendors, t0());

        let device = &result.devices["11:22:33:44:55:66"];
        assert!(!device.known);
        assert_eq!(device.state, DeviceState::Up);
        assert_eq!(device.vendor, "Acme Networks");
        assert_eq!(device.network_address.as_deref(), Some("10.0.0.5"));
        assert!(device.open_services.is_empty());
        assert_eq!(device.first_seen, t0());
        assert_eq!(device.last_seen, t0());
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.stats.discovered, 1);
        assert_eq!(vendors.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_down_device_comes_back_up() {
        let before = known_device("AA:BB:CC:DD:EE:FF", DeviceState::Down);
        let first_seen = before.first_seen;
        let last_seen = before.last_seen;
        let snapshot = ScanSnapshot::new(
            "10.0.0.0/24",
            vec![ObservedHost::up("10.0.0.7", Some("aa:bb:cc:dd:ee:ff"))],
        );

        let result = reconcile(&snapshot, registry_of(vec![before]), &StubVendors::default(), t0());

        let device = &result.devices["AA:BB:CC:DD:EE:FF"];
        assert_eq!(device.state, DeviceState::Up);
        assert_eq!(device.first_seen, first_seen);
        assert!(device.last_seen > last_seen);
        assert_eq!(device.network_address.as_deref(), Some("10.0.0.7"));
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].hardware_address, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_host_without_hardware_address_is_skipped() {
        let mut unknown_mac = ObservedHost::up("10.0.0.3", Some("UNKNOWN"));
        unknown_mac.open_services.push(OpenService {
            port: 22,
            protocol: "tcp".to_string(),
            service_name: "ssh".to_string(),
        });
        let snapshot = ScanSnapshot::new(
            "10.0.0.0/24",
            vec![
                ObservedHost::up("10.0.0.2", None),
                unknown_mac,
                ObservedHost::up("10.0.0.5", Some("11:22:33:44:55:66")),
            ],
        );

        let result = reconcile(&snapshot, HashMap::new(), &StubVendors::default(), t0());

        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.stats.skipped, 2);
        assert!(result.devices.contains_key("11:22:33:44:55:66"));
    }

    #[test]
    fn test_hosts_not_up_are_ignored() {
        let mut down = ObservedHost::up("10.0.0.5", Some("11:22:33:44:55:66"));
        down.status = HostStatus::Down;
        let snapshot = ScanSnapshot::new("10.0.0.0/24", vec![down]);

        let result = reconcile(&snapshot, HashMap::new(), &StubVendors::default(), t0());

        assert!(result.devices.is_empty());
        assert!(result.changes.is_empty());
        assert_eq!(result.stats.skipped, 0);
    }

    #[test]
    fn test_down_is_written_once() {
        let registry = registry_of(vec![known_device("AA:BB:CC:DD:EE:FF", DeviceState::Up)]);
        let snapshot = ScanSnapshot::new("10.0.0.0/24", vec![]);
        let vendors = StubVendors::default();

        let first = reconcile(&snapshot, registry, &vendors, t0());
        assert_eq!(first.changes.len(), 1);

        let persisted: HashMap<String, Device> = first.devices.into_iter().collect();
        let second = reconcile(&snapshot, persisted, &vendors, t0() + Duration::minutes(5));
        assert!(second.changes.is_empty());
        assert_eq!(second.devices["AA:BB:CC:DD:EE:FF"].state, DeviceState::Down);
    }

    #[test]
    fn test_first_seen_is_stable_across_cycles() {
        let device = known_device("AA:BB:CC:DD:EE:FF", DeviceState::Up);
        let first_seen = device.first_seen;
        let snapshot = ScanSnapshot::new(
            "10.0.0.0/24",
            vec![ObservedHost::up("10.0.0.9", Some("AA:BB:CC:DD:EE:FF"))],
        );
        let vendors = StubVendors::default();

        let mut registry = registry_of(vec![device]);
        for minutes in [0, 5, 10] {
            let result = reconcile(&snapshot, registry, &vendors, t0() + Duration::minutes(minutes));
            let device = &result.devices["AA:BB:CC:DD:EE:FF"];
            assert_eq!(device.first_seen, first_seen);
            assert!(device.first_seen <= device.last_seen);
            registry = result.devices.into_iter().collect();
        }
    }

    #[test]
    fn test_known_vendor_is_not_looked_up_again() {
        let vendors = StubVendors::default();
        let snapshot = ScanSnapshot::new(
            "10.0.0.0/24",
            vec![ObservedHost::up("10.0.0.9", Some("AA:BB:CC:DD:EE:FF"))],
        );
        let registry = registry_of(vec![known_device("AA:BB:CC:DD:EE:FF", DeviceState::Up)]);

        let result = reconcile(&snapshot, registry, &vendors, t0());

        assert_eq!(vendors.calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.devices["AA:BB:CC:DD:EE:FF"].vendor, "Espressif Inc.");
    }

    #[test]
    fn test_unresolved_vendor_is_retried() {
        let mut device = known_device("11:22:33:00:00:01", DeviceState::Up);
        device.vendor = UNKNOWN_VENDOR.to_string();
        let snapshot = ScanSnapshot::new(
            "10.0.0.0/24",
            vec![ObservedHost::up("10.0.0.9", Some("11:22:33:00:00:01"))],
        );

        let result = reconcile(&snapshot, registry_of(vec![device]), &StubVendors::default(), t0());

        assert_eq!(result.devices["11:22:33:00:00:01"].vendor, "Acme Networks");
    }

    #[test]
    fn test_scanner_vendor_hint_fills_miss() {
        let mut host = ObservedHost::up("10.0.0.4", Some("44:55:66:77:88:99"));
        host.scanner_vendor = Some("Sonos".to_string());
        let snapshot = ScanSnapshot::new("10.0.0.0/24", vec![host]);

        let result = reconcile(&snapshot, HashMap::new(), &StubVendors::default(), t0());

        assert_eq!(result.devices["44:55:66:77:88:99"].vendor, "Sonos");
    }

    #[test]
    fn test_services_replaced_wholesale() {
        let mut device = known_device("AA:BB:CC:DD:EE:FF", DeviceState::Up);
        device.open_services = vec![OpenService {
            port: 80,
            protocol: "tcp".to_string(),
            service_name: "http".to_string(),
        }];
        let mut host = ObservedHost::up("10.0.0.9", Some("AA:BB:CC:DD:EE:FF"));
        host.open_services = vec![OpenService {
            port: 22,
            protocol: "tcp".to_string(),
            service_name: "ssh".to_string(),
        }];
        let snapshot = ScanSnapshot::new("10.0.0.0/24", vec![host]);

        let result = reconcile(&snapshot, registry_of(vec![device]), &StubVendors::default(), t0());

        let services = &result.devices["AA:BB:CC:DD:EE:FF"].open_services;
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].port, 22);
    }

    #[test]
    fn test_duplicate_observation_last_wins() {
        let snapshot = ScanSnapshot::new(
            "10.0.0.0/24",
            vec![
                ObservedHost::up("10.0.0.5", Some("11:22:33:44:55:66")),
                ObservedHost::up("10.0.1.5", Some("11-22-33-44-55-66")),
            ],
        );

        let result = reconcile(&snapshot, HashMap::new(), &StubVendors::default(), t0());

        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(
            result.devices["11:22:33:44:55:66"].network_address.as_deref(),
            Some("10.0.1.5")
        );
    }

    #[test]
    fn test_known_flag_is_preserved() {
        let registry = registry_of(vec![
            known_device("AA:BB:CC:DD:EE:01", DeviceState::Up),
            known_device("AA:BB:CC:DD:EE:02", DeviceState::Down),
        ]);
        let snapshot = ScanSnapshot::new(
            "10.0.0.0/24",
            vec![ObservedHost::up("10.0.0.2", Some("AA:BB:CC:DD:EE:02"))],
        );

        let result = reconcile(&snapshot, registry, &StubVendors::default(), t0());

        assert!(result.devices.values().all(|d| d.known));
    }

    #[test]
    fn test_lowercase_registry_keys_are_normalized() {
        let mut device = known_device("aa:bb:cc:dd:ee:ff", DeviceState::Down);
        device.hardware_address = "aa:bb:cc:dd:ee:ff".to_string();
        let mut registry = HashMap::new();
        registry.insert("aa:bb:cc:dd:ee:ff".to_string(), device);
        let snapshot = ScanSnapshot::new(
            "10.0.0.0/24",
            vec![ObservedHost::up("10.0.0.9", Some("AA:BB:CC:DD:EE:FF"))],
        );

        let result = reconcile(&snapshot, registry, &StubVendors::default(), t0());

        assert_eq!(result.devices.len(), 1);
        assert_eq!(result.devices["AA:BB:CC:DD:EE:FF"].state, DeviceState::Up);
        assert!(result.devices["AA:BB:CC:DD:EE:FF"].known);
    }

    #[test]
    fn test_identity_and_down_promotion_over_mixed_input() {
        let registry = registry_of(vec![
            known_device("AA:BB:CC:DD:EE:01", DeviceState::Up),
            known_device("AA:BB:CC:DD:EE:02", DeviceState::Up),
            known_device("AA:BB:CC:DD:EE:03", DeviceState::Down),
        ]);
        let snapshot = ScanSnapshot::new(
            "10.0.0.0/24",
            vec![
                ObservedHost::up("10.0.0.1", Some("aa:bb:cc:dd:ee:01")),
                ObservedHost::up("10.0.0.20", Some("11:22:33:44:55:66")),
                ObservedHost::up("10.0.0.21", Some("11:22:33:44:55:66")),
                ObservedHost::up("10.0.0.22", None),
            ],
        );

        let result = reconcile(&snapshot, registry, &StubVendors::default(), t0());

        let macs: HashSet<&str> = result.changes.iter().map(|d| d.hardware_address.as_str()).collect();
        assert_eq!(macs.len(), result.changes.len(), "change-set has no duplicate identities");
        assert_eq!(result.devices.len(), 4);
        assert_eq!(result.devices["AA:BB:CC:DD:EE:02"].state, DeviceState::Down);
        assert_eq!(result.devices["AA:BB:CC:DD:EE:03"].state, DeviceState::Down);
        // 01 seen, 02 went down, new 11:22..; 03 was already down
        assert_eq!(result.changes.len(), 3);
        assert!(result.changes.windows(2).all(|w| w[0].hardware_address < w[1].hardware_address));
    }

    #[test]
    fn test_bootstrap_marks_everything_known() {
        let snapshot = ScanSnapshot::new(
            "10.0.0.0/24",
            vec![
                ObservedHost::up("10.0.0.5", Some("11:22:33:44:55:66")),
                ObservedHost::up("10.0.0.6", None),
                ObservedHost::up("10.0.0.7", Some("aa:bb:cc:dd:ee:ff")),
            ],
        );

        let devices = bootstrap(&snapshot, &StubVendors::default(), t0());

        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| d.known && d.state == DeviceState::Up));
        assert_eq!(devices[0].vendor, "Acme Networks");
        assert_eq!(devices[1].hardware_address, "AA:BB:CC:DD:EE:FF");
    }
}
