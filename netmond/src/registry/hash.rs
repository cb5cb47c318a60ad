use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{Device, DeviceState, OpenService};

/// Hash only the fields that describe a device; first_seen/last_seen move on
/// every persistence event without the device itself changing.
#[derive(Serialize)]
struct HashView<'a> {
    hardware_address: &'a str,
    network_address: Option<&'a str>,
    vendor: &'a str,
    known: bool,
    state: DeviceState,
    open_services: &'a [OpenService],
}

/// Computes a SHA-256 fingerprint of the registry contents.
/// Devices are sorted by hardware address for deterministic output.
pub fn compute_hash<'a>(devices: impl IntoIterator<Item = &'a Device>) -> String {
    let mut devices: Vec<&Device> = devices.into_iter().collect();
    devices.sort_by(|a, b| a.hardware_address.cmp(&b.hardware_address));

    let views: Vec<HashView<'_>> = devices
        .iter()
        .map(|d| HashView {
            hardware_address: &d.hardware_address,
            network_address: d.network_address.as_deref(),
            vendor: &d.vendor,
            known: d.known,
            state: d.state,
            open_services: &d.open_services,
        })
        .collect();

    // Serializing plain strings, bools and integers cannot fail
    let json = serde_json::to_string(&views).unwrap_or_default();

    let hash = Sha256::digest(json.as_bytes());
    hex::encode(hash)
}
