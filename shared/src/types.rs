use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol::UNKNOWN_VENDOR;

/// Presence of a device as of the most recent reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Up,
    Down,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Up => "up",
            DeviceState::Down => "down",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(DeviceState::Up),
            "down" => Ok(DeviceState::Down),
            other => Err(format!("invalid device state: {other}")),
        }
    }
}

/// A service endpoint observed open on a host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpenService {
    pub port: u16,
    /// Transport protocol, e.g. "tcp"
    pub protocol: String,
    /// Service name as reported by the scanner, e.g. "ssh"
    pub service_name: String,
}

/// A device ever seen on the network.
/// This is the canonical record kept by the registry and reported to metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Normalized hardware address, e.g. "AA:BB:CC:DD:EE:FF"
    pub hardware_address: String,

    /// Most recently observed network address
    pub network_address: Option<String>,

    /// Manufacturer name; empty or "Unknown" while unresolved
    #[serde(default)]
    pub vendor: String,

    /// Whether the device belongs to the approved set
    pub known: bool,

    /// Presence in the most recent scan
    pub state: DeviceState,

    /// First time this device was persisted
    pub first_seen: DateTime<Utc>,

    /// Last persistence event for this device
    pub last_seen: DateTime<Utc>,

    /// Services observed open in the most recent scan
    #[serde(default)]
    pub open_services: Vec<OpenService>,
}

impl Device {
    /// A device seen for the first time at `now`.
    pub fn discovered(hardware_address: String, now: DateTime<Utc>) -> Self {
        Self {
            hardware_address,
            network_address: None,
            vendor: String::new(),
            known: false,
            state: DeviceState::Up,
            first_seen: now,
            last_seen: now,
            open_services: Vec::new(),
        }
    }

    /// True while no manufacturer has been resolved for this device.
    pub fn vendor_unresolved(&self) -> bool {
        is_unresolved_vendor(&self.vendor)
    }
}

/// Empty strings and the lookup-miss sentinel both mean "not resolved yet".
pub fn is_unresolved_vendor(vendor: &str) -> bool {
    let v = vendor.trim();
    v.is_empty() || v.eq_ignore_ascii_case(UNKNOWN_VENDOR)
}

/// Reachability reported by the scanner for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Up,
    Down,
    Unknown,
}

/// One host entry in a scan snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedHost {
    pub network_address: Option<String>,

    /// Raw hardware address as reported; may be absent or a placeholder
    pub hardware_address: Option<String>,

    pub status: HostStatus,

    #[serde(default)]
    pub open_services: Vec<OpenService>,

    /// Manufacturer hint reported by the scanner itself, if any
    #[serde(default)]
    pub scanner_vendor: Option<String>,
}

impl ObservedHost {
    pub fn up(network_address: impl Into<String>, hardware_address: Option<&str>) -> Self {
        Self {
            network_address: Some(network_address.into()),
            hardware_address: hardware_address.map(str::to_string),
            status: HostStatus::Up,
            open_services: Vec::new(),
            scanner_vendor: None,
        }
    }
}

/// Result of a single network probe. Consumed once by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSnapshot {
    /// Target that was scanned, e.g. "192.168.1.0/24"
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub hosts: Vec<ObservedHost>,
}

impl ScanSnapshot {
    pub fn new(target: impl Into<String>, hosts: Vec<ObservedHost>) -> Self {
        let now = Utc::now();
        Self {
            target: target.into(),
            started_at: now,
            finished_at: now,
            hosts,
        }
    }

    pub fn hosts_up(&self) -> impl Iterator<Item = &ObservedHost> {
        self.hosts.iter().filter(|h| h.status == HostStatus::Up)
    }
}
