/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Measurement name used for device observations in the metrics store
pub const DEVICE_MEASUREMENT: &str = "network_device";

/// Vendor value recorded when a hardware address has no registry entry
pub const UNKNOWN_VENDOR: &str = "Unknown";

/// Vendor label for locally administered (randomized or virtual) addresses
pub const PRIVATE_VENDOR: &str = "Private (locally administered)";

/// Placeholder some scanners emit instead of a hardware address
pub const UNKNOWN_HARDWARE_ADDRESS: &str = "UNKNOWN";
