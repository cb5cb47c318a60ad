use std::path::{Path, PathBuf};
use serde::Deserialize;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub vendor: VendorConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerKind {
    Nmap,
    Arp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_scanner")]
    pub scanner: ScannerKind,
    #[serde(default = "default_nmap_path")]
    pub nmap_path: PathBuf,
    #[serde(default = "default_nmap_arguments")]
    pub nmap_arguments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Sqlite,
    Json,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_backend")]
    pub backend: RegistryBackend,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_json_path")]
    pub json_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VendorConfig {
    #[serde(default = "default_vendor_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_vendor_url")]
    pub url: String,
    /// Cached registry older than this is downloaded again
    #[serde(default = "default_vendor_max_age")]
    pub max_age_days: u64,
    /// How often the driver checks whether the cache is stale
    #[serde(default = "default_vendor_refresh_interval")]
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsBackend {
    Influx,
    Log,
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_backend")]
    pub backend: MetricsBackend,
    #[serde(default = "default_influx_url")]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_influx_org")]
    pub org: String,
    #[serde(default = "default_influx_bucket")]
    pub bucket: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_target() -> String {
    "192.168.1.0/24".to_string()
}

fn default_interval() -> u64 {
    300
}

fn default_scanner() -> ScannerKind {
    ScannerKind::Nmap
}

fn default_nmap_path() -> PathBuf {
    PathBuf::from("nmap")
}

fn default_nmap_arguments() -> Vec<String> {
    vec!["-sn".to_string(), "-PR".to_string()]
}

fn default_registry_backend() -> RegistryBackend {
    RegistryBackend::Sqlite
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/netmon/devices.db")
}

fn default_json_path() -> PathBuf {
    PathBuf::from("/var/lib/netmon/known_devices.json")
}

fn default_vendor_db_path() -> PathBuf {
    PathBuf::from("/var/lib/netmon/oui.txt")
}

fn default_vendor_url() -> String {
    "https://standards-oui.ieee.org/oui/oui.txt".to_string()
}

fn default_vendor_max_age() -> u64 {
    7
}

fn default_vendor_refresh_interval() -> u64 {
    3600
}

fn default_metrics_backend() -> MetricsBackend {
    MetricsBackend::Log
}

fn default_influx_url() -> String {
    "http://influxdb:8086".to_string()
}

fn default_influx_org() -> String {
    "netmon".to_string()
}

fn default_influx_bucket() -> String {
    "network_monitor".to_string()
}

fn default_api_enabled() -> bool {
    true
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            interval_secs: default_interval(),
            scanner: default_scanner(),
            nmap_path: default_nmap_path(),
            nmap_arguments: default_nmap_arguments(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: default_registry_backend(),
            db_path: default_db_path(),
            json_path: default_json_path(),
        }
    }
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            db_path: default_vendor_db_path(),
            url: default_vendor_url(),
            max_age_days: default_vendor_max_age(),
            refresh_interval_secs: default_vendor_refresh_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            backend: default_metrics_backend(),
            url: default_influx_url(),
            token: String::new(),
            org: default_influx_org(),
            bucket: default_influx_bucket(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply the deployment environment variables through `lookup`.
    /// Unset or empty variables leave the configured value in place.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("NETWORK_SCAN_INTERVAL") {
            self.scan.interval_secs = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid NETWORK_SCAN_INTERVAL: {}", v))?;
        }
        if let Some(v) = get("NETWORK_SCAN_TARGET") {
            self.scan.target = v;
        }
        if let Some(v) = get("INFLUXDB_URL") {
            self.metrics.url = v;
        }
        if let Some(v) = get("INFLUXDB_TOKEN") {
            self.metrics.token = v;
        }
        if let Some(v) = get("INFLUXDB_ORG") {
            self.metrics.org = v;
        }
        if let Some(v) = get("INFLUXDB_BUCKET") {
            self.metrics.bucket = v;
        }
        if let Some(v) = get("KNOWN_DEVICES_FILE") {
            self.registry.json_path = PathBuf::from(v);
        }
        if let Some(v) = get("MAC_VENDOR_DB_PATH") {
            self.vendor.db_path = PathBuf::from(v);
        }

        Ok(())
    }
}
