pub mod arp;
pub mod nmap;

use anyhow::Result;
use async_trait::async_trait;
use shared::types::ScanSnapshot;
use crate::config::{ScanConfig, ScannerKind};

pub use arp::ArpTableScanner;
pub use nmap::NmapScanner;

/// Produces a snapshot of the hosts reachable on a target network.
///
/// A failed probe is an error, never an empty or partial snapshot: the
/// driver skips reconciliation for that cycle instead.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, target: &str) -> Result<ScanSnapshot>;

    /// Short name used in log lines
    fn name(&self) -> &'static str;
}

/// Build the scanner selected in the configuration
pub fn from_config(config: &ScanConfig) -> Box<dyn Scanner> {
    match config.scanner {
        ScannerKind::Nmap => Box::new(NmapScanner::new(
            config.nmap_path.clone(),
            config.nmap_arguments.clone(),
        )),
        ScannerKind::Arp => Box::new(ArpTableScanner::default()),
    }
}
