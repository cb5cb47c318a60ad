use std::net::IpAddr;
use std::path::PathBuf;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use ipnetwork::IpNetwork;
use shared::types::{ObservedHost, ScanSnapshot};
use super::Scanner;

const NEIGHBOUR_TABLE: &str = "/proc/net/arp";

/// ATF_COM: the entry has a resolved hardware address
const ATF_COMPLETE: u32 = 0x02;

/// Passive discovery from the kernel's ARP neighbour table.
///
/// Sends nothing on the wire, so it only reports hosts this machine has
/// talked to recently. Useful where raw-socket scanning is not allowed.
pub struct ArpTableScanner {
    table_path: PathBuf,
}

impl Default for ArpTableScanner {
    fn default() -> Self {
        Self {
            table_path: PathBuf::from(NEIGHBOUR_TABLE),
        }
    }
}

#[async_trait]
impl Scanner for ArpTableScanner {
    async fn scan(&self, target: &str) -> Result<ScanSnapshot> {
        let network: IpNetwork = target
            .trim()
            .parse()
            .with_context(|| format!("Invalid scan target for ARP table scan: {}", target))?;

        let started_at = Utc::now();
        let table = tokio::fs::read_to_string(&self.table_path)
            .await
            .with_context(|| format!("Failed to read {}", self.table_path.display()))?;

        let hosts = parse_table(&table, &network);
        tracing::info!("ARP table lists {} hosts in {}", hosts.len(), network);

        Ok(ScanSnapshot {
            target: target.to_string(),
            started_at,
            finished_at: Utc::now(),
            hosts,
        })
    }

    fn name(&self) -> &'static str {
        "arp"
    }
}

/// Parse `/proc/net/arp` content, keeping complete entries inside `network`.
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 192.168.1.1      0x1         0x2         a0:63:91:12:34:56     *        eth0
/// ```
pub fn parse_table(table: &str, network: &IpNetwork) -> Vec<ObservedHost> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }

            let ip: IpAddr = fields[0].parse().ok()?;
            if !network.contains(ip) {
                return None;
            }

            let flags = u32::from_str_radix(fields[2].trim_start_matches("0x"), 16).ok()?;
            if flags & ATF_COMPLETE == 0 {
                tracing::debug!("Skipping incomplete ARP entry for {}", ip);
                return None;
            }

            Some(ObservedHost::up(ip.to_string(), Some(fields[3])))
        })
        .collect()
}
