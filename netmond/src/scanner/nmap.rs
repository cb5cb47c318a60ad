use std::path::PathBuf;
use std::sync::OnceLock;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tokio::process::Command;
use shared::types::{HostStatus, ObservedHost, OpenService, ScanSnapshot};
use super::Scanner;

/// Host discovery through the `nmap` binary, reading its XML report from stdout.
pub struct NmapScanner {
    binary: PathBuf,
    arguments: Vec<String>,
}

impl NmapScanner {
    pub fn new(binary: PathBuf, arguments: Vec<String>) -> Self {
        Self { binary, arguments }
    }
}

#[async_trait]
impl Scanner for NmapScanner {
    async fn scan(&self, target: &str) -> Result<ScanSnapshot> {
        if target.trim().is_empty() || target.starts_with('-') {
            bail!("Invalid scan target: {:?}", target);
        }

        tracing::info!(
            "Starting network scan on {} with arguments '{}'",
            target,
            self.arguments.join(" ")
        );

        let started_at = Utc::now();
        let output = Command::new(&self.binary)
            .args(&self.arguments)
            .args(["-oX", "-"])
            .arg(target)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("nmap exited with {}: {}", output.status, stderr.trim());
        }

        let report = String::from_utf8_lossy(&output.stdout);
        let hosts = parse_report(&report).context("Failed to parse nmap XML report")?;

        tracing::info!("Scan complete. {} hosts found.", hosts.len());

        Ok(ScanSnapshot {
            target: target.to_string(),
            started_at,
            finished_at: Utc::now(),
            hosts,
        })
    }

    fn name(&self) -> &'static str {
        "nmap"
    }
}

struct Patterns {
    host: Regex,
    status: Regex,
    address: Regex,
    port: Regex,
    port_state: Regex,
    service: Regex,
    attribute: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        host: Regex::new(r"(?s)<host\b[^>]*>(.*?)</host>").expect("valid host pattern"),
        status: Regex::new(r#"<status\b[^>]*\bstate="([^"]*)""#).expect("valid status pattern"),
        address: Regex::new(r"<address\b([^>]*?)/?>").expect("valid address pattern"),
        port: Regex::new(r"(?s)<port\b([^>]*)>(.*?)</port>").expect("valid port pattern"),
        port_state: Regex::new(r#"<state\b[^>]*\bstate="([^"]*)""#).expect("valid state pattern"),
        service: Regex::new(r"<service\b([^>]*?)/?>").expect("valid service pattern"),
        attribute: Regex::new(r#"([\w:-]+)="([^"]*)""#).expect("valid attribute pattern"),
    })
}

fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    patterns()
        .attribute
        .captures_iter(attrs)
        .find(|c| &c[1] == name)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str())
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Parse an nmap XML report into observed hosts.
///
/// Hosts without a `<status>` element are reported with unknown status; the
/// hardware address is left absent when nmap could not see one (for example
/// the scanning machine itself, or hosts behind a router).
pub fn parse_report(xml: &str) -> Result<Vec<ObservedHost>> {
    if !xml.contains("<nmaprun") {
        bail!("Output is not an nmap XML report");
    }

    let p = patterns();
    let mut hosts = Vec::new();

    for block in p.host.captures_iter(xml) {
        let body = &block[1];

        let status = match p.status.captures(body).map(|c| c[1].to_string()) {
            Some(s) if s == "up" => HostStatus::Up,
            Some(s) if s == "down" => HostStatus::Down,
            _ => HostStatus::Unknown,
        };

        let mut network_address = None;
        let mut hardware_address = None;
        let mut scanner_vendor = None;

        for address in p.address.captures_iter(body) {
            let attrs = &address[1];
            let (Some(addr), Some(kind)) = (attribute(attrs, "addr"), attribute(attrs, "addrtype")) else {
                continue;
            };
            match kind {
                "ipv4" => network_address = Some(addr.to_string()),
                "ipv6" if network_address.is_none() => network_address = Some(addr.to_string()),
                "mac" => {
                    hardware_address = Some(addr.to_string());
                    scanner_vendor = attribute(attrs, "vendor").map(unescape);
                }
                _ => {}
            }
        }

        let mut open_services = Vec::new();
        for port in p.port.captures_iter(body) {
            let attrs = &port[1];
            let inner = &port[2];

            let open = p
                .port_state
                .captures(inner)
                .map(|c| &c[1] == "open")
                .unwrap_or(false);
            if !open {
                continue;
            }

            let Some(number) = attribute(attrs, "portid").and_then(|v| v.parse::<u16>().ok()) else {
                continue;
            };
            let protocol = attribute(attrs, "protocol").unwrap_or("tcp").to_string();
            let service_name = p
                .service
                .captures(inner)
                .and_then(|c| attribute(c.get(1)?.as_str(), "name").map(unescape))
                .unwrap_or_default();

            open_services.push(OpenService {
                port: number,
                protocol,
                service_name,
            });
        }

        hosts.push(ObservedHost {
            network_address,
            hardware_address,
            status,
            open_services,
            scanner_vendor,
        });
    }

    Ok(hosts)
}
