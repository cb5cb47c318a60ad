use std::time::Duration;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::protocol::{DEVICE_MEASUREMENT, UNKNOWN_VENDOR};
use shared::types::Device;
use super::MetricsSink;
use crate::config::MetricsConfig;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes device observations to InfluxDB v2 using line protocol.
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
    /// Name of the monitoring host, tagged on every point
    host: String,
}

impl InfluxSink {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WRITE_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        let host = hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string();

        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
            host,
        })
    }
}

#[async_trait]
impl MetricsSink for InfluxSink {
    async fn record(&self, devices: &[Device]) -> Result<()> {
        if devices.is_empty() {
            return Ok(());
        }

        let body = encode_points(devices, &self.host, Utc::now());

        let response = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "s"),
            ])
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach InfluxDB at {}", self.write_url))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("InfluxDB write returned {}: {}", status, detail.trim());
        }

        tracing::info!("Wrote {} device entries to InfluxDB", devices.len());
        Ok(())
    }
}

/// Escape a tag key or value: commas, equals signs and spaces
fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape a string field value: double quotes and backslashes
fn escape_field(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn or_unknown(value: &str) -> &str {
    if value.trim().is_empty() {
        UNKNOWN_VENDOR
    } else {
        value
    }
}

/// Render one line-protocol point per device
pub fn encode_points(devices: &[Device], host: &str, at: DateTime<Utc>) -> String {
    let ts = at.timestamp();

    devices
        .iter()
        .map(|d| {
            format!(
                "{},mac_address={},known={},host={} state=\"{}\",vendor=\"{}\",ip_address=\"{}\",open_services={}i {}",
                DEVICE_MEASUREMENT,
                escape_tag(&d.hardware_address),
                d.known,
                escape_tag(or_unknown(host)),
                d.state,
                escape_field(or_unknown(&d.vendor)),
                escape_field(or_unknown(d.network_address.as_deref().unwrap_or(""))),
                d.open_services.len(),
                ts
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::DeviceState;

    fn device() -> Device {
        let at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut d = Device::discovered("B8:27:EB:01:02:03".to_string(), at);
        d.network_address = Some("192.168.1.20".to_string());
        d.vendor = "Raspberry \"Pi\" Foundation".to_string();
        d
    }

    #[test]
    fn test_encode_point() {
        let at = DateTime::from_timestamp(1_714_564_800, 0).unwrap();
        let line = encode_points(&[device()], "monitor box", at);

        assert_eq!(
            line,
            "network_device,mac_address=B8:27:EB:01:02:03,known=false,host=monitor\\ box \
             state=\"up\",vendor=\"Raspberry \\\"Pi\\\" Foundation\",ip_address=\"192.168.1.20\",open_services=0i 1714564800"
        );
    }

    #[test]
    fn test_encode_missing_fields_as_unknown() {
        let mut d = device();
        d.vendor.clear();
        d.network_address = None;
        d.state = DeviceState::Down;
        let line = encode_points(&[d], "monitor", Utc::now());

        assert!(line.contains("state=\"down\""));
        assert!(line.contains("vendor=\"Unknown\""));
        assert!(line.contains("ip_address=\"Unknown\""));
    }

    #[test]
    fn test_one_line_per_device() {
        let mut other = device();
        other.hardware_address = "A0:63:91:12:34:56".to_string();
        let body = encode_points(&[device(), other], "monitor", Utc::now());
        assert_eq!(body.lines().count(), 2);
    }
}
