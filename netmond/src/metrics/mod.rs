pub mod influx;

use anyhow::Result;
use async_trait::async_trait;
use shared::types::Device;
use crate::config::{MetricsBackend, MetricsConfig};

pub use influx::InfluxSink;

/// Destination for per-cycle device observations.
///
/// Writes are fire-and-forget from the driver's point of view: an error is
/// logged there and never changes the outcome of the cycle.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, devices: &[Device]) -> Result<()>;
}

/// Emits one structured log event per device
pub struct LogSink;

#[async_trait]
impl MetricsSink for LogSink {
    async fn record(&self, devices: &[Device]) -> Result<()> {
        for d in devices {
            tracing::info!(
                target: "netmond::observation",
                mac_address = %d.hardware_address,
                ip_address = d.network_address.as_deref().unwrap_or(""),
                vendor = %d.vendor,
                known = d.known,
                state = %d.state,
                open_services = d.open_services.len(),
                "device observation"
            );
        }
        Ok(())
    }
}

pub struct NullSink;

#[async_trait]
impl MetricsSink for NullSink {
    async fn record(&self, _devices: &[Device]) -> Result<()> {
        Ok(())
    }
}

/// Build the sink selected in the configuration
pub fn from_config(config: &MetricsConfig) -> Result<Box<dyn MetricsSink>> {
    let sink: Box<dyn MetricsSink> = match config.backend {
        MetricsBackend::Influx => Box::new(InfluxSink::new(config)?),
        MetricsBackend::Log => Box::new(LogSink),
        MetricsBackend::None => Box::new(NullSink),
    };
    Ok(sink)
}
