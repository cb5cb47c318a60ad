use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use shared::types::Device;
use crate::metrics::MetricsSink;
use crate::reconcile::{self, ReconcileStats};
use crate::registry_manager::RegistryHandle;
use crate::scanner::Scanner;
use crate::vendor::VendorResolver;

/// Summary of one completed scan-reconcile-persist cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub stats: ReconcileStats,
    /// Change-set entries written successfully
    pub persisted: usize,
    /// Change-set entries whose write failed
    pub failed: usize,
    pub metrics_recorded: bool,
}

/// Owns the polling cycle and its collaborators.
pub struct Monitor {
    target: String,
    poll_interval: Duration,
    vendor_refresh_interval: Duration,
    scanner: Box<dyn Scanner>,
    vendors: Arc<dyn VendorResolver>,
    registry: RegistryHandle,
    metrics: Box<dyn MetricsSink>,
}

async fn refresh(vendors: &dyn VendorResolver) {
    match vendors.refresh_if_stale().await {
        Ok(true) => tracing::info!("MAC vendor database updated"),
        Ok(false) => {}
        Err(e) => tracing::error!("Failed to refresh MAC vendor database: {:#}", e),
    }
}

impl Monitor {
    pub fn new(
        target: String,
        poll_interval: Duration,
        vendor_refresh_interval: Duration,
        scanner: Box<dyn Scanner>,
        vendors: Arc<dyn VendorResolver>,
        registry: RegistryHandle,
        metrics: Box<dyn MetricsSink>,
    ) -> Self {
        Self {
            target,
            poll_interval,
            vendor_refresh_interval,
            scanner,
            vendors,
            registry,
            metrics,
        }
    }

    /// Refresh the vendor table if it is stale. Failures keep the old table.
    pub async fn refresh_vendors(&self) {
        refresh(self.vendors.as_ref()).await;
    }

    /// Start a vendor refresh in the background unless one is still running
    fn spawn_vendor_refresh(&self, running: &mut Option<JoinHandle<()>>) {
        if running.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::debug!("Previous vendor refresh still running, skipping");
            return;
        }

        let vendors = Arc::clone(&self.vendors);
        *running = Some(tokio::spawn(async move {
            refresh(vendors.as_ref()).await;
        }));
    }

    /// Scan, reconcile against the registry, persist the change-set and
    /// record observations.
    ///
    /// Errors mean the cycle was skipped before anything was written: either
    /// the scan failed or the registry could not be loaded.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let snapshot = self
            .scanner
            .scan(&self.target)
            .await
            .with_context(|| format!("{} scan of {} failed", self.scanner.name(), self.target))?;

        let registry = self
            .registry
            .load_all()
            .await
            .context("Failed to load device registry")?;

        let result = reconcile::reconcile(&snapshot, registry, self.vendors.as_ref(), Utc::now());
        let mut report = CycleReport {
            stats: result.stats,
            ..Default::default()
        };

        // Each write stands alone; one failure must not block the rest
        for device in result.changes {
            let mac = device.hardware_address.clone();
            match self.registry.upsert(device).await {
                Ok(_) => report.persisted += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!("Failed to persist device {}: {:#}", mac, e);
                }
            }
        }

        let observed: Vec<Device> = result.devices.into_values().collect();
        match self.metrics.record(&observed).await {
            Ok(()) => report.metrics_recorded = true,
            Err(e) => tracing::error!("Failed to record device observations: {:#}", e),
        }

        tracing::info!(
            "Cycle complete: {} up, {} went down, {} new, {} skipped without MAC, {} persisted, {} failed, metrics {}",
            report.stats.up,
            report.stats.went_down,
            report.stats.discovered,
            report.stats.skipped,
            report.persisted,
            report.failed,
            if report.metrics_recorded { "recorded" } else { "not recorded" }
        );

        Ok(report)
    }

    /// Replace the known set with every identified host from one scan.
    /// Returns the number of devices stored; a failed or empty scan stores nothing.
    pub async fn initialize(&self) -> Result<usize> {
        tracing::info!("Initializing known devices with current scan results...");

        let snapshot = self
            .scanner
            .scan(&self.target)
            .await
            .context("Scan failed, cannot initialize known devices")?;

        let devices = reconcile::bootstrap(&snapshot, self.vendors.as_ref(), Utc::now());
        if devices.is_empty() {
            tracing::warn!("No devices found during the scan, leaving the registry unchanged");
            return Ok(0);
        }

        let count = devices.len();
        self.registry
            .replace_known(devices)
            .await
            .context("Failed to store known devices")?;

        tracing::info!("Initialized registry with {} known devices", count);
        Ok(count)
    }

    /// Warn when there is nothing to compare scans against
    pub async fn check_known_devices(&self) {
        match self.registry.load_all().await {
            Ok(devices) if !devices.values().any(|d| d.known) => {
                tracing::warn!("No known devices loaded. You may want to run --initialize first.");
            }
            Ok(devices) => {
                tracing::info!("Registry holds {} devices", devices.len());
            }
            Err(e) => tracing::error!("Failed to load device registry: {:#}", e),
        }
    }

    /// Polling loop. Runs until cancelled; no cycle error stops it.
    ///
    /// Vendor refreshes run on their own task so a slow download never delays
    /// a cycle. Lookups keep using the previous table until the new one loads.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Startup already refreshed the vendor table, so the first check waits a full period
        let mut vendor_refresh = interval_at(
            Instant::now() + self.vendor_refresh_interval,
            self.vendor_refresh_interval,
        );
        vendor_refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh_task: Option<JoinHandle<()>> = None;

        tracing::info!(
            "Monitoring {} every {}s",
            self.target,
            self.poll_interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        tracing::error!("{:#}. Skipping this interval.", e);
                    }
                }
                _ = vendor_refresh.tick() => {
                    self.spawn_vendor_refresh(&mut refresh_task);
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Monitor shutting down");
                    if let Some(task) = refresh_task.take() {
                        task.abort();
                    }
                    break;
                }
            }
        }

        Ok(())
    }
}
