mod api;
mod config;
mod metrics;
mod monitor;
mod reconcile;
mod registry;
mod registry_manager;
mod scanner;
mod vendor;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use anyhow::{bail, Context, Result};
use crate::config::Config;
use crate::monitor::Monitor;
use crate::registry_manager::RegistryHandle;
use crate::vendor::OuiDatabase;

const DEFAULT_CONFIG_PATH: &str = "/etc/netmon/netmond.toml";

const USAGE: &str = "Usage: netmond [OPTIONS]
Options:
  -c, --config <PATH>    configuration file (default: /etc/netmon/netmond.toml)
  -n, --network <CIDR>   network to scan, overrides the configured target
  --initialize           replace the known-device set with one scan's results, then exit
  --once                 run a single scan cycle, then exit
  -h, --help             show this help message";

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    config_path: Option<String>,
    network: Option<String>,
    initialize: bool,
    once: bool,
    help: bool,
}

fn parse_args(raw: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    let mut args = raw.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                parsed.config_path = Some(args.next().context("--config requires a path")?);
            }
            "--network" | "-n" => {
                parsed.network = Some(args.next().context("--network requires a CIDR")?);
            }
            "--initialize" => parsed.initialize = true,
            "--once" => parsed.once = true,
            "--help" | "-h" => parsed.help = true,
            other => bail!("Unknown argument: {}", other),
        }
    }

    if parsed.initialize && parsed.once {
        bail!("--initialize and --once cannot be combined");
    }

    Ok(parsed)
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config_path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("Failed to load config from {}", DEFAULT_CONFIG_PATH))?,
        None => {
            tracing::warn!("No config file at {}, using defaults", DEFAULT_CONFIG_PATH);
            Config::default()
        }
    };

    config.apply_env().context("Invalid environment override")?;
    if let Some(network) = &args.network {
        config.scan.target = network.clone();
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("netmond=info"))
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        println!("{}", USAGE);
        return Ok(());
    }

    tracing::info!("Starting netmond");

    let config = load_config(&args)?;
    tracing::info!(
        "Scanning {} with {:?} every {}s, registry backend {:?}",
        config.scan.target,
        config.scan.scanner,
        config.scan.interval_secs,
        config.registry.backend
    );

    // Open registry and compute initial fingerprint
    let registry = registry::open(&config.registry)?;
    let initial_devices = registry.load_all()?;
    let initial_hash = registry::hash::compute_hash(initial_devices.values());
    tracing::info!("Loaded {} devices, registry hash {}", initial_devices.len(), initial_hash);

    let (hash_tx, hash_rx) = watch::channel(initial_hash);
    let registry_handle = RegistryHandle::spawn(registry, hash_tx);

    let monitor = Monitor::new(
        config.scan.target.clone(),
        Duration::from_secs(config.scan.interval_secs.max(1)),
        Duration::from_secs(config.vendor.refresh_interval_secs.max(60)),
        scanner::from_config(&config.scan),
        Arc::new(OuiDatabase::new(&config.vendor)),
        registry_handle.clone(),
        metrics::from_config(&config.metrics)?,
    );

    // Update the vendor database if needed
    monitor.refresh_vendors().await;

    if args.initialize {
        let result = monitor.initialize().await;
        registry_handle.shutdown().await?;
        result?;
        return Ok(());
    }

    if args.once {
        let result = monitor.run_cycle().await;
        registry_handle.shutdown().await?;
        result?;
        return Ok(());
    }

    monitor.check_known_devices().await;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let monitor_cancel = cancel.clone();
    let monitor_handle = tokio::spawn(async move {
        if let Err(e) = monitor.run(monitor_cancel).await {
            tracing::error!("Monitor error: {}", e);
        }
    });

    let server_handle = if config.api.enabled {
        let app = api::routes::router(api::routes::AppState {
            registry: registry_handle.clone(),
            hash_rx,
        });

        let listener = tokio::net::TcpListener::bind(&config.api.listen)
            .await
            .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

        tracing::info!("API listening on {}", config.api.listen);

        let server_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                .await
            {
                tracing::error!("Server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = monitor_handle.await;
    if let Some(handle) = server_handle {
        let _ = handle.await;
    }

    if let Err(e) = registry_handle.shutdown().await {
        tracing::error!("Failed to shutdown registry: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Result<Args> {
        parse_args(raw.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_flags() {
        let parsed = args(&["--config", "/tmp/n.toml", "-n", "10.0.0.0/24", "--initialize"]).unwrap();
        assert_eq!(parsed.config_path.as_deref(), Some("/tmp/n.toml"));
        assert_eq!(parsed.network.as_deref(), Some("10.0.0.0/24"));
        assert!(parsed.initialize);
        assert!(!parsed.once);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(args(&["--network"]).is_err());
        assert!(args(&["--frobnicate"]).is_err());
        assert!(args(&["--initialize", "--once"]).is_err());
    }

    #[test]
    fn test_network_flag_overrides_target() {
        let dir = std::env::temp_dir().join(format!("netmond-main-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("netmond.toml");
        std::fs::write(&path, "[scan]\ntarget = \"192.168.0.0/24\"\n").unwrap();

        let parsed = args(&["-c", path.to_str().unwrap(), "-n", "10.1.0.0/16"]).unwrap();
        let config = load_config(&parsed).unwrap();
        assert_eq!(config.scan.target, "10.1.0.0/16");

        std::fs::remove_dir_all(&dir).ok();
    }
}
