//! Lane Router Daemon
//!
//! Loads the lane table, validates it and keeps health supervision running
//! for every explicitly configured backend.
//!
//! # Usage
//!
//! ```bash
//! # Start with the default config ($XDG_CONFIG_HOME/lane-router/lanes.toml)
//! lane-router-daemon
//!
//! # Custom config file
//! lane-router-daemon --config /etc/lane-router/lanes.toml
//!
//! # Validate and print how every lane resolves, then exit
//! lane-router-daemon --check
//!
//! # Verbose logging
//! RUST_LOG=debug lane-router-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod service;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

use lane_router_core::{load_config_from_path, ConfigOverrides, LaneRouterConfig};

use service::{resolution_rows, LaneRouterService};

/// Lane Router Daemon - lane-based routing for local inference backends
#[derive(Parser, Debug)]
#[command(name = "lane-router-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Lane configuration file
    #[arg(short = 'c', long, env = "LANE_ROUTER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "LANE_ROUTER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Validate the configuration, print the resolution table and exit
    #[arg(long)]
    check: bool,

    /// Print the `--check` table as JSON
    #[arg(long, requires = "check")]
    json: bool,

    /// Health probe interval in seconds
    #[arg(long, value_name = "SECS")]
    probe_interval: Option<u64>,

    /// Consecutive failures that open a lane's circuit breaker
    #[arg(long, value_name = "N")]
    failure_threshold: Option<u32>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(secs) = self.probe_interval {
            overrides = overrides.with_probe_interval_secs(secs);
        }
        if let Some(threshold) = self.failure_threshold {
            overrides = overrides.with_failure_threshold(threshold);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "lane_router_daemon={level},lane_router_core={level},lane_router={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn load(args: &Args) -> Result<LaneRouterConfig> {
    let mut config = load_config_from_path(args.config.clone())
        .context("Failed to load lane configuration")?;
    args.overrides()
        .apply(&mut config)
        .context("Invalid command-line override")?;

    match &config.config_file_path {
        Some(path) => info!(path = ?path, source = %config.source(), "Configuration loaded"),
        None => info!(source = %config.source(), "No configuration file found"),
    }
    Ok(config)
}

fn check(config: &LaneRouterConfig, json: bool) -> Result<()> {
    let registry = Arc::new(config.build_registry().context("Invalid lane configuration")?);
    let rows = resolution_rows(registry);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for row in &rows {
            println!("{row}");
        }
    }

    let unresolved = rows.iter().filter(|row| row.target.is_none()).count();
    if unresolved > 0 {
        anyhow::bail!("{unresolved} lane(s) do not resolve to a configured backend");
    }
    Ok(())
}

/// Resolve once SIGTERM or SIGINT arrives
async fn wait_for_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let config = load(&args)?;

    if args.check {
        return check(&config, args.json);
    }

    info!("Lane Router Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let service = LaneRouterService::new(&config)?;
    service.log_summary();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals = tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            error!(error = %e, "Signal handling failed, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    let result = service.run(shutdown_rx).await;
    signals.abort();

    match result {
        Ok(()) => {
            info!("Lane Router Daemon stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Lane Router Daemon failed");
            Err(e)
        }
    }
}
