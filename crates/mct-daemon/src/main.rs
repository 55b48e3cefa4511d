//! multi-consul-template - Consul KV template sidecar for consul-template

use anyhow::{Context, Result};
use clap::Parser;
use mct_core::config::{SettingsOverrides, WatchPair, resolve_settings};
use mct_core::consul;
use mct_daemon::daemon;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Mirror Consul KV templates to disk and keep consul-template reloaded
#[derive(Parser, Debug)]
#[command(name = "multi-consul-template")]
#[command(about = "Mirror Consul KV templates to disk and keep consul-template reloaded")]
#[command(version)]
struct Args {
    /// consul-template config file; its generated block is managed here
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// consul-template binary to supervise
    #[arg(long, value_name = "PATH")]
    bin: Option<PathBuf>,

    /// Consul endpoint: host:port, http(s)://host:port or unix:<path>
    #[arg(long, value_name = "ADDR")]
    consul: Option<String>,

    /// Consul ACL token
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    /// Optional TOML settings file
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Long-poll wait in seconds
    #[arg(long, value_name = "SECS")]
    wait: Option<u64>,

    /// Delay before retrying a failed listing, in seconds
    #[arg(long, value_name = "SECS")]
    retry: Option<u64>,

    /// Delay before retrying a failed renderer spawn, in seconds
    #[arg(long, value_name = "SECS")]
    spawn_retry: Option<u64>,

    /// Pause between starting the renderer and its first reload, in milliseconds
    #[arg(long, value_name = "MS")]
    reload_grace_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Watch pairs mapping a KV prefix to a local directory
    #[arg(value_name = "FROM:TO")]
    pairs: Vec<WatchPair>,
}

impl Args {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            settings_path: self.settings.clone(),
            endpoint: self.consul.clone(),
            token: self.token.clone(),
            renderer_bin: self.bin.clone(),
            renderer_config: self.config.clone(),
            pairs: self.pairs.clone(),
            wait: self.wait.map(Duration::from_secs),
            retry_delay: self.retry.map(Duration::from_secs),
            spawn_retry_delay: self.spawn_retry.map(Duration::from_secs),
            reload_grace: self.reload_grace_ms.map(Duration::from_millis),
        }
    }
}

// Single-threaded: the supervisor clears the published pid in the same poll
// that reaps the renderer, so a reload never targets a reaped pid.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    mct_core::logging::init(args.verbose);

    info!("multi-consul-template {} starting", env!("CARGO_PKG_VERSION"));

    let settings = resolve_settings(&args.overrides()).context("Failed to resolve settings")?;
    info!("Consul endpoint: {}", settings.endpoint);

    let client = consul::client_for(&settings.endpoint, settings.token.clone())
        .context("Failed to build Consul client")?;

    let cancel_token = CancellationToken::new();
    spawn_signal_listener(cancel_token.clone())?;

    if let Err(e) = daemon::run(settings, client, cancel_token).await {
        error!("Daemon stopped: {:#}", e);
        return Err(e.context("Daemon event loop failed"));
    }

    info!("multi-consul-template shutdown complete");
    Ok(())
}

/// Cancel `cancel` on SIGINT or SIGTERM.
fn spawn_signal_listener(cancel: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
        tokio::spawn(async move {
            tokio::select! {
                res = tokio::signal::ctrl_c() => match res {
                    Ok(()) => info!("Received SIGINT (Ctrl+C)"),
                    Err(e) => {
                        error!("Failed to listen for Ctrl+C: {}", e);
                        sigterm.recv().await;
                        info!("Received SIGTERM");
                    }
                },
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
            cancel.cancel();
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        cancel.cancel();
    });

    Ok(())
}
