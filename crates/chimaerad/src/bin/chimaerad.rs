//! chimaerad daemon binary
//!
//! Loads layered configuration, starts the audio backend and runs the main
//! loop until SIGINT or SIGTERM, releasing every claimed device on the way out.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chimaeraconf::{BackendKind, ChimaeraConfig};
use chimaerad::{platform, Daemon};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Jack,
    Dummy,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Jack => BackendKind::Jack,
            Backend::Dummy => BackendKind::Dummy,
        }
    }
}

/// Host daemon for Chimaera touch sensors
#[derive(Parser, Debug)]
#[command(name = "chimaerad")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file loaded after the system and user files
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    show_config: bool,

    /// Audio backend, overriding the config file
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = ChimaeraConfig::load_with_sources_from(cli.config.as_deref())
        .context("failed to load configuration")?;
    if let Some(backend) = cli.backend {
        config.infra.audio.backend = backend.into();
    }
    if let Some(level) = cli.log_level {
        config.infra.telemetry.log_level = level;
    }

    if cli.show_config {
        print!("{}", config.to_toml());
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.infra.telemetry.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("chimaerad {} starting", env!("CARGO_PKG_VERSION"));
    for file in &sources.files {
        info!(file = %file.display(), "config loaded");
    }
    for var in &sources.env_overrides {
        info!(var = %var, "config override");
    }

    let platform = platform::native();
    info!(platform = platform.name(), "platform selected");

    let (daemon, _api) = Daemon::start(config, platform).await?;
    daemon.run(shutdown_signal()).await;

    info!("chimaerad shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("received SIGINT, shutting down"),
            Err(e) => {
                warn!("cannot listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        },
        _ = terminate() => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
