//! pathmux-server - standalone binary hosting the path-centric stream
//! fan-out engine with its management HTTP API.
//!
//! Wire-level protocol front-ends (RTSP/RTMP/HLS/WebRTC/SRT) are out of
//! scope for this core; this binary only boots the engine and its
//! management API, so it currently accepts no publishers or readers of its
//! own until a protocol adapter is registered via
//! `pathmux_core::bootstrap_services_with_source_factory`.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pathmux_core::{bootstrap_services, AppState};
use tokio::signal;

/// pathmux-server - path-centric live media routing core, standalone.
#[derive(Parser, Debug)]
#[command(name = "pathmux-server")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the configuration file (YAML). Overridable per-key by `MTX_`
    /// environment variables even when this file does not exist.
    #[arg(short, long, default_value = "pathmux.yml", env = "MTX_CONFIG")]
    pub config: PathBuf,

    /// Log level, overriding the configured `logLevel`.
    #[arg(long, value_enum, env = "MTX_LOGLEVEL")]
    pub log_level: Option<CliLogLevel>,

    /// Management API bind address, overriding the configured `apiAddress`.
    #[arg(long, env = "MTX_APIADDRESS")]
    pub api_address: Option<String>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl From<CliLogLevel> for pathmux_core::config::LogLevel {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => pathmux_core::config::LogLevel::Error,
            CliLogLevel::Warn => pathmux_core::config::LogLevel::Warn,
            CliLogLevel::Info => pathmux_core::config::LogLevel::Info,
            CliLogLevel::Debug => pathmux_core::config::LogLevel::Debug,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = config::load(&args).context("failed to load configuration")?;

    env_logger::Builder::new()
        .filter_level(config.log_level.as_level_filter())
        .format_timestamp_millis()
        .init();

    log::info!("pathmux-server v{}", env!("CARGO_PKG_VERSION"));
    log::info!(
        "configuration loaded: {} path entries, api={}",
        config.paths.len(),
        config.api
    );

    let api_address = config.api_address.clone();
    let api_enabled = config.api;
    let services = bootstrap_services(config).context("failed to bootstrap services")?;
    log::info!("services bootstrapped successfully");

    let server_handle = if api_enabled {
        let app_state = AppState::new(services.config_watcher.clone(), services.path_manager.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = pathmux_core::start_server(app_state, &api_address).await {
                log::error!("management API server error: {e}");
            }
        }))
    } else {
        log::info!("management API disabled (api: false)");
        None
    };

    shutdown_signal().await;
    log::info!("shutdown signal received, cleaning up...");

    services.shutdown().await;
    if let Some(handle) = server_handle {
        handle.abort();
    }

    log::info!("shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM): both futures are raced
/// with `tokio::select!` so whichever arrives first triggers the
/// graceful-shutdown path.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
