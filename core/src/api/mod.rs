//! Management HTTP API layer.
//!
//! Thin handlers that delegate to [`crate::config::ConfigWatcher`] and
//! [`crate::path_manager::PathManager`]; no business logic lives here.
//! Wire-level protocol serving (RTSP/RTMP/HLS/WebRTC/SRT) is out of scope
//! for this core — this module only exposes the path-configuration
//! CRUD contract and read-only path introspection.

use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigWatcher;
use crate::path_manager::PathManager;

pub mod http;

/// Errors that can occur when starting or running the management API server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind management API to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("management API server error: {0}")]
    Serve(std::io::Error),
}

/// Shared state for the management API layer. A thin wrapper over the two
/// composition-root services every handler needs.
#[derive(Clone)]
pub struct AppState {
    pub config_watcher: Arc<ConfigWatcher>,
    pub path_manager: Arc<PathManager>,
}

impl AppState {
    pub fn new(config_watcher: Arc<ConfigWatcher>, path_manager: Arc<PathManager>) -> Self {
        Self {
            config_watcher,
            path_manager,
        }
    }
}

/// Normalizes a Go-style bind address (`":9997"`, meaning "all interfaces")
/// into one Rust's `ToSocketAddrs` resolves. `PathmuxConfig::api_address`
/// defaults to `":9997"`, following the upstream convention; a leading bare
/// colon does not parse as an address here the way it does there.
fn normalize_bind_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

/// Binds and serves the management HTTP API on `addr` (`PathmuxConfig::api_address`).
/// Runs until the listener is dropped or the process is signalled to stop; the
/// `server` binary races this future against `shutdown_signal()`.
pub async fn start_server(state: AppState, addr: &str) -> Result<(), ServerError> {
    let bind_addr = normalize_bind_addr(addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind_addr.clone(),
            source,
        })?;
    log::info!("[Api] management API listening on {bind_addr}");
    let app = http::create_router(state);
    axum::serve(listener, app)
        .await
        .map_err(ServerError::Serve)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_expands_leading_colon() {
        assert_eq!(normalize_bind_addr(":9997"), "0.0.0.0:9997");
    }

    #[test]
    fn normalize_bind_addr_leaves_explicit_host_alone() {
        assert_eq!(normalize_bind_addr("127.0.0.1:9997"), "127.0.0.1:9997");
    }
}
