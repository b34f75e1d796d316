//! Application bootstrap and dependency wiring.
//!
//! This module contains the composition root - the single place where all
//! services are instantiated and wired together. This pattern provides:
//!
//! - **Clarity**: All dependency relationships are visible in one place
//! - **Testability**: Easy to swap implementations for testing
//! - **Maintainability**: Service creation logic is isolated from usage

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::{ConfigWatcher, PathmuxConfig};
use crate::error::PathmuxResult;
use crate::path_manager::PathManager;
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::static_source::StaticSourceFactory;

/// Container for every top-level service the `server` binary needs.
///
/// `Arc`-shared services plus one `CancellationToken` whose cancellation
/// cascades through every long-running task spawned during bootstrap.
#[derive(Clone)]
pub struct BootstrappedServices {
    /// Owns the active configuration and reconciles the path registry and
    /// authenticator on every successful reload.
    pub config_watcher: Arc<ConfigWatcher>,
    /// The name → `Path` registry.
    pub path_manager: Arc<PathManager>,
    /// Task spawner shared by every path actor and source runner.
    pub spawner: Arc<TokioSpawner>,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

impl BootstrappedServices {
    /// Initiates graceful shutdown of all services: cancels the top-level
    /// token, then tears down every live path (draining its sessions and
    /// cancelling its static source, if any).
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] beginning graceful shutdown...");
        self.cancel_token.cancel();
        for path in self.path_manager.list() {
            path.shutdown();
        }
        log::info!("[Bootstrap] shutdown complete");
    }
}

/// Bootstraps all application services with their dependencies.
///
/// This is the composition root where all services are instantiated and
/// wired together. The wiring order matters - services are created in
/// dependency order:
///
/// 1. Task spawner (from the current Tokio runtime)
/// 2. Cancellation token
/// 3. Path manager (holds the initial configuration snapshot)
/// 4. Config watcher (wraps the path manager, owns the live configuration
///    and the authenticator rebuilt from it)
/// 5. Configured static sources (`source:` entries that are not
///    `sourceOnDemand`) are instantiated immediately so their pull-source
///    runner starts connecting at startup rather than on first reader.
///
/// # Errors
///
/// Returns an error if `config` fails validation.
pub fn bootstrap_services(config: PathmuxConfig) -> PathmuxResult<BootstrappedServices> {
    bootstrap_services_with_source_factory(config, Arc::new(crate::static_source::UnconfiguredSourceFactory))
}

/// Same as [`bootstrap_services`], but lets the caller register a concrete
/// [`StaticSourceFactory`] (e.g. one instantiating real RTSP/RTMP/SRT/HLS
/// client adapters) instead of the always-failing default. Wire-level
/// adapters live outside this core; this seam is how a server binary
/// plugs them in.
pub fn bootstrap_services_with_source_factory(
    config: PathmuxConfig,
    source_factory: Arc<dyn StaticSourceFactory>,
) -> PathmuxResult<BootstrappedServices> {
    config.validate()?;

    let spawner = Arc::new(TokioSpawner::current());
    let cancel_token = CancellationToken::new();

    let path_manager = PathManager::with_source_factory(
        config.clone(),
        Arc::clone(&spawner) as Arc<dyn TaskSpawner>,
        source_factory,
    );
    let config_watcher = ConfigWatcher::new(config, Arc::clone(&path_manager));
    path_manager.start_configured_sources();

    Ok(BootstrappedServices {
        config_watcher,
        path_manager,
        spawner,
        cancel_token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_wires_config_watcher_and_path_manager() {
        let services = bootstrap_services(PathmuxConfig::default()).unwrap();
        assert_eq!(services.config_watcher.current().write_queue_size, 512);
        assert!(services.path_manager.list().is_empty());
    }

    #[tokio::test]
    async fn bootstrap_rejects_invalid_config() {
        let mut config = PathmuxConfig::default();
        config.write_queue_size = 3;
        assert!(bootstrap_services(config).is_err());
    }

    #[tokio::test]
    async fn bootstrap_eagerly_starts_configured_static_sources() {
        let mut config = PathmuxConfig::default();
        config.paths.insert(
            "cam1".into(),
            crate::config::PathConfig {
                source: crate::config::SourceKind::Url("rtsp://origin/live".into()),
                ..Default::default()
            },
        );
        let services = bootstrap_services(config).unwrap();
        assert!(services.path_manager.find("cam1").is_some());
    }

    #[tokio::test]
    async fn shutdown_tears_down_every_live_path() {
        let services = bootstrap_services(PathmuxConfig::default()).unwrap();
        services.path_manager.get_or_create("cam1").unwrap();
        assert_eq!(services.path_manager.list().len(), 1);
        services.shutdown().await;
        assert!(services.cancel_token.is_cancelled());
    }
}
