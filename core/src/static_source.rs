//! Static Source Runner: supervises pull-based publishers (RTSP/RTMP/HLS/
//! SRT/UDP/WHEP/rpiCamera clients) with retry backoff.
//!
//! Uses a fixed-delay retry loop (`log::info!`/`log::warn!` on each attempt)
//! that runs unbounded and is gated by the owning Path's demand rather than
//! a bounded retry count, and the [`crate::runtime::TaskSpawner`] seam for
//! spawning the supervised task.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::SourceKind;
use crate::error::PathmuxResult;
use crate::path::Path;
use crate::runtime::{SpawnExt, TaskSpawner};
use crate::sample::SessionDescription;
use crate::stream::Stream;

/// Delay between respawn attempts while a path still wants its static
/// source and the previous attempt ended. Fixed rather than exponential:
/// a static source failing is usually an environment problem (camera
/// unplugged, upstream URL down) that won't resolve faster by backing off.
const RESPAWN_DELAY: Duration = Duration::from_secs(5);

/// Narrow handle a [`StaticSource`] implementation uses to hand its
/// session description to the owning Path once it has a live connection.
/// This is the only way a source can reach into its Path: it never holds
/// the Path directly, only this handle.
#[derive(Clone)]
pub struct StaticSourceHandle {
    path: Weak<Path>,
}

impl StaticSourceHandle {
    pub(crate) fn new(path: Weak<Path>) -> Self {
        Self { path }
    }

    /// Publishes the source's announced description and obtains the Stream
    /// to write units into.
    pub async fn set_ready(&self, description: SessionDescription) -> PathmuxResult<Arc<Stream>> {
        let path = self
            .path
            .upgrade()
            .ok_or_else(|| crate::error::PathmuxError::Terminated)?;
        path.static_source_ready(description).await
    }

    /// Reports a fatal error to the owning Path without necessarily ending
    /// the supervised task (the runner decides whether to respawn).
    pub fn report_error(&self, cause: impl Into<String>) {
        if let Some(path) = self.path.upgrade() {
            path.static_source_error(cause.into());
        }
    }
}

/// Cancellation context handed to a running [`StaticSource::run`] call.
#[derive(Clone)]
pub struct StaticSourceContext {
    pub cancel: CancellationToken,
}

impl StaticSourceContext {
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The adapter contract a pull-based protocol front-end implements to act
/// as a path's static source.
/// Wire-level packetization (RTSP/RTMP/HLS/SRT/UDP/rpiCamera specifics) is
/// deliberately out of scope for this core — this trait is the seam a
/// concrete protocol crate plugs into.
#[async_trait]
pub trait StaticSource: Send + Sync {
    /// Blocking call: connects, announces via `parent.set_ready`, and
    /// writes units until `ctx` is cancelled or a fatal error occurs.
    async fn run(&self, ctx: StaticSourceContext, parent: StaticSourceHandle) -> PathmuxResult<()>;

    /// Short source-kind name, surfaced through the management API.
    fn describe(&self) -> &'static str;
}

/// Builds a [`StaticSource`] for a path's configured [`SourceKind`]. A real
/// deployment registers one factory per supported protocol (RTSP client,
/// RTMP client, SRT client, rpiCamera capture, …); those implementations
/// live outside this core per. `NoOpFactory` is the default used when no
/// factory is registered.
pub trait StaticSourceFactory: Send + Sync {
    fn create(
        &self,
        source: &SourceKind,
        captures: &[String],
    ) -> PathmuxResult<Arc<dyn StaticSource>>;
}

/// Default factory: every source kind fails immediately with
/// `SourceUnavailable`. Combined with the runner's respawn policy this
/// degrades to "retry forever, never succeed" until a real factory is
/// wired in by the embedding server binary.
pub struct UnconfiguredSourceFactory;

impl StaticSourceFactory for UnconfiguredSourceFactory {
    fn create(
        &self,
        _source: &SourceKind,
        _captures: &[String],
    ) -> PathmuxResult<Arc<dyn StaticSource>> {
        Err(crate::error::PathmuxError::SourceUnavailable(
            "no StaticSourceFactory registered for this build".into(),
        ))
    }
}

/// Supervises one static source for the lifetime of a Path. Spawned once
/// when a Path first needs its pull source; exits when `cancel` fires.
pub struct SourceRunner;

impl SourceRunner {
    /// Spawns the supervised retry loop onto `spawner`. `path` is a weak
    /// reference so the runner never keeps the Path alive on its own.
    pub fn spawn(
        path: Weak<Path>,
        source: Arc<dyn StaticSource>,
        spawner: Arc<dyn TaskSpawner>,
        cancel: CancellationToken,
    ) {
        spawner.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let handle = StaticSourceHandle::new(path.clone());
                let ctx = StaticSourceContext {
                    cancel: cancel.clone(),
                };
                log::info!("[StaticSource] starting {}", source.describe());
                match source.run(ctx, handle.clone()).await {
                    Ok(()) => {
                        log::info!("[StaticSource] {} exited cleanly", source.describe());
                    }
                    Err(e) => {
                        log::warn!("[StaticSource] {} failed: {e}", source.describe());
                        handle.report_error(e.to_string());
                    }
                }

                if cancel.is_cancelled() {
                    break;
                }
                let still_wanted = path.upgrade().map(|p| p.wants_static_source()).unwrap_or(false);
                if !still_wanted {
                    log::debug!("[StaticSource] {} no longer wanted, stopping", source.describe());
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(RESPAWN_DELAY) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_factory_always_fails() {
        let factory = UnconfiguredSourceFactory;
        let err = factory
            .create(&SourceKind::Url("rtsp://origin/live".into()), &[])
            .unwrap_err();
        assert!(matches!(err, crate::error::PathmuxError::SourceUnavailable(_)));
    }
}
