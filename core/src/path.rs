//! Path: the per-name state machine driving on-demand source start, idle
//! shutdown, publisher admission, and reader fan-out.
//!
//! A single task owns all mutable state and is driven by an `mpsc` inbox, so
//! every command is serialized without a lock around the state machine
//! itself. Concurrent readers that arrive while a static source is still
//! starting wait on a `tokio::sync::watch` channel rather than blocking the
//! inbox, so they're all released together once the source becomes ready.
//! A lock-free `AtomicU8` snapshot lets `wants_static_source()` and
//! `describe()` be called from other tasks (the source runner, the
//! management API) without going through the inbox at all.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::PathConfig;
use crate::error::{PathmuxError, PathmuxResult};
use crate::path_manager::PathManager;
use crate::runtime::{SpawnExt, TaskSpawner};
use crate::sample::SessionDescription;
use crate::session::{SessionGuard, SessionKind, SessionRegistry, Transport};
use crate::static_source::{SourceRunner, StaticSourceFactory};
use crate::stream::Stream;

/// The path's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    /// No publisher, no static source running, no pending readers.
    Idle,
    /// An on-demand static source has been spawned and readers are queued
    /// waiting for it to announce a description.
    StartingSource,
    /// A stream exists (either publisher- or source-fed) and can accept
    /// readers immediately.
    Ready,
    /// The on-demand idle-close timer fired and the static source is being
    /// torn down; the path returns to `Idle` once that completes.
    ClosingSource,
}

/// Lock-free snapshot of [`PathState`] for readers outside the actor task.
#[repr(u8)]
#[derive(Clone, Copy)]
enum StateTag {
    Idle = 0,
    StartingSource = 1,
    Ready = 2,
    ClosingSource = 3,
}

impl From<PathState> for StateTag {
    fn from(s: PathState) -> Self {
        match s {
            PathState::Idle => StateTag::Idle,
            PathState::StartingSource => StateTag::StartingSource,
            PathState::Ready => StateTag::Ready,
            PathState::ClosingSource => StateTag::ClosingSource,
        }
    }
}

impl From<u8> for PathState {
    fn from(v: u8) -> Self {
        match v {
            1 => PathState::StartingSource,
            2 => PathState::Ready,
            3 => PathState::ClosingSource,
            _ => PathState::Idle,
        }
    }
}

/// Dependencies a `Path` needs from its owning [`PathManager`], threaded
/// through at construction rather than reached for globally.
pub struct PathDeps {
    pub manager: Weak<PathManager>,
    pub spawner: Arc<dyn TaskSpawner>,
    pub queue_capacity: usize,
    pub source_factory: Arc<dyn StaticSourceFactory>,
}

/// Introspection snapshot for the management API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PathDescription {
    pub name: String,
    pub state: &'static str,
    pub ready: bool,
    pub source_on_demand: bool,
    pub readers: usize,
    pub publishers: usize,
    pub bytes_discarded_hint: bool,
    pub fallback: Option<String>,
}

/// Outcome of attaching a reader: either it can start consuming immediately,
/// or it must wait on the returned `watch::Receiver` until the source
/// becomes ready (or the attempt fails, e.g. a start timeout).
pub enum AttachReaderOutcome {
    Ready(Arc<Stream>),
    Pending(watch::Receiver<SourceSignal>),
    /// The path has no live publisher and none can be started on demand, but
    /// a `fallback` URL is configured. The caller redirects the reader there
    /// instead of treating the attach as a failure.
    Redirect(String),
}

/// Broadcast over a `watch` channel to every reader queued behind a
/// not-yet-ready on-demand source, so one attach-publisher-or-source event
/// releases them all without the inbox ever blocking on queue draining.
#[derive(Clone)]
pub enum SourceSignal {
    Waiting,
    Ready(Arc<Stream>),
    Failed(String),
}

enum PathCommand {
    AttachPublisher {
        description: SessionDescription,
        remote_addr: Option<std::net::SocketAddr>,
        transport: Transport,
        reply: oneshot::Sender<PathmuxResult<(SessionGuard, Arc<Stream>)>>,
    },
    AttachReader {
        remote_addr: Option<std::net::SocketAddr>,
        transport: Transport,
        reply: oneshot::Sender<PathmuxResult<(SessionGuard, AttachReaderOutcome)>>,
    },
    DetachSession {
        id: uuid::Uuid,
    },
    StaticSourceReady {
        description: SessionDescription,
        reply: oneshot::Sender<PathmuxResult<Arc<Stream>>>,
    },
    StaticSourceError {
        cause: String,
    },
    IdleCloseTimeout,
    ConfigReplaced {
        config: PathConfig,
        captures: Vec<String>,
    },
    Shutdown,
}

/// The per-path actor: all mutable state lives on the task draining `inbox`;
/// everything else talks to it by sending a [`PathCommand`] and awaiting a
/// reply.
pub struct Path {
    name: String,
    inbox: mpsc::UnboundedSender<PathCommand>,
    state_tag: Arc<AtomicU8>,
    source_on_demand: bool,
    cancel: CancellationToken,
    /// Shared with the actor so `describe()` can read reader/publisher
    /// counts without a round trip through the inbox.
    sessions: Arc<SessionRegistry>,
    /// Mirrors `PathConfig::fallback`, refreshed on every `ConfigReplaced`,
    /// so `describe()` can surface it without an inbox round trip.
    fallback: parking_lot::RwLock<Option<String>>,
}

impl Path {
    pub fn new(
        name: String,
        config: PathConfig,
        captures: Vec<String>,
        deps: PathDeps,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let state_tag = Arc::new(AtomicU8::new(StateTag::Idle as u8));
        let source_on_demand = config.source.is_on_demand_capable() && config.source_on_demand;
        let cancel = CancellationToken::new();
        let sessions = Arc::new(SessionRegistry::new());
        let fallback = parking_lot::RwLock::new(config.fallback.clone());

        let path = Arc::new(Self {
            name: name.clone(),
            inbox: tx,
            state_tag: Arc::clone(&state_tag),
            source_on_demand,
            cancel: cancel.clone(),
            sessions: Arc::clone(&sessions),
            fallback,
        });

        let actor = PathActor {
            name,
            config,
            captures,
            deps,
            state: PathState::Idle,
            state_tag,
            cancel,
            stream: None,
            sessions,
            publisher: None,
            pending_readers_tx: None,
            idle_close_handle: None,
            source_cancel: None,
            start_timeout_cancel: None,
            self_ref: Arc::downgrade(&path),
        };
        tokio::spawn(actor.run(rx));
        path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cheap lock-free read used by the source runner's respawn loop: no
    /// inbox round trip, just an atomic load.
    pub fn wants_static_source(&self) -> bool {
        self.source_on_demand
            && !self.cancel.is_cancelled()
            && matches!(
                PathState::from(self.state_tag.load(Ordering::Acquire)),
                PathState::StartingSource | PathState::Ready
            )
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PathCommand,
    ) -> PathmuxResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inbox
            .send(make(reply_tx))
            .map_err(|_| PathmuxError::Terminated)?;
        reply_rx.await.map_err(|_| PathmuxError::Terminated)
    }

    /// Attaches a publisher, evicting the prior one if `overridePublisher`
    /// allows it. `transport` identifies which
    /// front-end protocol this publisher arrived over, for introspection.
    pub async fn attach_publisher(
        &self,
        description: SessionDescription,
        remote_addr: Option<std::net::SocketAddr>,
        transport: Transport,
    ) -> PathmuxResult<(SessionGuard, Arc<Stream>)> {
        self.call(|reply| PathCommand::AttachPublisher {
            description,
            remote_addr,
            transport,
            reply,
        })
        .await?
    }

    /// Attaches a reader, triggering on-demand source start if the path is
    /// `Idle` and configured for one. Returns immediately if a stream is
    /// already `Ready`; otherwise returns a `watch::Receiver` the caller
    /// awaits for readiness.
    pub async fn attach_reader(
        &self,
        remote_addr: Option<std::net::SocketAddr>,
        transport: Transport,
    ) -> PathmuxResult<(SessionGuard, AttachReaderOutcome)> {
        self.call(|reply| PathCommand::AttachReader {
            remote_addr,
            transport,
            reply,
        })
        .await?
    }

    pub fn detach_session(&self, id: uuid::Uuid) {
        let _ = self.inbox.send(PathCommand::DetachSession { id });
    }

    /// Called by [`crate::static_source::StaticSourceHandle::set_ready`].
    pub async fn static_source_ready(&self, description: SessionDescription) -> PathmuxResult<Arc<Stream>> {
        self.call(|reply| PathCommand::StaticSourceReady { description, reply })
            .await?
    }

    /// Called by [`crate::static_source::StaticSourceHandle::report_error`].
    /// Fire-and-forget: the actor decides whether this fails pending reader
    /// waits (still starting) or is just logged (already ready, mid-stream
    /// hiccup the runner will respawn from).
    pub fn static_source_error(&self, cause: String) {
        let _ = self.inbox.send(PathCommand::StaticSourceError { cause });
    }

    pub fn apply_config(&self, config: PathConfig, captures: Vec<String>) {
        let _ = self.inbox.send(PathCommand::ConfigReplaced { config, captures });
    }

    /// Lock-free introspection snapshot for the management API: reads the
    /// atomic state tag and the shared session registry directly, with no
    /// inbox round trip.
    pub fn describe(&self) -> PathDescription {
        let state = PathState::from(self.state_tag.load(Ordering::Acquire));
        PathDescription {
            name: self.name.clone(),
            state: match state {
                PathState::Idle => "idle",
                PathState::StartingSource => "starting",
                PathState::Ready => "ready",
                PathState::ClosingSource => "closing",
            },
            ready: matches!(state, PathState::Ready),
            source_on_demand: self.source_on_demand,
            readers: self.sessions.count_by_kind(SessionKind::Reader),
            publishers: self.sessions.count_by_kind(SessionKind::Publisher),
            bytes_discarded_hint: false,
            fallback: self.fallback.read().clone(),
        }
    }

    /// Updates the lock-free fallback mirror; called by the actor on a
    /// `ConfigReplaced` reload so `describe()` reflects the new value
    /// without an inbox round trip.
    fn set_fallback(&self, value: Option<String>) {
        *self.fallback.write() = value;
    }

    /// Tears down this path: cancels any running static source, detaches
    /// every session, and stops the actor task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let _ = self.inbox.send(PathCommand::Shutdown);
    }
}

struct PathActor {
    name: String,
    config: PathConfig,
    captures: Vec<String>,
    deps: PathDeps,
    state: PathState,
    state_tag: Arc<AtomicU8>,
    cancel: CancellationToken,
    stream: Option<Arc<Stream>>,
    sessions: Arc<SessionRegistry>,
    publisher: Option<uuid::Uuid>,
    pending_readers_tx: Option<watch::Sender<SourceSignal>>,
    idle_close_handle: Option<CancellationToken>,
    source_cancel: Option<CancellationToken>,
    start_timeout_cancel: Option<CancellationToken>,
    self_ref: Weak<Path>,
}

impl PathActor {
    fn set_state(&mut self, state: PathState) {
        self.state = state;
        self.state_tag
            .store(StateTag::from(state) as u8, Ordering::Release);
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<PathCommand>) {
        log::info!("[Path {}] actor starting", self.name);
        if self.config.source.is_on_demand_capable() && !self.config.source_on_demand {
            // Eagerly-started source: begin connecting immediately rather
            // than waiting for the first reader.
            self.start_static_source();
        }
        while let Some(cmd) = inbox.recv().await {
            match cmd {
                PathCommand::AttachPublisher {
                    description,
                    remote_addr,
                    transport,
                    reply,
                } => {
                    let result = self.handle_attach_publisher(description, remote_addr, transport);
                    let _ = reply.send(result);
                }
                PathCommand::AttachReader {
                    remote_addr,
                    transport,
                    reply,
                } => {
                    let result = self.handle_attach_reader(remote_addr, transport);
                    let _ = reply.send(result);
                }
                PathCommand::DetachSession { id } => {
                    self.handle_detach(id);
                }
                PathCommand::StaticSourceReady { description, reply } => {
                    let result = self.handle_static_source_ready(description);
                    let _ = reply.send(result);
                }
                PathCommand::StaticSourceError { cause } => {
                    self.handle_static_source_error(cause);
                }
                PathCommand::IdleCloseTimeout => {
                    self.handle_idle_close_timeout();
                }
                PathCommand::ConfigReplaced { config, captures } => {
                    self.handle_config_replaced(config, captures);
                }
                PathCommand::Shutdown => {
                    self.teardown();
                    break;
                }
            }
        }
        log::info!("[Path {}] actor stopped", self.name);
    }

    /// Applies an in-place config reload (`PathManager::apply_config` only
    /// sends this when the diff is not restart-worthy: hooks, fallback,
    /// override policy, passphrases, recent-units window). The running
    /// stream, publisher, and static source are left untouched.
    fn handle_config_replaced(&mut self, config: PathConfig, captures: Vec<String>) {
        let fallback = config.fallback.clone();
        self.config = config;
        self.captures = captures;
        if let Some(path) = self.self_ref.upgrade() {
            path.set_fallback(fallback);
        }
        log::info!("[Path {}] configuration reloaded in place", self.name);
    }

    fn handle_attach_publisher(
        &mut self,
        description: SessionDescription,
        remote_addr: Option<std::net::SocketAddr>,
        transport: Transport,
    ) -> PathmuxResult<(SessionGuard, Arc<Stream>)> {
        if let Some(previous) = self.publisher {
            if !self.config.override_publisher {
                return Err(PathmuxError::AlreadyPublishing(self.name.clone()));
            }
            log::info!("[Path {}] overriding existing publisher", self.name);
            self.sessions.terminate(previous, PathmuxError::Replaced);
            self.sessions.detach_all();
            self.stream = None;
        }

        let stream = Arc::new(Stream::new(description, self.deps.queue_capacity, self.config.recent_units_window));
        let guard = self.sessions.register(SessionKind::Publisher, transport, remote_addr);
        self.publisher = Some(guard.id());
        self.stream = Some(Arc::clone(&stream));
        self.cancel_idle_close_timer();
        self.set_state(PathState::Ready);
        self.release_pending_readers(SourceSignal::Ready(Arc::clone(&stream)));
        log::info!("[Path {}] publisher attached, path ready", self.name);
        Ok((guard, stream))
    }

    fn handle_attach_reader(
        &mut self,
        remote_addr: Option<std::net::SocketAddr>,
        transport: Transport,
    ) -> PathmuxResult<(SessionGuard, AttachReaderOutcome)> {
        let guard = self.sessions.register(SessionKind::Reader, transport, remote_addr);

        if let Some(stream) = &self.stream {
            self.cancel_idle_close_timer();
            return Ok((guard, AttachReaderOutcome::Ready(Arc::clone(stream))));
        }

        match self.state {
            PathState::StartingSource => {
                let rx = self.subscribe_pending();
                Ok((guard, AttachReaderOutcome::Pending(rx)))
            }
            PathState::Idle if self.config.source.is_on_demand_capable() => {
                // Subscribe before starting the source: a factory can fail
                // synchronously, and `start_static_source` releases the
                // pending-readers channel on that path, so the channel must
                // already exist.
                let rx = self.subscribe_pending();
                self.start_static_source();
                Ok((guard, AttachReaderOutcome::Pending(rx)))
            }
            _ => {
                if matches!(self.config.source, crate::config::SourceKind::Publisher) {
                    if let Some(target) = &self.config.fallback {
                        log::info!(
                            "[Path {}] no publisher, redirecting reader to fallback {target}",
                            self.name
                        );
                        return Ok((guard, AttachReaderOutcome::Redirect(target.clone())));
                    }
                }
                guard.detach();
                Err(PathmuxError::SourceUnavailable(format!(
                    "path {} has no source and none can be started on demand",
                    self.name
                )))
            }
        }
    }

    fn subscribe_pending(&mut self) -> watch::Receiver<SourceSignal> {
        if self.pending_readers_tx.is_none() {
            let (tx, _rx) = watch::channel(SourceSignal::Waiting);
            self.pending_readers_tx = Some(tx);
        }
        self.pending_readers_tx.as_ref().unwrap().subscribe()
    }

    fn release_pending_readers(&mut self, signal: SourceSignal) {
        if let Some(tx) = self.pending_readers_tx.take() {
            let _ = tx.send(signal);
        }
    }

    fn start_static_source(&mut self) {
        self.set_state(PathState::StartingSource);
        let factory = &self.deps.source_factory;
        match factory.create(&self.config.source, &self.captures) {
            Ok(source) => {
                let source_cancel = self.cancel.child_token();
                self.source_cancel = Some(source_cancel.clone());
                SourceRunner::spawn(
                    self.self_ref.clone(),
                    source,
                    Arc::clone(&self.deps.spawner),
                    source_cancel,
                );
                self.arm_start_timeout();
            }
            Err(e) => {
                log::warn!("[Path {}] could not create static source: {e}", self.name);
                self.set_state(PathState::Idle);
                self.release_pending_readers(SourceSignal::Failed(e.to_string()));
            }
        }
    }

    fn arm_start_timeout(&mut self) {
        let timeout = self.config.source_on_demand_start_timeout.as_duration();
        let path = self.self_ref.clone();
        let timeout_cancel = self.cancel.child_token();
        self.start_timeout_cancel = Some(timeout_cancel.clone());
        self.deps.spawner.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    if let Some(path) = path.upgrade() {
                        // Reuses the ordinary inbox path so the timeout is
                        // serialized with every other state transition.
                        let _ = path.inbox.send(PathCommand::StaticSourceError {
                            cause: "source did not become ready before the start timeout".to_string(),
                        });
                    }
                }
                _ = timeout_cancel.cancelled() => {}
            }
        });
    }

    fn handle_static_source_ready(&mut self, description: SessionDescription) -> PathmuxResult<Arc<Stream>> {
        if self.cancel.is_cancelled() {
            return Err(PathmuxError::Terminated);
        }
        if let Some(token) = self.start_timeout_cancel.take() {
            token.cancel();
        }
        let stream = Arc::new(Stream::new(description, self.deps.queue_capacity, self.config.recent_units_window));
        self.stream = Some(Arc::clone(&stream));
        self.set_state(PathState::Ready);
        self.release_pending_readers(SourceSignal::Ready(Arc::clone(&stream)));
        log::info!("[Path {}] static source ready", self.name);
        Ok(stream)
    }

    fn handle_static_source_error(&mut self, cause: String) {
        log::warn!("[Path {}] static source error: {cause}", self.name);
        if matches!(self.state, PathState::StartingSource) {
            self.set_state(PathState::Idle);
            self.release_pending_readers(SourceSignal::Failed(cause));
            if let Some(token) = self.source_cancel.take() {
                token.cancel();
            }
            if let Some(token) = self.start_timeout_cancel.take() {
                token.cancel();
            }
        }
        // If already Ready, the source runner will respawn on its own
        // schedule; the existing stream (and its recent-units ring) stays
        // live for readers in the meantime.
    }

    fn handle_detach(&mut self, id: uuid::Uuid) {
        if Some(id) == self.publisher {
            self.publisher = None;
            if !self.config.source.is_on_demand_capable() {
                // The stream ends; readers already attached observe it close
                // the same way regardless of `fallback`. A fallback target
                // only changes what a *subsequent* `attach_reader` call sees
                // (redirected instead of `SourceUnavailable`) once the path
                // has no stream, handled in `handle_attach_reader`.
                if let Some(fallback) = &self.config.fallback {
                    log::info!(
                        "[Path {}] publisher left, new readers will be redirected to {fallback}",
                        self.name
                    );
                } else {
                    log::info!("[Path {}] publisher detached, path idle", self.name);
                }
                if let Some(stream) = self.stream.take() {
                    stream.close();
                }
                self.set_state(PathState::Idle);
            }
        }
        if self.sessions.count_by_kind(SessionKind::Reader) == 0
            && self.config.source.is_on_demand_capable()
            && matches!(self.state, PathState::Ready)
        {
            self.arm_idle_close_timer();
        }
    }

    fn arm_idle_close_timer(&mut self) {
        self.cancel_idle_close_timer();
        let close_after = self.config.source_on_demand_close_after.as_duration();
        if close_after == Duration::ZERO {
            return;
        }
        let token = self.cancel.child_token();
        self.idle_close_handle = Some(token.clone());
        let path = self.self_ref.clone();
        self.deps.spawner.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(close_after) => {
                    if let Some(path) = path.upgrade() {
                        let _ = path.inbox.send(PathCommand::IdleCloseTimeout);
                    }
                }
                _ = token.cancelled() => {}
            }
        });
    }

    fn cancel_idle_close_timer(&mut self) {
        if let Some(token) = self.idle_close_handle.take() {
            token.cancel();
        }
    }

    fn handle_idle_close_timeout(&mut self) {
        if self.sessions.count_by_kind(SessionKind::Reader) > 0 {
            return;
        }
        log::info!("[Path {}] idle-close timeout, stopping static source", self.name);
        self.set_state(PathState::ClosingSource);
        if let Some(token) = self.source_cancel.take() {
            token.cancel();
        }
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        self.set_state(PathState::Idle);
    }

    fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(token) = self.source_cancel.take() {
            token.cancel();
        }
        self.cancel_idle_close_timer();
        self.sessions.detach_all();
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
        self.release_pending_readers(SourceSignal::Failed("path shut down".into()));
        self.set_state(PathState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathConfig;
    use crate::runtime::TokioSpawner;
    use crate::sample::{CodecParameters, Format, Media, MediaKind};
    use crate::static_source::UnconfiguredSourceFactory;
    use std::sync::Weak as StdWeak;

    fn test_deps() -> PathDeps {
        PathDeps {
            manager: StdWeak::new(),
            spawner: Arc::new(TokioSpawner::current()),
            queue_capacity: 64,
            source_factory: Arc::new(UnconfiguredSourceFactory),
        }
    }

    fn h264_description() -> SessionDescription {
        SessionDescription::new(vec![Media::new(
            MediaKind::Video,
            vec![Format::new(
                90_000,
                CodecParameters::H264 {
                    sps: vec![],
                    pps: vec![],
                },
            )],
        )])
    }

    #[tokio::test]
    async fn publisher_attach_makes_path_ready_and_admits_reader() {
        let path = Path::new("cam1".into(), PathConfig::default(), vec![], test_deps());
        let (_pub_guard, _stream) = path.attach_publisher(h264_description(), None, Transport::Rtsp).await.unwrap();

        let (_reader_guard, outcome) = path.attach_reader(None, Transport::Hls).await.unwrap();
        assert!(matches!(outcome, AttachReaderOutcome::Ready(_)));
    }

    #[tokio::test]
    async fn second_publisher_rejected_without_override() {
        let path = Path::new("cam1".into(), PathConfig::default(), vec![], test_deps());
        let (_guard, _stream) = path.attach_publisher(h264_description(), None, Transport::Rtsp).await.unwrap();
        let second = path.attach_publisher(h264_description(), None, Transport::Rtsp).await;
        assert!(matches!(second, Err(PathmuxError::AlreadyPublishing(_))));
    }

    #[tokio::test]
    async fn override_publisher_evicts_previous_one() {
        let config = PathConfig {
            override_publisher: true,
            ..Default::default()
        };
        let path = Path::new("cam1".into(), config, vec![], test_deps());
        let (guard1, _stream1) = path.attach_publisher(h264_description(), None, Transport::Rtsp).await.unwrap();
        let second = path.attach_publisher(h264_description(), None, Transport::Rtsp).await;
        assert!(second.is_ok());
        let reason = tokio::time::timeout(Duration::from_millis(100), guard1.wait_terminated())
            .await
            .expect("evicted publisher should be notified promptly");
        assert!(matches!(reason, PathmuxError::Replaced));
    }

    #[tokio::test]
    async fn reader_on_path_without_source_and_no_on_demand_fails() {
        let path = Path::new("cam1".into(), PathConfig::default(), vec![], test_deps());
        let result = path.attach_reader(None, Transport::Hls).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn on_demand_reader_waits_then_fails_without_source_factory() {
        let config = PathConfig {
            source: crate::config::SourceKind::Url("rtsp://origin/live".into()),
            source_on_demand: true,
            ..Default::default()
        };
        let path = Path::new("cam1".into(), config, vec![], test_deps());
        let (_guard, outcome) = path.attach_reader(None, Transport::Rtsp).await.unwrap();
        match outcome {
            AttachReaderOutcome::Pending(mut rx) => {
                // UnconfiguredSourceFactory fails create() synchronously,
                // which the actor turns into an immediate Failed signal.
                rx.changed().await.ok();
                assert!(matches!(*rx.borrow(), SourceSignal::Failed(_)));
            }
            AttachReaderOutcome::Ready(_) => panic!("should not be ready without a source"),
            AttachReaderOutcome::Redirect(_) => panic!("on-demand source has no fallback"),
        }
    }

    #[tokio::test]
    async fn reader_on_publisher_path_with_fallback_is_redirected() {
        let config = PathConfig {
            fallback: Some("rtsp://backup/live".into()),
            ..Default::default()
        };
        let path = Path::new("cam1".into(), config, vec![], test_deps());
        let (_guard, outcome) = path.attach_reader(None, Transport::Hls).await.unwrap();
        match outcome {
            AttachReaderOutcome::Redirect(target) => assert_eq!(target, "rtsp://backup/live"),
            _ => panic!("expected a redirect to the configured fallback"),
        }
    }

    #[tokio::test]
    async fn describe_reports_reader_and_publisher_counts() {
        let path = Path::new("cam1".into(), PathConfig::default(), vec![], test_deps());
        let (_pub_guard, _stream) = path.attach_publisher(h264_description(), None, Transport::Rtsp).await.unwrap();
        let (_reader_guard, _) = path.attach_reader(None, Transport::Hls).await.unwrap();
        let desc = path.describe();
        assert_eq!(desc.name, "cam1");
    }

    #[tokio::test]
    async fn shutdown_stops_accepting_new_publishers() {
        let path = Path::new("cam1".into(), PathConfig::default(), vec![], test_deps());
        path.shutdown();
        tokio::task::yield_now().await;
        let result = path.attach_publisher(h264_description(), None, Transport::Rtsp).await;
        assert!(result.is_err());
    }
}
