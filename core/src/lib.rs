//! pathmux-core - the path-centric stream fan-out engine.
//!
//! This crate implements the protocol-independent core of a multi-protocol
//! live media server: a named rendezvous point (a [`path::Path`]) between one
//! publisher and many readers, fed either by an attached publisher or an
//! on-demand pull source, with configuration loading, authentication, and a
//! management HTTP API around it.
//!
//! # Architecture
//!
//! - [`sample`]: the data model flowing through the engine (codec-tagged
//!   sample units, tracks, session descriptions)
//! - [`stream`]: per-path fan-out substrate (broadcast channel + recent-units
//!   ring) a `Path` becomes once it has a live source
//! - [`session`]: accounting for one external participant attached to a path
//! - [`path`]: the per-path state machine
//! - [`path_manager`]: the name → `Path` registry and regex-entry matching
//! - [`static_source`]: the pull-source supervisor seam
//! - [`auth`]: the authenticator (internal rules, HTTP hook, JWT)
//! - [`config`]: configuration schema, YAML + env loading, `ConfigWatcher`
//! - [`bootstrap`]: the composition root wiring the above together
//! - [`runtime`]: task spawning abstraction for runtime independence
//! - [`api`]: the management HTTP API (path-configuration CRUD,)
//! - [`error`]: centralized error types
//!
//! Wire-level protocol packetization (RTSP/RTMP/HLS/WebRTC/SRT), recording to
//! disk, a playback server, and hook command execution are deliberately out
//! of scope for this core; [`static_source::StaticSourceFactory`] is the seam
//! a concrete protocol crate plugs into.

#![warn(clippy::all)]

pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod path;
pub mod path_manager;
pub mod runtime;
pub mod sample;
pub mod session;
pub mod static_source;
pub mod stream;

pub use api::{start_server, AppState, ServerError};
pub use auth::{AuthRequest, Authenticator};
pub use bootstrap::{bootstrap_services, bootstrap_services_with_source_factory, BootstrappedServices};
pub use config::{ConfigWatcher, MtxDuration, PathConfig, PathmuxConfig};
pub use error::{ErrorCode, PathmuxError, PathmuxResult};
pub use path::{AttachReaderOutcome, Path, PathDeps, PathDescription, PathState, SourceSignal};
pub use path_manager::{ConfigDiff, PathManager};
pub use runtime::{BoxFuture, SpawnExt, TaskSpawner, TokioSpawner};
pub use sample::{
    CodecParameters, Format, Media, MediaKind, Payload, SampleUnit, SessionDescription,
};
pub use session::{SessionGuard, SessionInfo, SessionKind, SessionRegistry, Transport};
pub use static_source::{
    SourceRunner, StaticSource, StaticSourceContext, StaticSourceFactory, StaticSourceHandle,
    UnconfiguredSourceFactory,
};
pub use stream::{ReaderHandle, Stream};
