//! Session: the engine-side handle to one external participant (publisher or
//! reader) attached to a Path.
//!
//! A `SessionRegistry` tracks every live session per Path and hands out a
//! `SessionGuard` whose `Drop` impl unregisters it, so a front-end that
//! panics or disconnects abruptly never leaves a stale entry behind.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::PathmuxError;

/// Whether a session is publishing into a Path or reading from one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Publisher,
    Reader,
}

/// Transport a session is using, for introspection via the management API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Rtsp,
    Rtmp,
    Hls,
    WebRtc,
    Srt,
    Udp,
    RpiCamera,
    StaticSource,
}

/// Identity and accounting for one session.
pub struct SessionInfo {
    pub id: Uuid,
    pub kind: SessionKind,
    pub transport: Transport,
    pub remote_addr: Option<SocketAddr>,
    pub created_at_unix_millis: u64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub units_sent: AtomicU64,
    /// Fires once with a reason when the Path terminates this specific
    /// session out of band (publisher override, config-driven removal). A
    /// front-end task awaits this alongside its I/O loop to learn *why* it
    /// was cut off rather than just observing a closed stream.
    termination: watch::Sender<Option<PathmuxError>>,
}

impl SessionInfo {
    fn new(kind: SessionKind, transport: Transport, remote_addr: Option<SocketAddr>) -> Self {
        let created_at_unix_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let (termination, _rx) = watch::channel(None);
        Self {
            id: Uuid::new_v4(),
            kind,
            transport,
            remote_addr,
            created_at_unix_millis,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            units_sent: AtomicU64::new(0),
            termination,
        }
    }
}

/// Tracks every session attached to one Path.
///
/// Thread-safe and designed for concurrent attach/detach from many
/// protocol-handler tasks at once.
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<SessionInfo>>,
    global_cancel: parking_lot::RwLock<CancellationToken>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            global_cancel: parking_lot::RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a new session and returns a guard for RAII cleanup. The
    /// returned `SessionGuard` unregisters the session when dropped, whether
    /// that happens via an explicit `detach()` or because the owning task
    /// panicked or was aborted.
    pub fn register(
        self: &Arc<Self>,
        kind: SessionKind,
        transport: Transport,
        remote_addr: Option<SocketAddr>,
    ) -> SessionGuard {
        let info = Arc::new(SessionInfo::new(kind, transport, remote_addr));
        let cancel_token = self.global_cancel.read().child_token();
        self.sessions.insert(info.id, Arc::clone(&info));
        log::info!(
            "[Session] attached {:?} session {} (total: {})",
            kind,
            info.id,
            self.sessions.len()
        );
        SessionGuard {
            info,
            registry: Arc::clone(self),
            cancel_token,
        }
    }

    /// Delivers a termination reason to one specific session (e.g.
    /// `PathmuxError::Replaced` for a publisher evicted by an override),
    /// without touching any other session attached to the same path.
    pub fn terminate(&self, id: Uuid, reason: PathmuxError) {
        if let Some(info) = self.sessions.get(&id) {
            let _ = info.termination.send(Some(reason));
        }
    }

    fn unregister(&self, id: Uuid) {
        if self.sessions.remove(&id).is_some() {
            log::info!(
                "[Session] detached {} (remaining: {})",
                id,
                self.sessions.len()
            );
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn count_by_kind(&self, kind: SessionKind) -> usize {
        self.sessions.iter().filter(|e| e.kind == kind).count()
    }

    pub fn list(&self) -> Vec<Arc<SessionInfo>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Forcibly detaches every session. Used when a Path tears down (config
    /// removed, or transitioning out of Ready). A fresh token is installed
    /// afterward so subsequently-registered sessions are not pre-cancelled.
    pub fn detach_all(&self) -> usize {
        let count = self.sessions.len();
        if count > 0 {
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that unregisters a session when dropped.
pub struct SessionGuard {
    info: Arc<SessionInfo>,
    registry: Arc<SessionRegistry>,
    cancel_token: CancellationToken,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Cancellation token for this specific session; cancelled individually
    /// on publisher override, or all at once via `SessionRegistry::detach_all`.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Waits for `SessionRegistry::terminate` to deliver a reason for this
    /// session specifically (e.g. `Replaced`), resolving to `Terminated` if
    /// the session is dropped first without one ever being sent.
    pub async fn wait_terminated(&self) -> PathmuxError {
        let mut rx = self.info.termination.subscribe();
        if let Some(reason) = rx.borrow().clone() {
            return reason;
        }
        match rx.changed().await {
            Ok(()) => rx.borrow().clone().unwrap_or(PathmuxError::Terminated),
            Err(_) => PathmuxError::Terminated,
        }
    }

    /// Explicit detach. Equivalent to dropping the guard, but lets a caller
    /// detach without giving up ownership of other fields first.
    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.info.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_drop_unregisters() {
        let registry = Arc::new(SessionRegistry::new());
        {
            let _guard = registry.register(SessionKind::Publisher, Transport::Rtsp, None);
            assert_eq!(registry.count(), 1);
        }
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn count_by_kind_distinguishes_publishers_and_readers() {
        let registry = Arc::new(SessionRegistry::new());
        let _pub_guard = registry.register(SessionKind::Publisher, Transport::Rtmp, None);
        let _reader_guard = registry.register(SessionKind::Reader, Transport::Hls, None);
        assert_eq!(registry.count_by_kind(SessionKind::Publisher), 1);
        assert_eq!(registry.count_by_kind(SessionKind::Reader), 1);
    }

    #[test]
    fn detach_all_cancels_existing_tokens() {
        let registry = Arc::new(SessionRegistry::new());
        let guard = registry.register(SessionKind::Reader, Transport::WebRtc, None);
        let token = guard.cancel_token().clone();
        assert!(!token.is_cancelled());
        registry.detach_all();
        assert!(token.is_cancelled());
    }
}
