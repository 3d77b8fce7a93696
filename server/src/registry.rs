//! Session registry: the single authority mapping a device to its live session.
//!
//! ## Invariants
//!
//! - At most one session per device id. [`SessionRegistry::register`] for an
//!   already-registered device closes the previous session before the new
//!   one becomes visible (last writer wins).
//! - A session's outbound buffer has exactly one strong sender, owned by its
//!   registry entry. Removing the entry drops that sender, which closes the
//!   buffer; the session's write loop drains what is left and closes the
//!   socket. Producers that hit a closed buffer get [`SendError::NotConnected`].
//!
//! ## Concurrency
//!
//! The map sits behind a `RwLock`. `register`, `unregister`, `sweep_idle` and
//! `shutdown` take the write lock, so mutations are serialized and readers
//! never see a half-applied change. `send`, `lookup` and the enumeration
//! queries share the read lock and never wait on socket I/O: `send` uses
//! `try_send` and reports a full buffer as [`SendError::Backpressure`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::SendError;
use crate::models::{DeviceId, UserId};
use crate::protocol::ServerMessage;

/// Process-unique id of one device connection.
pub type SessionId = u64;

#[derive(Debug, Error)]
#[error("session registry is shut down")]
pub struct RegistryClosed;

/// Registry-side half of a device session.
pub struct SessionHandle {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub user_id: UserId,
    outbound: mpsc::Sender<ServerMessage>,
    shutdown_tx: watch::Sender<bool>,
    last_activity_ms: Arc<AtomicU64>,
    connected_since: Instant,
}

impl SessionHandle {
    /// Close the session: signal its loops to stop and drop the only strong
    /// sender of its outbound buffer. Consumes the handle, so this can only
    /// happen once.
    fn close(self, reason: &str) {
        debug!(
            device_id = %self.device_id,
            session_id = self.session_id,
            reason,
            "Closing device session"
        );
        let _ = self.shutdown_tx.send(true);
    }
}

/// Outcome of [`SessionRegistry::unregister_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unregistered {
    /// The session was current and has been removed.
    Removed,
    /// Nothing is registered for the device any more (evicted, unregistered
    /// or shut down).
    AlreadyGone,
    /// Another session now owns the device.
    Replaced,
}

impl Unregistered {
    /// Whether the device has no live session after this call.
    pub fn device_offline(self) -> bool {
        !matches!(self, Self::Replaced)
    }
}

/// Receiving end of a session's outbound buffer. Drained by the session's
/// write loop only.
pub type OutboundRx = mpsc::Receiver<ServerMessage>;

/// Session-side half held by the read loop.
pub struct SessionEndpoint {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub user_id: UserId,
    /// Lets the session answer its own device (e.g. `PONG`) without keeping
    /// the buffer open after the registry closed it.
    pub reply_tx: mpsc::WeakSender<ServerMessage>,
    /// Flips to `true` when the registry closes this session.
    pub shutdown_rx: watch::Receiver<bool>,
    last_activity_ms: Arc<AtomicU64>,
    epoch: Instant,
}

impl SessionEndpoint {
    /// Record inbound traffic for liveness tracking.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(elapsed_ms(self.epoch), Ordering::Relaxed);
    }

    /// Queue a reply on this session's own buffer.
    pub fn reply(&self, msg: ServerMessage) -> Result<(), SendError> {
        let tx = self.reply_tx.upgrade().ok_or(SendError::NotConnected)?;
        try_send(&tx, msg)
    }
}

/// Point-in-time view of a registered session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub user_id: UserId,
    pub connected_for: Duration,
    pub idle_for: Duration,
}

struct RegistryState {
    sessions: HashMap<DeviceId, SessionHandle>,
    closed: bool,
}

struct Inner {
    state: RwLock<RegistryState>,
    next_session_id: AtomicU64,
    send_buffer: usize,
    epoch: Instant,
}

/// Shared registry of live device sessions. Cloning shares the same map.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    /// Create an empty registry whose sessions get outbound buffers of
    /// `send_buffer` messages.
    pub fn new(send_buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(RegistryState {
                    sessions: HashMap::new(),
                    closed: false,
                }),
                next_session_id: AtomicU64::new(1),
                send_buffer: send_buffer.max(1),
                epoch: Instant::now(),
            }),
        }
    }

    /// Allocate a new session: the registry-side handle, the read loop's
    /// endpoint and the write loop's receiver. Nothing is visible to other
    /// callers until the handle is passed to [`register`](Self::register).
    pub fn new_session(
        &self,
        device_id: DeviceId,
        user_id: UserId,
    ) -> (SessionHandle, SessionEndpoint, OutboundRx) {
        let session_id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (outbound, outbound_rx) = mpsc::channel(self.inner.send_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let last_activity_ms = Arc::new(AtomicU64::new(elapsed_ms(self.inner.epoch)));
        let reply_tx = outbound.downgrade();

        let handle = SessionHandle {
            session_id,
            device_id,
            user_id,
            outbound,
            shutdown_tx,
            last_activity_ms: last_activity_ms.clone(),
            connected_since: Instant::now(),
        };
        let endpoint = SessionEndpoint {
            session_id,
            device_id,
            user_id,
            reply_tx,
            shutdown_rx,
            last_activity_ms,
            epoch: self.inner.epoch,
        };
        (handle, endpoint, outbound_rx)
    }

    /// Install a session under its device id, closing any previous session
    /// for that device first.
    pub async fn register(&self, handle: SessionHandle) -> Result<(), RegistryClosed> {
        let mut state = self.inner.state.write().await;
        if state.closed {
            handle.close("registry shut down");
            return Err(RegistryClosed);
        }
        if let Some(old) = state.sessions.remove(&handle.device_id) {
            warn!(
                device_id = %handle.device_id,
                old_session = old.session_id,
                new_session = handle.session_id,
                "Device re-registering while another session exists, closing old"
            );
            old.close("replaced by new connection");
        }
        info!(
            device_id = %handle.device_id,
            user_id = %handle.user_id,
            session_id = handle.session_id,
            "Device session registered"
        );
        state.sessions.insert(handle.device_id, handle);
        Ok(())
    }

    /// Remove and close the device's session. No-op if absent.
    pub async fn unregister(&self, device_id: DeviceId) -> bool {
        let removed = self.inner.state.write().await.sessions.remove(&device_id);
        match removed {
            Some(handle) => {
                handle.close("unregistered");
                true
            }
            None => false,
        }
    }

    /// Remove the device's session only if it is still `session_id`. Used by a
    /// session tearing itself down, so a stale connection never evicts the
    /// session that replaced it.
    pub async fn unregister_session(&self, device_id: DeviceId, session_id: SessionId) -> Unregistered {
        let mut state = self.inner.state.write().await;
        let current = state.sessions.get(&device_id).map(|h| h.session_id);
        match current {
            None => Unregistered::AlreadyGone,
            Some(id) if id != session_id => Unregistered::Replaced,
            Some(_) => {
                if let Some(handle) = state.sessions.remove(&device_id) {
                    handle.close("session ended");
                }
                Unregistered::Removed
            }
        }
    }

    pub async fn lookup(&self, device_id: DeviceId) -> Option<SessionInfo> {
        let state = self.inner.state.read().await;
        state
            .sessions
            .get(&device_id)
            .map(|h| self.info_for(h))
    }

    pub async fn is_online(&self, device_id: DeviceId) -> bool {
        self.inner
            .state
            .read()
            .await
            .sessions
            .contains_key(&device_id)
    }

    /// Online devices of `user_id`, longest-connected first.
    pub async fn online_devices_for_user(&self, user_id: UserId) -> Vec<DeviceId> {
        let state = self.inner.state.read().await;
        let mut online: Vec<(SessionId, DeviceId)> = state
            .sessions
            .values()
            .filter(|h| h.user_id == user_id)
            .map(|h| (h.session_id, h.device_id))
            .collect();
        online.sort_unstable_by_key(|(session_id, _)| *session_id);
        online.into_iter().map(|(_, device_id)| device_id).collect()
    }

    /// Queue a message on the device's outbound buffer without waiting.
    pub async fn send(&self, device_id: DeviceId, msg: ServerMessage) -> Result<(), SendError> {
        let state = self.inner.state.read().await;
        let handle = state
            .sessions
            .get(&device_id)
            .ok_or(SendError::NotConnected)?;
        try_send(&handle.outbound, msg)
    }

    pub async fn len(&self) -> usize {
        self.inner.state.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Evict sessions with no inbound traffic for longer than `timeout`.
    /// Returns the evicted device ids.
    ///
    /// Single write-lock pass so a session cannot refresh its timestamp between
    /// the check and the removal.
    pub async fn sweep_idle(&self, timeout: Duration) -> Vec<DeviceId> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let now_ms = elapsed_ms(self.inner.epoch);

        let mut state = self.inner.state.write().await;
        let dead: Vec<DeviceId> = state
            .sessions
            .values()
            .filter(|h| now_ms.saturating_sub(h.last_activity_ms.load(Ordering::Relaxed)) > timeout_ms)
            .map(|h| h.device_id)
            .collect();
        for device_id in &dead {
            if let Some(handle) = state.sessions.remove(device_id) {
                warn!(device_id = %device_id, "Evicted device session (read deadline exceeded)");
                handle.close("idle timeout");
            }
        }
        dead
    }

    /// Close every session and refuse further registrations.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.write().await;
        state.closed = true;
        let count = state.sessions.len();
        for (_, handle) in state.sessions.drain() {
            handle.close("server shutting down");
        }
        info!(count, "Session registry shut down");
    }

    fn info_for(&self, handle: &SessionHandle) -> SessionInfo {
        let now_ms = elapsed_ms(self.inner.epoch);
        let last = handle.last_activity_ms.load(Ordering::Relaxed);
        SessionInfo {
            session_id: handle.session_id,
            device_id: handle.device_id,
            user_id: handle.user_id,
            connected_for: handle.connected_since.elapsed(),
            idle_for: Duration::from_millis(now_ms.saturating_sub(last)),
        }
    }
}

fn try_send(tx: &mpsc::Sender<ServerMessage>, msg: ServerMessage) -> Result<(), SendError> {
    tx.try_send(msg).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => SendError::Backpressure,
        mpsc::error::TrySendError::Closed(_) => SendError::NotConnected,
    })
}

fn elapsed_ms(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}
