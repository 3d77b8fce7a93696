//! Device session: one WebSocket connection to one device.
//!
//! ```text
//! Connecting ─► Authenticating ─► Active ─► Closing ─► Closed
//!                     │                                 ▲
//!                     └──── AUTH_FAIL / timeout ────────┘
//! ```
//!
//! The first frame must be `AUTH` and must arrive within the auth timeout.
//! Failure sends `AUTH_FAIL` on the raw socket and closes it; no registry
//! entry is ever created for that connection.
//!
//! Once active, the session runs two loops:
//!
//! - **read loop** (this task): decodes frames in arrival order and hands
//!   them to the [`EventRouter`](crate::events::EventRouter). Each read is
//!   bounded by the read deadline; any inbound frame counts as liveness.
//! - **write loop** (spawned): the only consumer of the session's outbound
//!   buffer. Writes queued messages and sends a WebSocket ping on every
//!   heartbeat tick. Exits once the registry closes the buffer.
//!
//! Either loop failing ends the session. Teardown unregisters it only if it
//! is still the registered session for its device, and marks the device
//! offline unless a newer session has taken it over.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::error::{HandshakeError, StoreError};
use crate::events::Origin;
use crate::models::{default_device_name, Device};
use crate::protocol::{AuthData, AuthOkData, DeviceMessage, ServerMessage};
use crate::registry::{OutboundRx, SessionEndpoint, SessionId};
use crate::state::AppState;
use crate::store::Stores;

/// Timing and size limits for device sessions.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub auth_timeout: Duration,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_message_size: crate::protocol::MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

struct Lifecycle(SessionState);

impl Lifecycle {
    fn advance(&mut self, next: SessionState) {
        debug!(from = ?self.0, to = ?next, "Session state");
        self.0 = next;
    }
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Drive one device connection from upgrade to close.
pub async fn run(socket: WebSocket, state: AppState) {
    let settings = state.session;
    let mut lifecycle = Lifecycle(SessionState::Connecting);
    let (mut sink, mut stream) = socket.split();

    lifecycle.advance(SessionState::Authenticating);
    let handshake = tokio::time::timeout(
        settings.auth_timeout,
        authenticate(&mut stream, &state.stores, settings.max_message_size),
    )
    .await
    .unwrap_or(Err(HandshakeError::Timeout));

    let device = match handshake {
        Ok(device) => device,
        Err(e) => {
            reject(&mut sink, &e, settings.write_timeout).await;
            lifecycle.advance(SessionState::Closed);
            return;
        }
    };

    let span = tracing::info_span!(
        "device_session",
        device_id = %device.id,
        user_id = %device.user_id
    );
    run_active(sink, stream, state, device, lifecycle)
        .instrument(span)
        .await;
}

async fn run_active(
    mut sink: WsSink,
    mut stream: WsStream,
    state: AppState,
    device: Device,
    mut lifecycle: Lifecycle,
) {
    let settings = state.session;
    let (handle, mut endpoint, outbound_rx) = state.registry.new_session(device.id, device.user_id);
    let session_id = endpoint.session_id;
    if state.registry.register(handle).await.is_err() {
        reject(&mut sink, &HandshakeError::ShuttingDown, settings.write_timeout).await;
        lifecycle.advance(SessionState::Closed);
        return;
    }
    // After registering: a replaced session's teardown sees `Replaced` from
    // here on and leaves the store alone.
    if let Err(e) = state.stores.devices.set_online(device.id, device.battery).await {
        warn!("Failed to mark device online: {e}");
    }

    let ack = ServerMessage::AuthOk(AuthOkData {
        device_id: device.id,
    });
    if let Err(e) = send_text(&mut sink, ack.encode(), settings.write_timeout).await {
        warn!("Failed to send AUTH_OK: {e}");
        teardown(&state, &device, session_id, None).await;
        lifecycle.advance(SessionState::Closed);
        return;
    }
    lifecycle.advance(SessionState::Active);
    info!(session_id, "Device connected");

    let mut writer = tokio::spawn(write_loop(sink, outbound_rx, settings).in_current_span());
    let origin = Origin {
        device_id: device.id,
        user_id: device.user_id,
    };

    let mut writer_done = false;
    let reason = loop {
        let next = tokio::select! {
            next = tokio::time::timeout(settings.read_timeout, stream.next()) => next,
            _ = endpoint.shutdown_rx.changed() => break "closed by registry",
            _ = &mut writer => {
                writer_done = true;
                break "write failed";
            }
        };
        let msg = match next {
            Err(_) => break "read deadline exceeded",
            Ok(None) => break "connection closed",
            Ok(Some(Err(e))) => {
                debug!("WebSocket read error: {e}");
                break "read error";
            }
            Ok(Some(Ok(msg))) => msg,
        };
        endpoint.touch();
        match msg {
            Message::Text(text) => dispatch(&state, &endpoint, origin, text.as_str()),
            Message::Binary(_) => warn!("Dropping binary frame from device"),
            Message::Close(_) => break "closed by device",
            Message::Ping(_) | Message::Pong(_) => {}
        }
    };

    lifecycle.advance(SessionState::Closing);
    info!(session_id, reason, "Device session ending");
    teardown(&state, &device, session_id, (!writer_done).then_some(writer)).await;
    lifecycle.advance(SessionState::Closed);
}

/// Decode one inbound text frame and route it. Malformed or oversized frames
/// are dropped; the session stays up.
fn dispatch(state: &AppState, endpoint: &SessionEndpoint, origin: Origin, text: &str) {
    let msg = match DeviceMessage::decode(text, state.session.max_message_size) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Dropping frame: {e}");
            return;
        }
    };
    debug!(kind = msg.kind(), "Device frame");

    if matches!(msg, DeviceMessage::Ping(_)) {
        if let Err(e) = endpoint.reply(ServerMessage::pong()) {
            debug!("PONG not queued: {e}");
        }
    }

    // Store and queue work runs off the read loop so a slow collaborator
    // never delays the next frame.
    let events = state.events.clone();
    tokio::spawn(
        async move {
            events.handle(origin, msg).await;
        }
        .in_current_span(),
    );
}

/// Wait for the `AUTH` frame and resolve it to a device.
async fn authenticate(
    stream: &mut WsStream,
    stores: &Stores,
    max_message_size: usize,
) -> Result<Device, HandshakeError> {
    let text = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Binary(_))) => return Err(HandshakeError::ExpectedAuth),
            Some(Ok(Message::Close(_)) | Err(_)) | None => {
                return Err(HandshakeError::Disconnected)
            }
        }
    };
    let msg = DeviceMessage::decode(text.as_str(), max_message_size)
        .map_err(|e| HandshakeError::InvalidPayload(e.to_string()))?;
    let DeviceMessage::Auth(auth) = msg else {
        return Err(HandshakeError::ExpectedAuth);
    };
    resolve_device(stores, &auth).await
}

/// Map AUTH credentials to the device record, registering unknown devices
/// under the key's owner.
pub(crate) async fn resolve_device(stores: &Stores, auth: &AuthData) -> Result<Device, HandshakeError> {
    if auth.api_key.is_empty() || auth.device_uid.is_empty() {
        return Err(HandshakeError::InvalidPayload(
            "api_key and device_uid are required".into(),
        ));
    }
    let account = stores
        .accounts
        .user_by_api_key(&auth.api_key)
        .await?
        .ok_or(HandshakeError::Unauthorized)?;

    let device = match stores.devices.find_by_uid(&auth.device_uid).await? {
        Some(device) => device,
        None => match stores
            .devices
            .register(account.id, &default_device_name(), &auth.device_uid)
            .await
        {
            Ok(device) => {
                info!(device_id = %device.id, device_uid = %auth.device_uid, "Registered new device");
                device
            }
            // Lost a race with a concurrent first connection.
            Err(StoreError::Conflict(_)) => stores
                .devices
                .find_by_uid(&auth.device_uid)
                .await?
                .ok_or(HandshakeError::Store(StoreError::NotFound("device")))?,
            Err(e) => return Err(e.into()),
        },
    };

    if device.user_id != account.id {
        return Err(HandshakeError::Forbidden);
    }
    Ok(device)
}

/// Tell the device why it was refused, then close the socket.
async fn reject(sink: &mut WsSink, error: &HandshakeError, write_timeout: Duration) {
    warn!("Device handshake failed: {error}");
    if matches!(error, HandshakeError::Disconnected) {
        return;
    }
    let notice = ServerMessage::auth_fail(error.to_string()).encode();
    let _ = send_text(sink, notice, write_timeout).await;
    let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(None))).await;
}

async fn send_text(sink: &mut WsSink, text: String, write_timeout: Duration) -> Result<(), String> {
    match tokio::time::timeout(write_timeout, sink.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write timed out".to_string()),
    }
}

/// Sole consumer of the outbound buffer.
async fn write_loop(mut sink: WsSink, mut outbound_rx: OutboundRx, settings: SessionSettings) {
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    loop {
        let frame = tokio::select! {
            msg = outbound_rx.recv() => match msg {
                Some(msg) => Message::Text(msg.encode().into()),
                None => break,
            },
            _ = heartbeat.tick() => Message::Ping(Bytes::new()),
        };
        match tokio::time::timeout(settings.write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("WebSocket write failed: {e}");
                return;
            }
            Err(_) => {
                warn!("WebSocket write timed out");
                return;
            }
        }
    }
    // Buffer closed by the registry: everything queued has been written.
    let _ = tokio::time::timeout(settings.write_timeout, sink.send(Message::Close(None))).await;
}

async fn teardown(
    state: &AppState,
    device: &Device,
    session_id: SessionId,
    writer: Option<JoinHandle<()>>,
) {
    let outcome = state
        .registry
        .unregister_session(device.id, session_id)
        .await;

    if let Some(mut writer) = writer {
        // Unregistering closed the buffer; give the writer a bounded window
        // to flush and send Close.
        if tokio::time::timeout(state.session.write_timeout, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
    }

    if outcome.device_offline() {
        if let Err(e) = state.stores.devices.set_offline(device.id).await {
            warn!("Failed to mark device offline: {e}");
        }
    }
    info!(session_id, "Device disconnected");
}
