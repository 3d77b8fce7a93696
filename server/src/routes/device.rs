//! Device WebSocket endpoint.

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use tracing::debug;

use crate::session;
use crate::AppState;

/// Largest frame the transport accepts (axum's default message cap). Frames
/// between the protocol limit and this reach the session, which drops them
/// and keeps the connection.
const TRANSPORT_LIMIT: usize = 64 << 20;

/// `GET /api/device/ws`: upgrade and hand the socket to a device session.
pub async fn device_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let transport_limit = TRANSPORT_LIMIT.max(state.session.max_message_size);
    debug!("Device connecting...");
    ws.max_message_size(transport_limit)
        .max_frame_size(transport_limit)
        .on_upgrade(move |socket| session::run(socket, state))
}
