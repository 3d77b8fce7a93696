//! Outbound SMS commands and device presence.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::json;

use crate::error::CommandError;
use crate::models::Account;
use crate::outbound::{self, SendSmsRequest};
use crate::AppState;

/// `POST /api/sms/send`: queue an SMS on one of the caller's devices.
///
/// Responds `202 Accepted` with `{request_id, status: "queued", device_id}`.
/// The device later reports `SMS_SENT` / `SMS_FAILED` against `request_id`.
pub async fn send_sms(
    State(state): State<AppState>,
    Extension(account): Extension<Account>,
    Json(req): Json<SendSmsRequest>,
) -> Response {
    match outbound::send_sms(&state.registry, &state.stores, account.id, req).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => command_error(&e),
    }
}

/// `GET /api/devices/online`: the caller's connected devices, longest
/// connected first.
pub async fn online_devices(
    State(state): State<AppState>,
    Extension(account): Extension<Account>,
) -> Json<serde_json::Value> {
    let mut devices = Vec::new();
    for device_id in state.registry.online_devices_for_user(account.id).await {
        if let Some(info) = state.registry.lookup(device_id).await {
            devices.push(json!({
                "device_id": info.device_id,
                "connected_secs": info.connected_for.as_secs(),
                "idle_secs": info.idle_for.as_secs(),
            }));
        }
    }
    Json(json!({ "devices": devices }))
}

fn command_error(e: &CommandError) -> Response {
    let status = match e {
        CommandError::Invalid(_) => StatusCode::BAD_REQUEST,
        CommandError::DeviceNotFound | CommandError::DeviceOffline | CommandError::NoOnlineDevice => {
            StatusCode::NOT_FOUND
        }
        CommandError::Send(_) => StatusCode::SERVICE_UNAVAILABLE,
        CommandError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}
