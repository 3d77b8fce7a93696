//! HTTP route handlers.
//!
//! | Method | Path                  | Auth | Description                         |
//! |--------|-----------------------|------|-------------------------------------|
//! | GET    | `/api/health`         | No   | Liveness probe                      |
//! | GET    | `/api/device/ws`      | AUTH* | Device WebSocket                   |
//! | POST   | `/api/sms/send`       | Yes  | Queue an SMS on one of the user's devices |
//! | GET    | `/api/devices/online` | Yes  | The user's connected devices        |
//!
//! *Devices authenticate in-band with an `AUTH` frame after the upgrade.
//! Authenticated routes go through [`crate::auth::require_api_key`].

pub mod device;
pub mod health;
pub mod sms;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::state::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(health::health))
        .route("/api/device/ws", get(device::device_ws));

    let authed_routes = Router::new()
        .route("/api/sms/send", post(sms::send_sms))
        .route("/api/devices/online", get(sms::online_devices))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
