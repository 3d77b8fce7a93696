//! API key authentication for the HTTP surface.
//!
//! Command endpoints require an `Authorization: Bearer <api key>` header. The
//! key is resolved through the [`AccountStore`](crate::store::AccountStore)
//! and the matching [`Account`] is attached to the request as an extension.
//! `/api/health` and the device WebSocket are open: devices authenticate
//! in-band with `AUTH`.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::models::Account;
use crate::state::AppState;

/// Axum middleware that rejects requests without a known Bearer API key.
///
/// # Error responses
///
/// - `401 Unauthorized`: header missing or malformed
/// - `403 Forbidden`: key present but unknown
/// - `500 Internal Server Error`: account lookup failed
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(provided) = bearer_token(&request) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header"})),
        )
            .into_response();
    };

    let account = match state.stores.accounts.user_by_api_key(provided).await {
        Ok(Some(account)) => account,
        Ok(None) => {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({"error": "Invalid API key"})),
            )
                .into_response();
        }
        Err(e) => {
            error!("Account lookup failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Account lookup failed"})),
            )
                .into_response();
        }
    };

    request.extensions_mut().insert::<Account>(account);
    next.run(request).await
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(header: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/api/sms/send");
        if let Some(h) = header {
            builder = builder.header("authorization", h);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(&request(Some("Bearer key-1"))), Some("key-1"));
        assert_eq!(bearer_token(&request(Some("Bearer "))), None);
        assert_eq!(bearer_token(&request(Some("Basic abc"))), None);
        assert_eq!(bearer_token(&request(None)), None);
    }
}
