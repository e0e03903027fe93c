use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use super::auth::SESSION_COOKIE;
use super::cookie_value;
use crate::interfaces::web::AppState;

/// The logged-in user behind the session cookie, or 401.
pub(crate) async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(raw) = cookie_value(&headers, SESSION_COOKIE) else {
        return unauthorized();
    };
    match state.storage.validate_session_token(&raw).await {
        Ok(Some(user)) => Json(json!({ "success": true, "user": user })).into_response(),
        Ok(None) => unauthorized(),
        Err(e) => {
            error!("failed to validate session token: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "internal error" })),
            )
                .into_response()
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "success": false, "error": "not logged in" })),
    )
        .into_response()
}
