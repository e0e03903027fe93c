//! Login, callback, and logout endpoints.
//!
//! These are browser-facing: failures redirect back to the login page rather
//! than rendering an error body, because the user arrives here from a
//! provider redirect with no page of ours loaded.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use super::cookie_value;
use crate::core::auth::AuthFlowError;
use crate::core::storage::StateError;
use crate::interfaces::web::AppState;

pub(crate) const SESSION_COOKIE: &str = "feedr_token";
const LOGIN_FAILED_REDIRECT: &str = "/login?error=retry";

#[derive(Deserialize)]
pub(crate) struct BeginLoginQuery {
    redirect_uri: Option<String>,
}

pub(crate) async fn begin_login(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<BeginLoginQuery>,
) -> Response {
    let Some(handler) = state.auth.get(&provider) else {
        return unknown_provider(&provider);
    };
    match handler.begin_login(&state.storage, query.redirect_uri).await {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(e) => {
            error!(provider, "failed to begin login: {e}");
            Redirect::to(LOGIN_FAILED_REDIRECT).into_response()
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct CallbackQuery {
    code: String,
    state: String,
}

pub(crate) async fn complete_login(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(handler) = state.auth.get(&provider) else {
        return unknown_provider(&provider);
    };
    let result = handler
        .complete_login(&state.storage, &state.http, &query.code, &query.state)
        .await;
    let (user, redirect_uri) = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            // Unknown and expired states are routine (stale tabs, slow
            // users); anything else deserves a closer look.
            match &e {
                AuthFlowError::State(StateError::Unknown | StateError::Expired) => {
                    info!(provider, "login callback with stale state: {e}");
                }
                _ => warn!(provider, "login callback failed: {e}"),
            }
            return Redirect::to(LOGIN_FAILED_REDIRECT).into_response();
        }
    };

    let raw = match state
        .storage
        .create_session_token(user.id, state.session_ttl)
        .await
    {
        Ok(raw) => raw,
        Err(e) => {
            error!(user_id = user.id, "failed to create session token: {e:#}");
            return Redirect::to(LOGIN_FAILED_REDIRECT).into_response();
        }
    };

    let cookie = format!(
        "{SESSION_COOKIE}={raw}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        state.session_ttl.as_secs()
    );
    let target = redirect_uri.unwrap_or_else(|| "/".to_string());
    (
        [(header::SET_COOKIE, cookie)],
        Redirect::to(&target),
    )
        .into_response()
}

pub(crate) async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(raw) = cookie_value(&headers, SESSION_COOKIE) {
        if let Err(e) = state.storage.revoke_session_token(&raw).await {
            error!("failed to revoke session token: {e:#}");
        }
    }
    let clear = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    ([(header::SET_COOKIE, clear)], Redirect::to("/")).into_response()
}

pub(crate) async fn list_providers(State(state): State<AppState>) -> Response {
    let mut providers: Vec<serde_json::Value> = state
        .auth
        .values()
        .map(|handler| {
            json!({
                "id": handler.provider_id(),
                "kind": handler.kind(),
                "login_url": format!("/auth/{}/login", handler.provider_id()),
            })
        })
        .collect();
    providers.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
    Json(json!({ "success": true, "providers": providers })).into_response()
}

fn unknown_provider(provider: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "error": format!("unknown auth provider {provider:?}"),
        })),
    )
        .into_response()
}
