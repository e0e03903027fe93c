//! OAuth2 authorization-code protocol logic.
//!
//! This module is purely the wire protocol: building authorize URLs,
//! validating the returned `state`, and exchanging a code for a token. It
//! holds no storage and serves no routes; pending-login bookkeeping lives in
//! [`crate::core::storage::login_states`] and the per-provider glue in
//! [`crate::core::auth`].

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OAuthError {
    /// The `state` returned by the provider does not match the one we sent.
    /// This is the CSRF defense of the flow; treat as a hostile request.
    #[error("OAuth2 state mismatch")]
    TamperedFlow,
    #[error("token exchange failed with HTTP {status}: {body}")]
    TokenExchangeFailed {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("unsupported token response content type {0:?}")]
    UnsupportedTokenResponse(String),
    #[error("malformed token response: {0}")]
    MalformedTokenResponse(String),
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Immutable per-provider protocol configuration, shared by all sessions.
#[derive(Debug, Clone)]
pub struct OAuth2Client {
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: Option<String>,
}

/// The per-login-attempt values. Serializable so a pending login can be
/// parked in the state store between the redirect and the callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2SessionData {
    pub state: String,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default = "default_response_type")]
    pub response_type: String,
    #[serde(default = "default_grant_type")]
    pub grant_type: String,
}

fn default_response_type() -> String {
    "code".to_string()
}

fn default_grant_type() -> String {
    "authorization_code".to_string()
}

pub fn generate_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

impl OAuth2Client {
    /// Start a fresh login attempt with a new unguessable state token.
    pub fn login_session(&self, login: Option<String>) -> OAuth2Session<'_> {
        self.session_from(OAuth2SessionData {
            state: generate_state(),
            login,
            response_type: default_response_type(),
            grant_type: default_grant_type(),
        })
    }

    /// Rehydrate a session from data parked in the state store.
    pub fn session_from(&self, data: OAuth2SessionData) -> OAuth2Session<'_> {
        OAuth2Session { client: self, data }
    }
}

pub struct OAuth2Session<'c> {
    client: &'c OAuth2Client,
    pub data: OAuth2SessionData,
}

impl OAuth2Session<'_> {
    /// The provider authorization URL the browser is redirected to. No I/O.
    pub fn login_url(&self) -> String {
        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", &self.client.client_id),
            ("state", &self.data.state),
            ("response_type", &self.data.response_type),
        ];
        if let Some(login) = &self.data.login {
            params.push(("login", login));
        }
        if let Some(redirect_uri) = &self.client.redirect_uri {
            params.push(("redirect_uri", redirect_uri));
        }
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", self.client.authorize_url, query)
    }

    /// Check the callback `state` against the one recorded for this session.
    pub fn validate(&self, received_state: &str) -> Result<(), OAuthError> {
        if constant_time_eq(self.data.state.as_bytes(), received_state.as_bytes()) {
            Ok(())
        } else {
            Err(OAuthError::TamperedFlow)
        }
    }

    /// Exchange the authorization code for a token at the provider's token
    /// endpoint. The provider chooses the response encoding via its
    /// `Content-Type`; both JSON objects and form-urlencoded bodies are
    /// accepted, anything else is refused.
    pub async fn get_token(
        &self,
        http: &reqwest::Client,
        code: &str,
    ) -> Result<HashMap<String, String>, OAuthError> {
        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", &self.client.client_id),
            ("client_secret", &self.client.client_secret),
            ("code", code),
            ("state", &self.data.state),
            ("grant_type", &self.data.grant_type),
        ];
        if let Some(redirect_uri) = &self.client.redirect_uri {
            params.push(("redirect_uri", redirect_uri));
        }

        let response = http
            .post(&self.client.token_url)
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .unwrap_or_default();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(OAuthError::TokenExchangeFailed { status, body });
        }

        match content_type.as_str() {
            "application/json" => decode_json_token_response(&body),
            "application/x-www-form-urlencoded" => Ok(url::form_urlencoded::parse(body.as_bytes())
                .into_owned()
                .collect()),
            other => Err(OAuthError::UnsupportedTokenResponse(other.to_string())),
        }
    }
}

fn decode_json_token_response(body: &str) -> Result<HashMap<String, String>, OAuthError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| OAuthError::MalformedTokenResponse(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| OAuthError::MalformedTokenResponse("not a JSON object".to_string()))?;
    Ok(object
        .iter()
        .map(|(k, v)| {
            let flat = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), flat)
        })
        .collect())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
