//! Per-provider login glue.
//!
//! An [`AuthHandler`] ties one OAuth2 client to the shared storage: it parks
//! the session in the login-state store when a login begins, and on the
//! provider callback consumes that state, exchanges the code, and resolves
//! the provider identity to a local user. Providers differ only in where the
//! identity comes from: GitHub requires a user-API call with the granted
//! token, Nextcloud ships `user_id` right in the token response.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::core::oauth::{OAuth2Client, OAuth2SessionData, OAuthError};
use crate::core::storage::{StateError, Storage, UserRecord};
use crate::core::tasks::{TaskContext, TaskPayload};
use crate::task_origin;

#[derive(Debug, Error)]
pub enum AuthFlowError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Protocol(#[from] OAuthError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

enum UserInfoSource {
    Github { user_api_url: String },
    Nextcloud { base_url: String },
}

/// What gets parked in the login-state store between the redirect to the
/// provider and its callback.
#[derive(Debug, Serialize, Deserialize)]
struct PendingLogin {
    session: OAuth2SessionData,
    redirect_uri: Option<String>,
}

pub struct AuthHandler {
    provider_id: String,
    client: OAuth2Client,
    source: UserInfoSource,
    state_ttl: Duration,
}

impl AuthHandler {
    pub fn from_config(provider_id: &str, config: &ProviderConfig, state_ttl: Duration) -> Self {
        match config {
            ProviderConfig::Github {
                client_id,
                client_secret,
                redirect_uri,
                authorize_url,
                token_url,
                user_api_url,
            } => Self {
                provider_id: provider_id.to_string(),
                client: OAuth2Client {
                    authorize_url: authorize_url.clone(),
                    token_url: token_url.clone(),
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    redirect_uri: redirect_uri.clone(),
                },
                source: UserInfoSource::Github {
                    user_api_url: user_api_url.clone(),
                },
                state_ttl,
            },
            ProviderConfig::Nextcloud {
                base_url,
                client_id,
                client_secret,
                redirect_uri,
            } => {
                let base_url = base_url.trim_end_matches('/').to_string();
                Self {
                    provider_id: provider_id.to_string(),
                    client: OAuth2Client {
                        authorize_url: format!("{base_url}/apps/oauth2/authorize"),
                        token_url: format!("{base_url}/apps/oauth2/api/v1/token"),
                        client_id: client_id.clone(),
                        client_secret: client_secret.clone(),
                        redirect_uri: redirect_uri.clone(),
                    },
                    source: UserInfoSource::Nextcloud { base_url },
                    state_ttl,
                }
            }
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn kind(&self) -> &'static str {
        match &self.source {
            UserInfoSource::Github { .. } => "github",
            UserInfoSource::Nextcloud { .. } => "nextcloud",
        }
    }

    /// Start a login: park the fresh session under its state token and hand
    /// back the provider authorization URL to redirect the browser to.
    pub async fn begin_login(
        &self,
        storage: &Storage,
        redirect_uri: Option<String>,
    ) -> Result<String, AuthFlowError> {
        let session = self.client.login_session(None);
        let pending = PendingLogin {
            session: session.data.clone(),
            redirect_uri,
        };
        let payload = serde_json::to_value(&pending)
            .context("failed to serialize pending login")?;
        storage
            .create_login_state(&session.data.state, self.state_ttl, &payload)
            .await?;
        Ok(session.login_url())
    }

    /// Finish a login from the provider callback. Consumes the parked state
    /// (one shot; `Unknown`/`Expired` mean "retry the login"), exchanges the
    /// code, and resolves or creates the local user. Returns the user and the
    /// redirect target recorded when the login began.
    pub async fn complete_login(
        &self,
        storage: &Storage,
        http: &reqwest::Client,
        code: &str,
        state: &str,
    ) -> Result<(UserRecord, Option<String>), AuthFlowError> {
        let payload = storage.get_login_state(state, true).await?;
        let pending: PendingLogin = serde_json::from_value(payload)
            .context("failed to deserialize pending login")?;
        let session = self.client.session_from(pending.session);
        session.validate(state)?;

        let access = session.get_token(http, code).await?;
        let user = self.finalize_login(storage, http, &access).await?;
        Ok((user, pending.redirect_uri))
    }

    async fn finalize_login(
        &self,
        storage: &Storage,
        http: &reqwest::Client,
        access: &HashMap<String, String>,
    ) -> Result<UserRecord> {
        let access_token = access
            .get("access_token")
            .context("token response missing access_token")?;

        match &self.source {
            UserInfoSource::Github { user_api_url } => {
                let info: GithubUserInfo = http
                    .get(user_api_url)
                    .header(reqwest::header::AUTHORIZATION, format!("token {access_token}"))
                    .header(reqwest::header::USER_AGENT, "feedr")
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                let user = storage
                    .get_or_create_user(&self.provider_id, &info.id.to_string(), &info.login)
                    .await?;
                if let Some(avatar_url) = info.avatar_url {
                    storage
                        .set_user_avatar_url(user.id, Some(&avatar_url))
                        .await?;
                    self.queue_avatar_refresh(
                        storage,
                        user.id,
                        format!("token {access_token}"),
                        avatar_url,
                    )
                    .await;
                }
                Ok(user)
            }
            UserInfoSource::Nextcloud { base_url } => {
                let user_id = access
                    .get("user_id")
                    .context("token response missing user_id")?;
                let token_type = access
                    .get("token_type")
                    .map(String::as_str)
                    .unwrap_or("Bearer");
                let user = storage
                    .get_or_create_user(&self.provider_id, user_id, user_id)
                    .await?;
                let avatar_url = format!("{base_url}/avatar/{user_id}/145");
                self.queue_avatar_refresh(
                    storage,
                    user.id,
                    format!("{token_type} {access_token}"),
                    avatar_url,
                )
                .await;
                Ok(user)
            }
        }
    }

    /// Fire and forget: a failed avatar refresh must never fail the login.
    async fn queue_avatar_refresh(
        &self,
        storage: &Storage,
        user_id: i64,
        auth_header: String,
        avatar_url: String,
    ) {
        let payload = RefreshAvatar {
            user_id,
            auth_header,
            avatar_url,
        };
        let result = crate::core::tasks::enqueue(
            storage,
            &format!("Refresh avatar for user {user_id}"),
            task_origin!(),
            REFRESH_AVATAR_KIND,
            &payload,
        )
        .await;
        if let Err(e) = result {
            warn!(user_id, "failed to queue avatar refresh: {e:#}");
        }
    }
}

#[derive(Debug, Deserialize)]
struct GithubUserInfo {
    id: i64,
    login: String,
    avatar_url: Option<String>,
}

pub const REFRESH_AVATAR_KIND: &str = "refresh_avatar";

/// Downloads a user's avatar with the credentials granted at login and stores
/// it locally.
#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshAvatar {
    pub user_id: i64,
    pub auth_header: String,
    pub avatar_url: String,
}

#[async_trait]
impl TaskPayload for RefreshAvatar {
    async fn run(&self, ctx: &TaskContext) -> Result<()> {
        let response = ctx
            .http
            .get(&self.avatar_url)
            .header(reqwest::header::AUTHORIZATION, &self.auth_header)
            .send()
            .await?;
        if !response.status().is_success() {
            debug!(
                user_id = self.user_id,
                status = %response.status(),
                "avatar endpoint returned non-success, keeping previous avatar"
            );
            return Ok(());
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let data = response.bytes().await?;
        ctx.storage
            .save_user_avatar(self.user_id, &data, &content_type)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::test_storage;
    use axum::Router;
    use axum::http::header;
    use axum::routing::{get, post};

    const STATE_TTL: Duration = Duration::from_secs(300);

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("listener addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn nextcloud_handler(base_url: &str, ttl: Duration) -> AuthHandler {
        AuthHandler::from_config(
            "cloud",
            &ProviderConfig::Nextcloud {
                base_url: base_url.to_string(),
                client_id: "cid".to_string(),
                client_secret: "csec".to_string(),
                redirect_uri: None,
            },
            ttl,
        )
    }

    fn mock_nextcloud() -> Router {
        Router::new().route(
            "/apps/oauth2/api/v1/token",
            post(|| async {
                (
                    [(header::CONTENT_TYPE, "application/x-www-form-urlencoded")],
                    "access_token=tok123&token_type=Bearer&user_id=alice",
                )
            }),
        )
    }

    fn state_from_login_url(url: &str) -> String {
        url.split('?')
            .nth(1)
            .and_then(|query| {
                query
                    .split('&')
                    .find_map(|pair| pair.strip_prefix("state="))
            })
            .expect("login URL should carry a state parameter")
            .to_string()
    }

    #[tokio::test]
    async fn begin_login_parks_state_and_builds_authorize_url() {
        let (storage, _dir) = test_storage().await;
        let handler = nextcloud_handler("https://cloud.example.com/", STATE_TTL);

        let url = handler
            .begin_login(&storage, Some("/reader".to_string()))
            .await
            .expect("begin_login should succeed");
        assert!(url.starts_with("https://cloud.example.com/apps/oauth2/authorize?"));

        let state = state_from_login_url(&url);
        let payload = storage
            .get_login_state(&state, false)
            .await
            .expect("state should be parked");
        assert_eq!(payload["redirect_uri"], "/reader");
        assert_eq!(payload["session"]["state"], state.as_str());
    }

    #[tokio::test]
    async fn complete_login_resolves_user_and_queues_avatar_refresh() {
        let (storage, _dir) = test_storage().await;
        let base = spawn_server(mock_nextcloud()).await;
        let handler = nextcloud_handler(&base, STATE_TTL);
        let http = reqwest::Client::new();

        let url = handler
            .begin_login(&storage, Some("/reader".to_string()))
            .await
            .expect("begin_login should succeed");
        let state = state_from_login_url(&url);

        let (user, redirect_uri) = handler
            .complete_login(&storage, &http, "code-1", &state)
            .await
            .expect("complete_login should succeed");
        assert_eq!(user.user_name, "alice");
        assert_eq!(user.provider, "cloud");
        assert_eq!(redirect_uri.as_deref(), Some("/reader"));

        let task = storage
            .claim_next_task("worker-test")
            .await
            .expect("claim should succeed")
            .expect("avatar refresh should be queued");
        assert_eq!(task.kind, REFRESH_AVATAR_KIND);
        assert_eq!(task.args["user_id"], user.id);
        assert_eq!(task.args["auth_header"], "Bearer tok123");

        // The state was consumed; replaying the callback fails.
        assert!(matches!(
            handler
                .complete_login(&storage, &http, "code-1", &state)
                .await,
            Err(AuthFlowError::State(StateError::Unknown))
        ));
    }

    #[tokio::test]
    async fn github_login_fetches_identity_from_user_api() {
        let (storage, _dir) = test_storage().await;
        let app = Router::new()
            .route(
                "/token",
                post(|| async {
                    (
                        [(header::CONTENT_TYPE, "application/json")],
                        r#"{"access_token":"gh-tok","token_type":"bearer"}"#,
                    )
                }),
            )
            .route(
                "/user",
                get(|headers: axum::http::HeaderMap| async move {
                    assert_eq!(
                        headers
                            .get(header::AUTHORIZATION)
                            .and_then(|v| v.to_str().ok()),
                        Some("token gh-tok")
                    );
                    (
                        [(header::CONTENT_TYPE, "application/json")],
                        r#"{"id":42,"login":"octocat","avatar_url":"https://img.example.com/42.png"}"#,
                    )
                }),
            );
        let base = spawn_server(app).await;
        let handler = AuthHandler::from_config(
            "github",
            &ProviderConfig::Github {
                client_id: "cid".to_string(),
                client_secret: "csec".to_string(),
                redirect_uri: None,
                authorize_url: format!("{base}/authorize"),
                token_url: format!("{base}/token"),
                user_api_url: format!("{base}/user"),
            },
            STATE_TTL,
        );
        let http = reqwest::Client::new();

        let url = handler
            .begin_login(&storage, None)
            .await
            .expect("begin_login should succeed");
        let state = state_from_login_url(&url);
        let (user, redirect_uri) = handler
            .complete_login(&storage, &http, "code-1", &state)
            .await
            .expect("complete_login should succeed");
        assert_eq!(user.user_name, "octocat");
        assert_eq!(user.provider_key, "42");
        assert!(redirect_uri.is_none());

        let task = storage
            .claim_next_task("worker-test")
            .await
            .expect("claim should succeed")
            .expect("avatar refresh should be queued");
        assert_eq!(task.args["avatar_url"], "https://img.example.com/42.png");
    }

    #[tokio::test]
    async fn unknown_and_expired_states_surface_as_retryable_errors() {
        let (storage, _dir) = test_storage().await;
        let http = reqwest::Client::new();

        let handler = nextcloud_handler("https://cloud.example.com", STATE_TTL);
        assert!(matches!(
            handler
                .complete_login(&storage, &http, "code-1", "forged-state")
                .await,
            Err(AuthFlowError::State(StateError::Unknown))
        ));

        let short_lived = nextcloud_handler("https://cloud.example.com", Duration::ZERO);
        let url = short_lived
            .begin_login(&storage, None)
            .await
            .expect("begin_login should succeed");
        let state = state_from_login_url(&url);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            short_lived
                .complete_login(&storage, &http, "code-1", &state)
                .await,
            Err(AuthFlowError::State(StateError::Expired))
        ));
    }

    #[tokio::test]
    async fn refresh_avatar_stores_image_and_skips_failures() {
        let (storage, _dir) = test_storage().await;
        let app = Router::new()
            .route(
                "/avatar/ok",
                get(|| async { ([(header::CONTENT_TYPE, "image/png")], vec![0x89, 0x50]) }),
            )
            .route(
                "/avatar/missing",
                get(|| async { axum::http::StatusCode::NOT_FOUND }),
            );
        let base = spawn_server(app).await;
        let user = storage
            .get_or_create_user("cloud", "alice", "alice")
            .await
            .expect("user should be created");
        let ctx = TaskContext {
            storage: storage.clone(),
            http: reqwest::Client::new(),
        };

        RefreshAvatar {
            user_id: user.id,
            auth_header: "Bearer tok".to_string(),
            avatar_url: format!("{base}/avatar/ok"),
        }
        .run(&ctx)
        .await
        .expect("refresh should succeed");
        let (data, content_type) = storage
            .get_user_avatar(user.id)
            .await
            .expect("get should succeed")
            .expect("avatar should be stored");
        assert_eq!(content_type, "image/png");
        assert_eq!(data, vec![0x89, 0x50]);

        // A non-success response is not an error; the old avatar stays.
        RefreshAvatar {
            user_id: user.id,
            auth_header: "Bearer tok".to_string(),
            avatar_url: format!("{base}/avatar/missing"),
        }
        .run(&ctx)
        .await
        .expect("missing avatar should be skipped");
        assert!(
            storage
                .get_user_avatar(user.id)
                .await
                .expect("get should succeed")
                .is_some()
        );
    }
}
