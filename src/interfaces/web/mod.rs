//! The HTTP surface of the daemon.

mod handlers;
mod router;

use anyhow::{Context as _, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use router::build_router;

use crate::core::auth::AuthHandler;
use crate::core::storage::Storage;

#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub http: reqwest::Client,
    pub auth: Arc<HashMap<String, AuthHandler>>,
    pub session_ttl: Duration,
}

/// Bind and serve the router until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    info!("listening on http://{host}:{port}");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server failed")
}
