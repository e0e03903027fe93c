//! Process entry: argument parsing, wiring, and shutdown ordering.

use anyhow::{Context as _, Result, bail};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::core::auth::{AuthHandler, REFRESH_AVATAR_KIND, RefreshAvatar};
use crate::core::dispatcher::BackgroundDispatcher;
use crate::core::feeds::{self, REFRESH_FEEDS_KIND, RefreshFeeds};
use crate::core::storage::Storage;
use crate::core::tasks::{TaskContext, TaskRegistry};
use crate::core::worker::TaskWorker;
use crate::interfaces::web::{self, AppState};
use crate::logging;

fn print_help() {
    println!("feedr - feed aggregation daemon");
    println!();
    println!("Usage: feedr [--config <path>]");
    println!();
    println!("  -c, --config <path>   Config file (default: feedr.toml)");
    println!("  -h, --help            Show this help");
}

fn parse_config_path(args: &[String]) -> Result<Option<PathBuf>> {
    let mut config_path = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    bail!("{} requires a path argument", args[i]);
                }
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(config_path)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config_path = parse_config_path(&args)?.unwrap_or_else(|| PathBuf::from("feedr.toml"));
    let config = Config::load(&config_path)?;
    logging::init(config.debug);

    let storage = Storage::open(&config.database.path).await?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build HTTP client")?;

    let mut registry = TaskRegistry::new();
    registry.register::<RefreshAvatar>(REFRESH_AVATAR_KIND);
    registry.register::<RefreshFeeds>(REFRESH_FEEDS_KIND);
    let ctx = Arc::new(TaskContext {
        storage: storage.clone(),
        http: http.clone(),
    });
    let worker = TaskWorker::spawn(
        format!("feedr-{}", uuid::Uuid::new_v4()),
        Arc::new(registry),
        ctx,
    );

    let dispatcher = BackgroundDispatcher::spawn();
    feeds::schedule_refresh(
        &dispatcher,
        storage.clone(),
        Duration::from_secs(config.feeds.refresh_interval_secs),
    );

    let state_ttl = Duration::from_secs(config.auth.login_state_ttl_secs);
    let auth: HashMap<String, AuthHandler> = config
        .auth
        .providers
        .iter()
        .map(|(id, provider)| (id.clone(), AuthHandler::from_config(id, provider, state_ttl)))
        .collect();

    let state = AppState {
        storage,
        http,
        auth: Arc::new(auth),
        session_ttl: Duration::from_secs(config.auth.session_token_ttl_secs),
    };

    web::serve(state, &config.server.host, config.server.port, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    worker.stop();
    dispatcher.stop();
    worker.join().await;
    dispatcher.join().await;
    info!("feedr stopped");
    Ok(())
}
