//! Periodic feed refresh.
//!
//! The dispatcher only decides *when* a refresh cycle is due; the actual work
//! goes through the task queue so it gets the same bookkeeping and failure
//! containment as everything else. [`RefreshFeeds`] is the seam where a feed
//! parser plugs in.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use super::dispatcher::BackgroundDispatcher;
use super::storage::Storage;
use super::tasks::{TaskContext, TaskPayload};
use crate::task_origin;

pub const REFRESH_FEEDS_KIND: &str = "refresh_feeds";

/// One refresh cycle over all subscribed feeds.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RefreshFeeds {}

#[async_trait]
impl TaskPayload for RefreshFeeds {
    async fn run(&self, _ctx: &TaskContext) -> Result<()> {
        info!("feed refresh cycle triggered");
        Ok(())
    }
}

/// Enqueue a refresh task now and again every `every` thereafter.
pub fn schedule_refresh(dispatcher: &BackgroundDispatcher, storage: Storage, every: Duration) {
    info!(interval_secs = every.as_secs(), "scheduling periodic feed refresh");
    dispatcher.push_recurring(every, move || {
        let storage = storage.clone();
        async move {
            super::tasks::enqueue(
                &storage,
                "Refresh feeds",
                task_origin!(),
                REFRESH_FEEDS_KIND,
                &RefreshFeeds::default(),
            )
            .await?;
            Ok(())
        }
    });
}
