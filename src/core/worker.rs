//! The task worker: a single polling loop that claims pending tasks and runs
//! them to completion, one at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::tasks::{TaskContext, TaskRegistry};

/// How long to sleep when the queue is empty before polling again.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct TaskWorker {
    worker_id: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl TaskWorker {
    pub fn spawn(
        worker_id: impl Into<String>,
        registry: Arc<TaskRegistry>,
        ctx: Arc<TaskContext>,
    ) -> Self {
        let worker_id = worker_id.into();
        let stop = Arc::new(AtomicBool::new(false));
        info!(worker_id = %worker_id, "starting task worker");
        let handle = tokio::spawn(run_loop(worker_id.clone(), registry, ctx, stop.clone()));
        Self {
            worker_id,
            stop,
            handle,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Ask the loop to exit. Observed between iterations only; a task already
    /// being executed always runs to completion first.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Wait for the loop to observe the stop signal and exit.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

async fn run_loop(
    worker_id: String,
    registry: Arc<TaskRegistry>,
    ctx: Arc<TaskContext>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match ctx.storage.claim_next_task(&worker_id).await {
            Ok(Some(task)) => {
                if let Err(e) = registry.execute(&ctx, &task, &worker_id).await {
                    error!(task_id = task.id, "failed to record task outcome: {e:#}");
                }
            }
            Ok(None) => tokio::time::sleep(IDLE_POLL_INTERVAL).await,
            Err(e) => {
                error!("failed to poll task queue: {e:#}");
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            }
        }
    }
    info!(worker_id = %worker_id, "task worker stopped");
}

#[cfg(test)]
mod tests {
    use super::super::storage::{TaskStatus, test_storage};
    use super::super::tasks::{TaskPayload, enqueue};
    use super::*;
    use crate::task_origin;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;

    #[derive(Serialize, Deserialize)]
    struct Touch {
        path: PathBuf,
    }

    #[async_trait]
    impl TaskPayload for Touch {
        async fn run(&self, _ctx: &TaskContext) -> Result<()> {
            tokio::fs::write(&self.path, b"done").await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_picks_up_and_completes_queued_tasks() {
        let (storage, dir) = test_storage().await;
        let mut registry = TaskRegistry::new();
        registry.register::<Touch>("touch");
        let ctx = Arc::new(TaskContext {
            storage: storage.clone(),
            http: reqwest::Client::new(),
        });
        let worker = TaskWorker::spawn("worker-test", Arc::new(registry), ctx);

        let marker = dir.path().join("touched");
        let id = enqueue(
            &storage,
            "touch file",
            task_origin!(),
            "touch",
            &Touch {
                path: marker.clone(),
            },
        )
        .await
        .expect("enqueue should succeed");

        let mut completed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let record = storage
                .get_task(id)
                .await
                .expect("get should succeed")
                .expect("task should exist");
            if record.status == TaskStatus::Completed {
                completed = true;
                break;
            }
        }
        assert!(completed, "task was not completed in time");
        assert!(marker.exists());

        worker.stop();
        worker.join().await;
    }

    #[tokio::test]
    async fn stopped_worker_leaves_new_tasks_pending() {
        let (storage, _dir) = test_storage().await;
        let ctx = Arc::new(TaskContext {
            storage: storage.clone(),
            http: reqwest::Client::new(),
        });
        let worker = TaskWorker::spawn("worker-test", Arc::new(TaskRegistry::new()), ctx);
        assert_eq!(worker.worker_id(), "worker-test");
        worker.stop();
        worker.join().await;

        let id = storage
            .enqueue_task("later", "tests:0", "touch", serde_json::json!({}))
            .await
            .expect("enqueue should succeed");
        tokio::time::sleep(Duration::from_millis(250)).await;
        let record = storage
            .get_task(id)
            .await
            .expect("get should succeed")
            .expect("task should exist");
        assert_eq!(record.status, TaskStatus::Pending);
    }
}
