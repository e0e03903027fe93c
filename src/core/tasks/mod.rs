//! Task payloads and their execution.
//!
//! A payload is stored as `(kind, args)` and resolved through an explicit
//! registry built at startup; there is no reflection and no global state. The
//! [`TaskContext`] carries everything a payload may touch.

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{error, info};

use super::storage::{Storage, TaskRecord, TaskStatus};

/// Expands to the `file:line` of the enqueue call site, recorded on the task
/// record as its origin.
#[macro_export]
macro_rules! task_origin {
    () => {
        concat!(file!(), ":", line!())
    };
}

/// Everything a task payload gets to work with.
pub struct TaskContext {
    pub storage: Storage,
    pub http: reqwest::Client,
}

#[async_trait]
pub trait TaskPayload: Send + Sync {
    async fn run(&self, ctx: &TaskContext) -> Result<()>;
}

#[derive(Debug, Error)]
#[error("unknown task payload kind {0:?}")]
pub struct UnknownPayloadType(pub String);

type PayloadFactory = Box<dyn Fn(serde_json::Value) -> Result<Box<dyn TaskPayload>> + Send + Sync>;

/// Maps a payload `kind` tag to its deserialize-and-box constructor.
/// Populated once at startup; an unregistered tag is fatal for that task but
/// never for the worker.
#[derive(Default)]
pub struct TaskRegistry {
    factories: HashMap<String, PayloadFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, kind: &str)
    where
        T: TaskPayload + DeserializeOwned + 'static,
    {
        self.factories.insert(
            kind.to_string(),
            Box::new(|args| {
                let payload: T = serde_json::from_value(args)
                    .context("failed to deserialize task args")?;
                Ok(Box::new(payload))
            }),
        );
    }

    fn resolve(&self, kind: &str, args: serde_json::Value) -> Result<Box<dyn TaskPayload>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| UnknownPayloadType(kind.to_string()))?;
        factory(args)
    }

    /// Run a claimed task to its terminal status. Every payload failure,
    /// including an unresolvable kind or undeserializable args, is contained
    /// here: logged and recorded as `failed`, one attempt only. The returned
    /// error covers only bookkeeping failures (the record was not claimed by
    /// `worker_id`, or the outcome could not be persisted).
    pub async fn execute(
        &self,
        ctx: &TaskContext,
        record: &TaskRecord,
        worker_id: &str,
    ) -> Result<()> {
        if record.status != TaskStatus::InProgress
            || record.worker_id.as_deref() != Some(worker_id)
        {
            bail!("task {} is not claimed by worker {worker_id}", record.id);
        }

        info!(
            task_id = record.id,
            name = %record.name,
            kind = %record.kind,
            "executing task"
        );
        let outcome = match self.resolve(&record.kind, record.args.clone()) {
            Ok(payload) => payload.run(ctx).await,
            Err(e) => Err(e),
        };

        let status = match outcome {
            Ok(()) => TaskStatus::Completed,
            Err(e) => {
                error!(
                    task_id = record.id,
                    name = %record.name,
                    kind = %record.kind,
                    "task execution failed: {e:#}"
                );
                TaskStatus::Failed
            }
        };
        ctx.storage.finish_task(record.id, status).await?;
        info!(task_id = record.id, status = status.as_str(), "finished task");
        Ok(())
    }
}

/// Serialize `payload` and persist it as a pending task.
pub async fn enqueue<T: Serialize>(
    storage: &Storage,
    name: &str,
    origin: &str,
    kind: &str,
    payload: &T,
) -> Result<i64> {
    storage
        .enqueue_task(name, origin, kind, serde_json::to_value(payload)?)
        .await
}

#[cfg(test)]
mod tests {
    use super::super::storage::test_storage;
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
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

    #[derive(Serialize, Deserialize)]
    struct Boom;

    #[async_trait]
    impl TaskPayload for Boom {
        async fn run(&self, _ctx: &TaskContext) -> Result<()> {
            bail!("boom");
        }
    }

    fn test_registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register::<Touch>("touch");
        registry.register::<Boom>("boom");
        registry
    }

    async fn test_ctx() -> (TaskContext, tempfile::TempDir) {
        let (storage, dir) = test_storage().await;
        (
            TaskContext {
                storage,
                http: reqwest::Client::new(),
            },
            dir,
        )
    }

    #[tokio::test]
    async fn successful_payload_is_recorded_completed() {
        let (ctx, dir) = test_ctx().await;
        let marker = dir.path().join("touched");
        let id = enqueue(
            &ctx.storage,
            "touch file",
            task_origin!(),
            "touch",
            &Touch {
                path: marker.clone(),
            },
        )
        .await
        .expect("enqueue should succeed");

        let record = ctx
            .storage
            .claim_next_task("worker-1")
            .await
            .expect("claim should succeed")
            .expect("task should be claimed");
        test_registry()
            .execute(&ctx, &record, "worker-1")
            .await
            .expect("execute should succeed");

        assert!(marker.exists());
        let record = ctx
            .storage
            .get_task(id)
            .await
            .expect("get should succeed")
            .expect("task should exist");
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.ended_at.is_some());
        assert!(record.origin.contains("tasks/mod.rs"));
    }

    #[tokio::test]
    async fn failing_payload_is_recorded_failed_not_retried() {
        let (ctx, _dir) = test_ctx().await;
        let id = enqueue(&ctx.storage, "boom", task_origin!(), "boom", &Boom)
            .await
            .expect("enqueue should succeed");

        let record = ctx
            .storage
            .claim_next_task("worker-1")
            .await
            .expect("claim should succeed")
            .expect("task should be claimed");
        test_registry()
            .execute(&ctx, &record, "worker-1")
            .await
            .expect("execute should contain the failure");

        let record = ctx
            .storage
            .get_task(id)
            .await
            .expect("get should succeed")
            .expect("task should exist");
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.ended_at.is_some());

        // Failed is terminal; nothing is left to claim.
        assert!(
            ctx.storage
                .claim_next_task("worker-1")
                .await
                .expect("claim should succeed")
                .is_none()
        );
    }

    #[tokio::test]
    async fn unknown_kind_fails_the_task_not_the_caller() {
        let (ctx, _dir) = test_ctx().await;
        let id = ctx
            .storage
            .enqueue_task("mystery", "tests:0", "no_such_kind", json!({}))
            .await
            .expect("enqueue should succeed");

        let record = ctx
            .storage
            .claim_next_task("worker-1")
            .await
            .expect("claim should succeed")
            .expect("task should be claimed");
        test_registry()
            .execute(&ctx, &record, "worker-1")
            .await
            .expect("execute should contain the failure");

        let record = ctx
            .storage
            .get_task(id)
            .await
            .expect("get should succeed")
            .expect("task should exist");
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.ended_at.is_some());
    }

    #[tokio::test]
    async fn undeserializable_args_fail_the_task() {
        let (ctx, _dir) = test_ctx().await;
        let id = ctx
            .storage
            .enqueue_task("bad args", "tests:0", "touch", json!({ "wrong": true }))
            .await
            .expect("enqueue should succeed");

        let record = ctx
            .storage
            .claim_next_task("worker-1")
            .await
            .expect("claim should succeed")
            .expect("task should be claimed");
        test_registry()
            .execute(&ctx, &record, "worker-1")
            .await
            .expect("execute should contain the failure");

        let record = ctx
            .storage
            .get_task(id)
            .await
            .expect("get should succeed")
            .expect("task should exist");
        assert_eq!(record.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn execute_refuses_records_claimed_by_someone_else() {
        let (ctx, _dir) = test_ctx().await;
        enqueue(&ctx.storage, "boom", task_origin!(), "boom", &Boom)
            .await
            .expect("enqueue should succeed");

        let record = ctx
            .storage
            .claim_next_task("worker-1")
            .await
            .expect("claim should succeed")
            .expect("task should be claimed");
        assert!(
            test_registry()
                .execute(&ctx, &record, "worker-2")
                .await
                .is_err()
        );
    }
}
