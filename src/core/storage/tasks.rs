//! Persisted background tasks.
//!
//! A task is a unit of work serialized as `(kind, args)` and executed at most
//! once by whichever worker claims it. Status transitions are one-directional:
//! `pending -> in_progress -> completed | failed`. Rows are never deleted
//! here; retention is an operator concern.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn from_sql(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: i64,
    pub name: String,
    /// Call site that enqueued the task (`file:line`), for operators reading
    /// the queue.
    pub origin: String,
    /// Payload type tag; resolved through the task registry at execution.
    pub kind: String,
    pub args: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

const TASK_COLUMNS: &str =
    "id, name, origin, kind, args, created_at, status, worker_id, started_at, ended_at";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let conv = |idx: usize, msg: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
    };

    let args: String = row.get(4)?;
    let args = serde_json::from_str(&args)
        .map_err(|e| conv(4, format!("bad task args JSON: {e}")))?;
    let created_at: String = row.get(5)?;
    let created_at = created_at
        .parse()
        .map_err(|e| conv(5, format!("bad created_at: {e}")))?;
    let status: String = row.get(6)?;
    let status = TaskStatus::from_sql(&status)
        .ok_or_else(|| conv(6, format!("unknown task status {status:?}")))?;
    let parse_opt = |idx: usize, value: Option<String>| -> rusqlite::Result<Option<DateTime<Utc>>> {
        value
            .map(|v| v.parse().map_err(|e| conv(idx, format!("bad timestamp: {e}"))))
            .transpose()
    };
    let started_at = parse_opt(8, row.get(8)?)?;
    let ended_at = parse_opt(9, row.get(9)?)?;

    Ok(TaskRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        origin: row.get(2)?,
        kind: row.get(3)?,
        args,
        created_at,
        status,
        worker_id: row.get(7)?,
        started_at,
        ended_at,
    })
}

impl Storage {
    /// Persist a new pending task. The insert is committed before this
    /// returns; callers may rely on the task surviving a crash of their own
    /// process from here on.
    pub async fn enqueue_task(
        &self,
        name: &str,
        origin: &str,
        kind: &str,
        args: serde_json::Value,
    ) -> Result<i64> {
        let created_at = Utc::now().to_rfc3339();
        let db = self.lock_db().lock().await;
        db.execute(
            "INSERT INTO tasks (name, origin, kind, args, created_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            params![name, origin, kind, args.to_string(), created_at],
        )?;
        let id = db.last_insert_rowid();
        info!(task_id = id, name, kind, origin, "queued task");
        Ok(id)
    }

    /// Claim the next pending task for `worker_id`, transitioning it to
    /// `in_progress` with a start timestamp. Returns `None` when the queue is
    /// empty.
    ///
    /// Claim order is newest-id-first (LIFO). That is a deliberate contract,
    /// not an accident of the query; see DESIGN.md before changing it.
    pub async fn claim_next_task(&self, worker_id: &str) -> Result<Option<TaskRecord>> {
        let started_at = Utc::now().to_rfc3339();
        let db = self.lock_db().lock().await;

        let candidate = db
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status = 'pending' ORDER BY id DESC LIMIT 1"
                ),
                [],
                row_to_task,
            )
            .optional()?;

        let Some(mut task) = candidate else {
            return Ok(None);
        };

        // Conditional on status so a competing claimant (other process, or a
        // future multi-worker setup) can never double-claim.
        let changed = db.execute(
            "UPDATE tasks SET status = 'in_progress', worker_id = ?1, started_at = ?2
             WHERE id = ?3 AND status = 'pending'",
            params![worker_id, started_at, task.id],
        )?;
        if changed == 0 {
            return Ok(None);
        }

        task.status = TaskStatus::InProgress;
        task.worker_id = Some(worker_id.to_string());
        task.started_at = Some(started_at.parse()?);
        Ok(Some(task))
    }

    /// Record the outcome of an execution attempt. Only valid from
    /// `in_progress`; the status argument must be terminal.
    pub async fn finish_task(&self, id: i64, status: TaskStatus) -> Result<()> {
        if !status.is_terminal() {
            bail!("task {id} cannot finish with non-terminal status {:?}", status);
        }
        let ended_at = Utc::now().to_rfc3339();
        let db = self.lock_db().lock().await;
        let changed = db.execute(
            "UPDATE tasks SET status = ?1, ended_at = ?2
             WHERE id = ?3 AND status = 'in_progress'",
            params![status.as_str(), ended_at, id],
        )?;
        if changed == 0 {
            bail!("task {id} is not in progress");
        }
        Ok(())
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>> {
        let db = self.lock_db().lock().await;
        let task = db
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }
}
