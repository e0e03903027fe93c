//! SQLite persistence.
//!
//! A single [`Connection`] behind a tokio mutex is the whole concurrency
//! story: every multi-statement unit (consume a login state, claim a task)
//! runs under one guard, which is what makes those transitions atomic in this
//! single-process deployment. A multi-worker deployment would wrap the same
//! conditional updates in database transactions instead.

pub mod login_states;
pub mod tasks;
pub mod users;

pub use login_states::StateError;
pub use tasks::{TaskRecord, TaskStatus};
pub use users::UserRecord;

use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Clone)]
pub struct Storage {
    db: Arc<Mutex<Connection>>,
}

impl Storage {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let db = Connection::open(path)?;
        init_schema(&db)?;
        info!("opened database at {}", path.display());

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub(crate) fn lock_db(&self) -> &Arc<Mutex<Connection>> {
        &self.db
    }
}

fn init_schema(db: &Connection) -> Result<()> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_name TEXT NOT NULL UNIQUE,
            avatar_url TEXT,
            provider TEXT NOT NULL,
            provider_key TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(provider, provider_key)
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS avatars (
            user_id INTEGER PRIMARY KEY REFERENCES users(id),
            data BLOB NOT NULL,
            content_type TEXT NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS session_tokens (
            id TEXT PRIMARY KEY,
            user_id INTEGER NOT NULL REFERENCES users(id),
            token_hash TEXT NOT NULL UNIQUE,
            expires_at TEXT NOT NULL,
            revoked INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS login_states (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            origin TEXT NOT NULL,
            kind TEXT NOT NULL,
            args TEXT NOT NULL,
            created_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            worker_id TEXT,
            started_at TEXT,
            ended_at TEXT
        )",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_storage() -> (Storage, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let storage = Storage::open(dir.path().join("feedr.db"))
        .await
        .expect("storage should open");
    (storage, dir)
}
