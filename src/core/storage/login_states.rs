//! Expiring one-shot store for pending OAuth2 logins.
//!
//! A state entry is written when a login begins and read exactly once when
//! the provider calls back. `Unknown` and `Expired` are ordinary control flow
//! for callers (the user retries the login), not defects. Expired rows are
//! deleted lazily when observed; there is no background sweep, and nothing is
//! guaranteed about an entry's retrievability once its expiry has passed.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use std::time::Duration;
use thiserror::Error;

use super::Storage;

#[derive(Debug, Error)]
pub enum StateError {
    /// Never created, already consumed, or cleaned up after expiry.
    #[error("unknown login state")]
    Unknown,
    #[error("login state expired")]
    Expired,
    #[error("login state id already exists")]
    Duplicate,
    #[error("corrupt login state record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl Storage {
    /// Record a pending login under `id` with expiry `now + ttl`. The id must
    /// be unguessable and effectively collision-free (the OAuth2 state token
    /// is); a collision surfaces as [`StateError::Duplicate`].
    pub async fn create_login_state(
        &self,
        id: &str,
        ttl: Duration,
        payload: &serde_json::Value,
    ) -> Result<(), StateError> {
        let expires_at = (Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64)).to_rfc3339();
        let db = self.lock_db().lock().await;
        let result = db.execute(
            "INSERT INTO login_states (id, payload, expires_at) VALUES (?1, ?2, ?3)",
            params![id, payload.to_string(), expires_at],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StateError::Duplicate)
            }
            Err(e) => Err(StateError::Db(e)),
        }
    }

    /// Read a pending login. With `consume` the row is deleted in the same
    /// guarded section, so of two concurrent consumers of one id exactly one
    /// gets the payload and the other sees [`StateError::Unknown`].
    pub async fn get_login_state(
        &self,
        id: &str,
        consume: bool,
    ) -> Result<serde_json::Value, StateError> {
        let db = self.lock_db().lock().await;
        let row: Option<(String, String)> = db
            .query_row(
                "SELECT payload, expires_at FROM login_states WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (payload, expires_at) = row.ok_or(StateError::Unknown)?;
        let expires_at: DateTime<Utc> = expires_at
            .parse()
            .map_err(|e| StateError::Corrupt(format!("bad expiry timestamp: {e}")))?;

        if Utc::now() > expires_at {
            // Lazy cleanup; a later read of this id reports Unknown.
            db.execute("DELETE FROM login_states WHERE id = ?1", params![id])?;
            return Err(StateError::Expired);
        }

        if consume {
            db.execute("DELETE FROM login_states WHERE id = ?1", params![id])?;
        }

        serde_json::from_str(&payload)
            .map_err(|e| StateError::Corrupt(format!("bad payload JSON: {e}")))
    }

    /// Remove a pending login, discarding its payload.
    pub async fn consume_login_state(&self, id: &str) -> Result<(), StateError> {
        self.get_login_state(id, true).await.map(|_| ())
    }
}
