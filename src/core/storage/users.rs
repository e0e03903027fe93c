//! Users, avatars, and session tokens.
//!
//! A user is keyed by `(provider, provider_key)` so a returning login
//! resolves to the same row. Session tokens are random values handed to the
//! browser as a cookie; only their SHA-256 hash is stored.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::info;

use super::Storage;

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub id: i64,
    pub user_name: String,
    pub avatar_url: Option<String>,
    pub provider: String,
    pub provider_key: String,
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn generate_raw_token() -> String {
    let bytes: [u8; 16] = rand::random();
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("fdr_{}", hex)
}

const USER_COLUMNS: &str = "id, user_name, avatar_url, provider, provider_key";

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        user_name: row.get(1)?,
        avatar_url: row.get(2)?,
        provider: row.get(3)?,
        provider_key: row.get(4)?,
    })
}

impl Storage {
    /// Resolve the user for a provider identity, creating the row on first
    /// login. A user-name collision across providers falls back to a
    /// provider-suffixed name.
    pub async fn get_or_create_user(
        &self,
        provider: &str,
        provider_key: &str,
        user_name: &str,
    ) -> Result<UserRecord> {
        let db = self.lock_db().lock().await;
        let existing = db
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE provider = ?1 AND provider_key = ?2"
                ),
                params![provider, provider_key],
                row_to_user,
            )
            .optional()?;
        if let Some(user) = existing {
            return Ok(user);
        }

        let insert = |name: &str| {
            db.execute(
                "INSERT INTO users (user_name, provider, provider_key) VALUES (?1, ?2, ?3)",
                params![name, provider, provider_key],
            )
        };
        let name = match insert(user_name) {
            Ok(_) => user_name.to_string(),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let fallback = format!("{user_name}-{provider}");
                insert(&fallback)?;
                fallback
            }
            Err(e) => return Err(e.into()),
        };

        let id = db.last_insert_rowid();
        info!(user_id = id, user_name = %name, provider, "created user");
        Ok(UserRecord {
            id,
            user_name: name,
            avatar_url: None,
            provider: provider.to_string(),
            provider_key: provider_key.to_string(),
        })
    }

    pub async fn set_user_avatar_url(&self, user_id: i64, avatar_url: Option<&str>) -> Result<()> {
        let db = self.lock_db().lock().await;
        db.execute(
            "UPDATE users SET avatar_url = ?1 WHERE id = ?2",
            params![avatar_url, user_id],
        )?;
        Ok(())
    }

    /// Store the downloaded avatar image. Once a local copy exists the remote
    /// `avatar_url` is cleared so consumers prefer the stored blob.
    pub async fn save_user_avatar(
        &self,
        user_id: i64,
        data: &[u8],
        content_type: &str,
    ) -> Result<()> {
        if !content_type.starts_with("image/") {
            bail!("expected image content type, got {content_type:?}");
        }
        let db = self.lock_db().lock().await;
        db.execute(
            "INSERT INTO avatars (user_id, data, content_type) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET data = excluded.data,
                                               content_type = excluded.content_type",
            params![user_id, data, content_type],
        )?;
        db.execute(
            "UPDATE users SET avatar_url = NULL WHERE id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    pub async fn get_user_avatar(&self, user_id: i64) -> Result<Option<(Vec<u8>, String)>> {
        let db = self.lock_db().lock().await;
        let row = db
            .query_row(
                "SELECT data, content_type FROM avatars WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Issue a session token for the user. The raw value is returned exactly
    /// once; only its hash is persisted.
    pub async fn create_session_token(&self, user_id: i64, ttl: Duration) -> Result<String> {
        let raw = generate_raw_token();
        let id = uuid::Uuid::new_v4().to_string();
        let expires_at = (Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64)).to_rfc3339();
        let db = self.lock_db().lock().await;
        db.execute(
            "INSERT INTO session_tokens (id, user_id, token_hash, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, user_id, hash_token(&raw), expires_at],
        )?;
        info!(user_id, token_id = %id, "logged in user");
        Ok(raw)
    }

    /// Resolve the user behind a raw session token, or `None` when the token
    /// is unknown, revoked, or expired.
    pub async fn validate_session_token(&self, raw: &str) -> Result<Option<UserRecord>> {
        let token_hash = hash_token(raw);
        let db = self.lock_db().lock().await;
        let row = db
            .query_row(
                "SELECT u.id, u.user_name, u.avatar_url, u.provider, u.provider_key, t.expires_at
                 FROM session_tokens t JOIN users u ON u.id = t.user_id
                 WHERE t.token_hash = ?1 AND t.revoked = 0",
                params![token_hash],
                |row| {
                    let user = row_to_user(row)?;
                    let expires_at: String = row.get(5)?;
                    Ok((user, expires_at))
                },
            )
            .optional()?;

        let Some((user, expires_at)) = row else {
            return Ok(None);
        };
        let expires_at: DateTime<Utc> = expires_at.parse()?;
        if Utc::now() > expires_at {
            return Ok(None);
        }
        Ok(Some(user))
    }

    pub async fn revoke_session_token(&self, raw: &str) -> Result<bool> {
        let token_hash = hash_token(raw);
        let db = self.lock_db().lock().await;
        let changed = db.execute(
            "UPDATE session_tokens SET revoked = 1 WHERE token_hash = ?1 AND revoked = 0",
            params![token_hash],
        )?;
        if changed > 0 {
            info!("revoked session token");
        }
        Ok(changed > 0)
    }
}
