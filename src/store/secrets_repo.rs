//! Secrets repository: AES-GCM-sealed `(key, ciphertext)` rows.
//!
//! Additional authenticated data for every secret is the secret's own key
//! string, so a ciphertext cannot be swapped between keys undetected.

use std::sync::Arc;

use chrono::Utc;
use sqlx::FromRow;

use crate::crypto;
use crate::Result;

use super::db::Database;

#[derive(FromRow)]
struct SecretRow {
    #[allow(dead_code)]
    key: String,
    ciphertext: Vec<u8>,
    #[allow(dead_code)]
    updated_at: String,
}

/// Repository wrapper around `SQLite` for encrypted secrets.
#[derive(Clone)]
pub struct SecretsRepo {
    db: Arc<Database>,
}

impl SecretsRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Seal and store `plaintext` under `key`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Crypto` if sealing fails, `AppError::Db` if the
    /// write fails.
    pub async fn save(&self, master_key: &[u8; 32], key: &str, plaintext: &[u8]) -> Result<()> {
        let ciphertext = crypto::seal(master_key, key.as_bytes(), plaintext)?;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO secrets (key, ciphertext, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET ciphertext = excluded.ciphertext, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(ciphertext)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Read and unseal the secret stored under `key`, if present.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Crypto` if unsealing fails, `AppError::Db` if the
    /// query fails.
    pub async fn get(&self, master_key: &[u8; 32], key: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<SecretRow> = sqlx::query_as("SELECT * FROM secrets WHERE key = ?1")
            .bind(key)
            .fetch_optional(self.db.as_ref())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let plaintext = crypto::open(master_key, key.as_bytes(), &row.ciphertext)?;
        Ok(Some(plaintext))
    }

    /// `true` if a secret exists under `key`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn has(&self, key: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM secrets WHERE key = ?1")
            .bind(key)
            .fetch_one(self.db.as_ref())
            .await?;
        Ok(count > 0)
    }

    /// Delete the secret stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM secrets WHERE key = ?1")
            .bind(key)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }
}
