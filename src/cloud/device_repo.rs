//! Device repository: paired local `fogd` instances, authenticated by a
//! hashed bearer token.

use std::sync::Arc;

use chrono::Utc;
use sqlx::FromRow;

use crate::crypto;
use crate::Result;

use super::db::Database;
use super::models::Device;

#[derive(FromRow)]
struct DeviceRow {
    id: String,
    token_hash: String,
    created_at: String,
}

impl DeviceRow {
    fn into_device(self) -> Result<Device> {
        Ok(Device {
            id: self.id,
            token_hash: self.token_hash,
            created_at: chrono::DateTime::parse_from_rfc3339(&self.created_at)
                .map_err(|e| crate::AppError::Db(format!("invalid created_at: {e}")))?
                .with_timezone(&Utc),
        })
    }
}

/// Repository wrapper around `SQLite` for devices.
#[derive(Clone)]
pub struct DeviceRepo {
    db: Arc<Database>,
}

impl DeviceRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Fetch a device by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<Device>> {
        let row: Option<DeviceRow> = sqlx::query_as("SELECT * FROM devices WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(DeviceRow::into_device).transpose()
    }

    /// Insert a fresh device row with the hash of `plaintext_token`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, id: &str, plaintext_token: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("INSERT INTO devices (id, token_hash, created_at) VALUES (?1, ?2, ?3)")
            .bind(id)
            .bind(crypto::hash_device_token(plaintext_token))
            .bind(&now)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Constant-time verify `presented_token` against the stored hash.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn authenticate(&self, device_id: &str, presented_token: &str) -> Result<bool> {
        let Some(device) = self.get(device_id).await? else {
            return Ok(false);
        };
        let presented_hash = crypto::hash_device_token(presented_token);
        Ok(crypto::constant_time_eq(
            presented_hash.as_bytes(),
            device.token_hash.as_bytes(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn authenticate_accepts_matching_token_and_rejects_others() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = DeviceRepo::new(db);
        repo.create("device-a", "tok-1").await.unwrap();

        assert!(repo.authenticate("device-a", "tok-1").await.unwrap());
        assert!(!repo.authenticate("device-a", "tok-2").await.unwrap());
        assert!(!repo.authenticate("device-unknown", "tok-1").await.unwrap());
    }
}
