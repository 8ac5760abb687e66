//! Settings repository: plain `(key, value)` configuration rows.

use std::sync::Arc;

use chrono::Utc;
use sqlx::FromRow;

use crate::Result;

use super::db::Database;
use super::models::Setting;

#[derive(FromRow)]
struct SettingRow {
    key: String,
    value: String,
    updated_at: String,
}

impl SettingRow {
    fn into_setting(self) -> Result<Setting> {
        let updated_at = chrono::DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| crate::AppError::Db(format!("invalid updated_at: {e}")))?
            .with_timezone(&Utc);
        Ok(Setting {
            key: self.key,
            value: self.value,
            updated_at,
        })
    }
}

/// Repository wrapper around `SQLite` for plain settings.
#[derive(Clone)]
pub struct SettingsRepo {
    db: Arc<Database>,
}

impl SettingsRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Upsert a setting value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Read a setting value, if present.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, key: &str) -> Result<Option<Setting>> {
        let row: Option<SettingRow> = sqlx::query_as("SELECT * FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(SettingRow::into_setting).transpose()
    }

    /// Read all settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<Setting>> {
        let rows: Vec<SettingRow> = sqlx::query_as("SELECT * FROM settings ORDER BY key")
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(SettingRow::into_setting).collect()
    }
}
