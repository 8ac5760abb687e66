//! Idempotency repository for Slack Events API deliveries. Slack retries
//! events it considers unacknowledged; `record_event_id` lets the handler
//! tell a first delivery from a retry.

use std::sync::Arc;

use chrono::Utc;

use crate::Result;

use super::db::Database;

/// Repository wrapper around `SQLite` for the `seen_events` idempotency table.
#[derive(Clone)]
pub struct EventRepo {
    db: Arc<Database>,
}

impl EventRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record `event_id` as seen for `team_id`. Returns `true` if this is
    /// the first time it has been recorded (the caller should process the
    /// event), `false` if it was already seen (the caller should skip it).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn record_event_id(&self, team_id: &str, event_id: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO seen_events (team_id, event_id, seen_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(team_id, event_id) DO NOTHING",
        )
        .bind(team_id)
        .bind(event_id)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_delivery_is_new_retry_is_not() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = EventRepo::new(db);

        assert!(repo.record_event_id("T1", "Ev1").await.unwrap());
        assert!(!repo.record_event_id("T1", "Ev1").await.unwrap());
    }

    #[tokio::test]
    async fn same_event_id_in_different_teams_is_independent() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = EventRepo::new(db);

        assert!(repo.record_event_id("T1", "Ev1").await.unwrap());
        assert!(repo.record_event_id("T2", "Ev1").await.unwrap());
    }
}
