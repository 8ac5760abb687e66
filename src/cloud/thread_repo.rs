//! Thread session repository: binds a Slack thread root to the `fogd`
//! session its first job created, so later replies in the thread become
//! follow-ups instead of new sessions.

use std::sync::Arc;

use chrono::Utc;
use sqlx::FromRow;

use crate::{AppError, Result};

use super::db::Database;
use super::models::ThreadSession;

#[derive(FromRow)]
struct ThreadSessionRow {
    team_id: String,
    channel_id: String,
    root_ts: String,
    session_id: String,
    created_at: String,
}

impl ThreadSessionRow {
    fn into_thread_session(self) -> Result<ThreadSession> {
        Ok(ThreadSession {
            team_id: self.team_id,
            channel_id: self.channel_id,
            root_ts: self.root_ts,
            session_id: self.session_id,
            created_at: chrono::DateTime::parse_from_rfc3339(&self.created_at)
                .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
                .with_timezone(&Utc),
        })
    }
}

/// Repository wrapper around `SQLite` for thread-to-session bindings.
#[derive(Clone)]
pub struct ThreadRepo {
    db: Arc<Database>,
}

impl ThreadRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Look up the session bound to a thread root, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(
        &self,
        team_id: &str,
        channel_id: &str,
        root_ts: &str,
    ) -> Result<Option<ThreadSession>> {
        let row: Option<ThreadSessionRow> = sqlx::query_as(
            "SELECT * FROM thread_sessions WHERE team_id = ?1 AND channel_id = ?2 AND root_ts = ?3",
        )
        .bind(team_id)
        .bind(channel_id)
        .bind(root_ts)
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(ThreadSessionRow::into_thread_session).transpose()
    }

    /// Bind a thread root to a session, the first time it is seen.
    ///
    /// Idempotent: a second bind for the same thread root is a no-op so a
    /// retried job enqueue does not silently repoint an existing thread at a
    /// different session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn bind(
        &self,
        team_id: &str,
        channel_id: &str,
        root_ts: &str,
        session_id: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO thread_sessions (team_id, channel_id, root_ts, session_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(team_id, channel_id, root_ts) DO NOTHING",
        )
        .bind(team_id)
        .bind(channel_id)
        .bind(root_ts)
        .bind(session_id)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_is_idempotent_and_first_write_wins() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = ThreadRepo::new(db);

        repo.bind("T1", "C1", "100.001", "session-a").await.unwrap();
        repo.bind("T1", "C1", "100.001", "session-b").await.unwrap();

        let found = repo.get("T1", "C1", "100.001").await.unwrap().unwrap();
        assert_eq!(found.session_id, "session-a");
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_thread() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = ThreadRepo::new(db);
        assert!(repo.get("T1", "C1", "999.999").await.unwrap().is_none());
    }
}
