//! Session repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;
use sqlx::FromRow;

use crate::{AppError, Result};

use super::db::Database;
use super::models::{RunState, Session};

/// Parse a run-state string into the domain enum.
pub(super) fn parse_state(s: &str) -> Result<RunState> {
    match s {
        "created" => Ok(RunState::Created),
        "setup" => Ok(RunState::Setup),
        "ai_running" => Ok(RunState::AiRunning),
        "validating" => Ok(RunState::Validating),
        "committed" => Ok(RunState::Committed),
        "pr_created" => Ok(RunState::PrCreated),
        "completed" => Ok(RunState::Completed),
        "failed" => Ok(RunState::Failed),
        "cancelled" => Ok(RunState::Cancelled),
        other => Err(AppError::Db(format!("invalid run state: {other}"))),
    }
}

/// Serialize a run-state enum to its database string.
pub(super) fn state_str(s: RunState) -> &'static str {
    match s {
        RunState::Created => "created",
        RunState::Setup => "setup",
        RunState::AiRunning => "ai_running",
        RunState::Validating => "validating",
        RunState::Committed => "committed",
        RunState::PrCreated => "pr_created",
        RunState::Completed => "completed",
        RunState::Failed => "failed",
        RunState::Cancelled => "cancelled",
    }
}

#[derive(FromRow)]
struct SessionRow {
    id: String,
    repo_name: String,
    branch: String,
    worktree_path: String,
    tool: String,
    model: Option<String>,
    autopr: i64,
    pr_url: Option<String>,
    status: String,
    busy: i64,
    conversation_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        let status = parse_state(&self.status)?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);
        let updated_at = chrono::DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| AppError::Db(format!("invalid updated_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Session {
            id: self.id,
            repo_name: self.repo_name,
            branch: self.branch,
            worktree_path: self.worktree_path,
            tool: self.tool,
            model: self.model,
            autopr: self.autopr != 0,
            pr_url: self.pr_url,
            status,
            busy: self.busy != 0,
            conversation_id: self.conversation_id,
            created_at,
            updated_at,
        })
    }
}

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, session: &Session) -> Result<Session> {
        sqlx::query(
            "INSERT INTO sessions (id, repo_name, branch, worktree_path, tool, model, autopr,
             pr_url, status, busy, conversation_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(&session.id)
        .bind(&session.repo_name)
        .bind(&session.branch)
        .bind(&session.worktree_path)
        .bind(&session.tool)
        .bind(&session.model)
        .bind(i64::from(session.autopr))
        .bind(&session.pr_url)
        .bind(state_str(session.status))
        .bind(i64::from(session.busy))
        .bind(&session.conversation_id)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Retrieve a session by id, erroring if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such session exists.
    pub async fn require(&self, id: &str) -> Result<Session> {
        self.get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
    }

    /// List all sessions, newest `updated_at` first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM sessions ORDER BY updated_at DESC")
                .fetch_all(self.db.as_ref())
                .await?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Set the `busy` flag. Used as the session-level mutex: callers check
    /// the returned row count to detect a lost race.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn set_busy(&self, id: &str, busy: bool) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query("UPDATE sessions SET busy = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(i64::from(busy))
            .bind(&now)
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id} not found")));
        }
        Ok(())
    }

    /// Atomically claim the busy flag: succeeds only if the session was not
    /// already busy. Returns `true` if the claim succeeded.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn try_claim_busy(&self, id: &str) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_one(self.db.as_ref())
            .await?;
        if exists == 0 {
            return Err(AppError::NotFound(format!("session {id} not found")));
        }

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE sessions SET busy = 1, updated_at = ?1 WHERE id = ?2 AND busy = 0",
        )
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Update the session's mirrored status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn update_status(&self, id: &str, status: RunState) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query("UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(state_str(status))
            .bind(&now)
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id} not found")));
        }
        Ok(())
    }

    /// Set the pull request URL.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn set_pr_url(&self, id: &str, pr_url: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query("UPDATE sessions SET pr_url = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(pr_url)
            .bind(&now)
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id} not found")));
        }
        Ok(())
    }

    /// Set the current worktree path (updated each time a new run starts).
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn set_worktree_path(&self, id: &str, worktree_path: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE sessions SET worktree_path = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(worktree_path)
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id} not found")));
        }
        Ok(())
    }

    /// Update the normalized conversation id captured from the latest run's
    /// tool invocation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn set_conversation_id(&self, id: &str, conversation_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE sessions SET conversation_id = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(conversation_id)
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id} not found")));
        }
        Ok(())
    }
}
