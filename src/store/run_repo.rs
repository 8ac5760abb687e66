//! Run repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;
use sqlx::FromRow;

use crate::{AppError, Result};

use super::db::Database;
use super::models::{Run, RunState};
use super::session_repo::{parse_state, state_str};

/// Allowed run-state transitions, mirroring the session engine's pipeline.
/// Any state may also move to `Failed` or `Cancelled`.
#[must_use]
pub fn is_valid_transition(from: RunState, to: RunState) -> bool {
    if matches!(to, RunState::Failed | RunState::Cancelled) {
        return !from.is_terminal();
    }
    matches!(
        (from, to),
        (RunState::Created, RunState::Setup | RunState::AiRunning)
            | (RunState::Setup, RunState::AiRunning)
            | (RunState::AiRunning, RunState::Validating | RunState::Committed)
            | (RunState::Validating, RunState::Committed)
            | (RunState::Committed, RunState::PrCreated | RunState::Completed)
            | (RunState::PrCreated, RunState::Completed)
    )
}

#[derive(FromRow)]
struct RunRow {
    id: String,
    session_id: String,
    prompt: String,
    worktree_path: String,
    state: String,
    commit_sha: Option<String>,
    commit_msg: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        let state = parse_state(&self.state)?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);
        let updated_at = chrono::DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| AppError::Db(format!("invalid updated_at: {e}")))?
            .with_timezone(&Utc);
        let completed_at = self
            .completed_at
            .as_deref()
            .map(|s| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| AppError::Db(format!("invalid completed_at: {e}")))
            })
            .transpose()?;

        Ok(Run {
            id: self.id,
            session_id: self.session_id,
            prompt: self.prompt,
            worktree_path: self.worktree_path,
            state,
            commit_sha: self.commit_sha,
            commit_msg: self.commit_msg,
            error: self.error,
            created_at,
            updated_at,
            completed_at,
        })
    }
}

/// Repository wrapper around `SQLite` for run records.
#[derive(Clone)]
pub struct RunRepo {
    db: Arc<Database>,
}

impl RunRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new run record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, run: &Run) -> Result<Run> {
        sqlx::query(
            "INSERT INTO runs (id, session_id, prompt, worktree_path, state, commit_sha,
             commit_msg, error, created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(&run.id)
        .bind(&run.session_id)
        .bind(&run.prompt)
        .bind(&run.worktree_path)
        .bind(state_str(run.state))
        .bind(&run.commit_sha)
        .bind(&run.commit_msg)
        .bind(&run.error)
        .bind(run.created_at.to_rfc3339())
        .bind(run.updated_at.to_rfc3339())
        .bind(run.completed_at.map(|dt| dt.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;

        Ok(run.clone())
    }

    /// Retrieve a run by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<Run>> {
        let row: Option<RunRow> = sqlx::query_as("SELECT * FROM runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(RunRow::into_run).transpose()
    }

    /// Retrieve a run by id, erroring if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such run exists.
    pub async fn require(&self, id: &str) -> Result<Run> {
        self.get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("run {id} not found")))
    }

    /// List a session's runs, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_session(&self, session_id: &str) -> Result<Vec<Run>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            "SELECT * FROM runs WHERE session_id = ?1 ORDER BY created_at DESC",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    /// Fetch the most recently created run for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_latest_run(&self, session_id: &str) -> Result<Option<Run>> {
        let row: Option<RunRow> = sqlx::query_as(
            "SELECT * FROM runs WHERE session_id = ?1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(RunRow::into_run).transpose()
    }

    /// Transition a run to a new state, validating the transition.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the transition is invalid, or
    /// `AppError::NotFound` if the run does not exist.
    pub async fn set_state(&self, id: &str, state: RunState) -> Result<()> {
        let current = self.require(id).await?;
        if !is_valid_transition(current.state, state) {
            return Err(AppError::Conflict(format!(
                "invalid run state transition: {} -> {}",
                state_str(current.state),
                state_str(state)
            )));
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE runs SET state = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(state_str(state))
            .bind(&now)
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Transition a run to a terminal state, recording the commit/error
    /// outcome and setting `completed_at` exactly once.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if `state` is not terminal or the
    /// transition is invalid, `AppError::NotFound` if the run does not
    /// exist.
    pub async fn complete(
        &self,
        id: &str,
        state: RunState,
        commit_sha: Option<&str>,
        commit_msg: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        if !state.is_terminal() {
            return Err(AppError::Conflict(format!(
                "complete() requires a terminal state, got {}",
                state_str(state)
            )));
        }

        let current = self.require(id).await?;
        if !is_valid_transition(current.state, state) {
            return Err(AppError::Conflict(format!(
                "invalid run state transition: {} -> {}",
                state_str(current.state),
                state_str(state)
            )));
        }

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE runs SET state = ?1, commit_sha = ?2, commit_msg = ?3, error = ?4,
             updated_at = ?5, completed_at = ?5 WHERE id = ?6",
        )
        .bind(state_str(state))
        .bind(commit_sha)
        .bind(commit_msg)
        .bind(error)
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("run {id} not found")));
        }
        Ok(())
    }
}
