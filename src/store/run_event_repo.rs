//! Run event repository: the append-only per-run log.

use std::sync::Arc;

use chrono::Utc;
use sqlx::FromRow;

use crate::{AppError, Result};

use super::db::Database;
use super::models::{RunEvent, RunEventKind};

const DEFAULT_LIMIT: i64 = 200;
const MAX_LIMIT: i64 = 2000;

fn parse_kind(s: &str) -> Result<RunEventKind> {
    match s {
        "setup" => Ok(RunEventKind::Setup),
        "ai_start" => Ok(RunEventKind::AiStart),
        "ai_stream" => Ok(RunEventKind::AiStream),
        "ai_output" => Ok(RunEventKind::AiOutput),
        "ai_session" => Ok(RunEventKind::AiSession),
        "commit" => Ok(RunEventKind::Commit),
        "pr" => Ok(RunEventKind::Pr),
        "cancel_requested" => Ok(RunEventKind::CancelRequested),
        "cancelled" => Ok(RunEventKind::Cancelled),
        "error" => Ok(RunEventKind::Error),
        "warning" => Ok(RunEventKind::Warning),
        "complete" => Ok(RunEventKind::Complete),
        "fork" => Ok(RunEventKind::Fork),
        other => Err(AppError::Db(format!("invalid run event type: {other}"))),
    }
}

fn kind_str(kind: RunEventKind) -> &'static str {
    match kind {
        RunEventKind::Setup => "setup",
        RunEventKind::AiStart => "ai_start",
        RunEventKind::AiStream => "ai_stream",
        RunEventKind::AiOutput => "ai_output",
        RunEventKind::AiSession => "ai_session",
        RunEventKind::Commit => "commit",
        RunEventKind::Pr => "pr",
        RunEventKind::CancelRequested => "cancel_requested",
        RunEventKind::Cancelled => "cancelled",
        RunEventKind::Error => "error",
        RunEventKind::Warning => "warning",
        RunEventKind::Complete => "complete",
        RunEventKind::Fork => "fork",
    }
}

#[derive(FromRow)]
struct RunEventRow {
    id: i64,
    run_id: String,
    ts: String,
    #[sqlx(rename = "type")]
    event_type: String,
    message: Option<String>,
    data: Option<String>,
}

impl RunEventRow {
    fn into_event(self) -> Result<RunEvent> {
        let kind = parse_kind(&self.event_type)?;
        let ts = chrono::DateTime::parse_from_rfc3339(&self.ts)
            .map_err(|e| AppError::Db(format!("invalid ts: {e}")))?
            .with_timezone(&Utc);
        Ok(RunEvent {
            id: self.id,
            run_id: self.run_id,
            ts,
            kind,
            message: self.message,
            data: self.data,
        })
    }
}

/// Repository wrapper around `SQLite` for the append-only run event log.
#[derive(Clone)]
pub struct RunEventRepo {
    db: Arc<Database>,
}

impl RunEventRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append a new event to a run's log. `id` and `ts` are assigned here;
    /// the value passed for them is ignored.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn append(
        &self,
        run_id: &str,
        kind: RunEventKind,
        message: Option<&str>,
        data: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO run_events (run_id, ts, type, message, data) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(run_id)
        .bind(&now)
        .bind(kind_str(kind))
        .bind(message)
        .bind(data)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// List a run's events in ascending `id` order.
    ///
    /// `limit` is clamped to `[1, 2000]`; a value of `0` or less yields the
    /// default of 200.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, run_id: &str, limit: i64) -> Result<Vec<RunEvent>> {
        let clamped = if limit <= 0 {
            DEFAULT_LIMIT
        } else {
            limit.min(MAX_LIMIT)
        };

        let rows: Vec<RunEventRow> = sqlx::query_as(
            "SELECT * FROM run_events WHERE run_id = ?1 ORDER BY id ASC LIMIT ?2",
        )
        .bind(run_id)
        .bind(clamped)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(RunEventRow::into_event).collect()
    }

    /// List a run's events with `id` strictly greater than `after_id`,
    /// ascending, used by the SSE tail endpoint to resume from a client's
    /// last-seen event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_after(&self, run_id: &str, after_id: i64) -> Result<Vec<RunEvent>> {
        let rows: Vec<RunEventRow> = sqlx::query_as(
            "SELECT * FROM run_events WHERE run_id = ?1 AND id > ?2 ORDER BY id ASC LIMIT ?3",
        )
        .bind(run_id)
        .bind(after_id)
        .bind(MAX_LIMIT)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(RunEventRow::into_event).collect()
    }
}
