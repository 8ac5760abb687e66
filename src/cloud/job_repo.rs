//! Job repository: the queue of work destined for a specific paired device,
//! claimed by long-poll workers and completed by the local daemon (C6 §4.6).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::{AppError, Result};

use super::db::Database;
use super::models::{Job, JobKind, JobState};

const CLAIM_RETRY_ATTEMPTS: usize = 8;

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid timestamp: {e}")))
}

fn parse_opt_ts(s: &Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn kind_str(kind: JobKind) -> &'static str {
    match kind {
        JobKind::StartSession => "start_session",
        JobKind::FollowUp => "follow_up",
    }
}

fn parse_kind(s: &str) -> Result<JobKind> {
    match s {
        "start_session" => Ok(JobKind::StartSession),
        "follow_up" => Ok(JobKind::FollowUp),
        other => Err(AppError::Db(format!("invalid job kind: {other}"))),
    }
}

fn state_str(state: JobState) -> &'static str {
    match state {
        JobState::Queued => "queued",
        JobState::Claimed => "claimed",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
    }
}

fn parse_state(s: &str) -> Result<JobState> {
    match s {
        "queued" => Ok(JobState::Queued),
        "claimed" => Ok(JobState::Claimed),
        "completed" => Ok(JobState::Completed),
        "failed" => Ok(JobState::Failed),
        other => Err(AppError::Db(format!("invalid job state: {other}"))),
    }
}

#[derive(FromRow)]
struct JobRow {
    id: String,
    device_id: String,
    team_id: String,
    channel_id: String,
    root_ts: String,
    slack_user_id: String,
    kind: String,
    state: String,
    repo: Option<String>,
    tool: Option<String>,
    model: Option<String>,
    autopr: Option<i64>,
    branch_name: Option<String>,
    commit_msg: Option<String>,
    session_id: Option<String>,
    prompt: String,
    result_session_id: Option<String>,
    result_run_id: Option<String>,
    result_branch: Option<String>,
    result_pr_url: Option<String>,
    result_commit_sha: Option<String>,
    result_success: Option<i64>,
    result_error: Option<String>,
    created_at: String,
    updated_at: String,
    claimed_at: Option<String>,
    completed_at: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            device_id: self.device_id,
            team_id: self.team_id,
            channel_id: self.channel_id,
            root_ts: self.root_ts,
            slack_user_id: self.slack_user_id,
            kind: parse_kind(&self.kind)?,
            state: parse_state(&self.state)?,
            repo: self.repo,
            tool: self.tool,
            model: self.model,
            autopr: self.autopr.map(|v| v != 0),
            branch_name: self.branch_name,
            commit_msg: self.commit_msg,
            session_id: self.session_id,
            prompt: self.prompt,
            result_session_id: self.result_session_id,
            result_run_id: self.result_run_id,
            result_branch: self.result_branch,
            result_pr_url: self.result_pr_url,
            result_commit_sha: self.result_commit_sha,
            result_success: self.result_success.map(|v| v != 0),
            result_error: self.result_error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            claimed_at: parse_opt_ts(&self.claimed_at)?,
            completed_at: parse_opt_ts(&self.completed_at)?,
        })
    }
}

/// Fields needed to enqueue a new job. One of the `start_session`-only
/// fields or `session_id` (for a follow-up) should be set, matching `kind`.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub kind: JobKind,
    pub device_id: String,
    pub team_id: String,
    pub channel_id: String,
    pub root_ts: String,
    pub slack_user_id: String,
    pub prompt: String,
    pub repo: Option<String>,
    pub tool: Option<String>,
    pub model: Option<String>,
    pub autopr: Option<bool>,
    pub branch_name: Option<String>,
    pub commit_msg: Option<String>,
    pub session_id: Option<String>,
}

impl Default for JobKind {
    fn default() -> Self {
        Self::StartSession
    }
}

/// Enforce the kind-specific required fields: `start_session` requires a
/// non-empty `repo`; `follow_up` requires a non-empty `session_id`.
fn validate_new_job(job: &NewJob) -> Result<()> {
    match job.kind {
        JobKind::StartSession => {
            if job.repo.as_deref().unwrap_or("").trim().is_empty() {
                return Err(AppError::Validation(
                    "start_session job requires a non-empty repo".into(),
                ));
            }
        }
        JobKind::FollowUp => {
            if job.session_id.as_deref().unwrap_or("").trim().is_empty() {
                return Err(AppError::Validation(
                    "follow_up job requires a non-empty session_id".into(),
                ));
            }
        }
    }
    Ok(())
}

/// Outcome reported by the device when it finishes a job.
#[derive(Debug, Clone, Default)]
pub struct JobCompletion {
    pub success: bool,
    pub session_id: Option<String>,
    pub run_id: Option<String>,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub commit_sha: Option<String>,
    pub error: Option<String>,
}

/// Repository wrapper around `SQLite` for the device job queue.
#[derive(Clone)]
pub struct JobRepo {
    db: Arc<Database>,
}

impl JobRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Validate kind-specific required fields, assign an id, and insert a
    /// new queued job.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if `kind` is `start_session` with no
    /// `repo`, or `follow_up` with no `session_id`. Returns `AppError::Db` if
    /// the insert itself fails.
    pub async fn enqueue_job(&self, job: NewJob) -> Result<String> {
        validate_new_job(&job)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO jobs (
                id, device_id, team_id, channel_id, root_ts, slack_user_id, kind, state,
                repo, tool, model, autopr, branch_name, commit_msg, session_id, prompt,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'queued',
                ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)",
        )
        .bind(&id)
        .bind(&job.device_id)
        .bind(&job.team_id)
        .bind(&job.channel_id)
        .bind(&job.root_ts)
        .bind(&job.slack_user_id)
        .bind(kind_str(job.kind))
        .bind(&job.repo)
        .bind(&job.tool)
        .bind(&job.model)
        .bind(job.autopr.map(i64::from))
        .bind(&job.branch_name)
        .bind(&job.commit_msg)
        .bind(&job.session_id)
        .bind(&job.prompt)
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;
        Ok(id)
    }

    /// Claim the oldest queued job for `device_id`, marking it `claimed`.
    ///
    /// Retries on a claim race (another worker claimed the same candidate
    /// between the select and the conditional update) up to
    /// [`CLAIM_RETRY_ATTEMPTS`] times before giving up with `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a query fails.
    pub async fn claim_next_job(&self, device_id: &str) -> Result<Option<Job>> {
        for _ in 0..CLAIM_RETRY_ATTEMPTS {
            let candidate: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM jobs WHERE device_id = ?1 AND state = 'queued'
                 ORDER BY created_at ASC LIMIT 1",
            )
            .bind(device_id)
            .fetch_optional(self.db.as_ref())
            .await?;

            let Some((candidate_id,)) = candidate else {
                return Ok(None);
            };

            let now = Utc::now().to_rfc3339();
            let result = sqlx::query(
                "UPDATE jobs SET state = 'claimed', claimed_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND state = 'queued'",
            )
            .bind(&now)
            .bind(&candidate_id)
            .execute(self.db.as_ref())
            .await?;

            if result.rows_affected() == 0 {
                continue;
            }

            let row: JobRow = sqlx::query_as("SELECT * FROM jobs WHERE id = ?1")
                .bind(&candidate_id)
                .fetch_one(self.db.as_ref())
                .await?;
            return Ok(Some(row.into_job()?));
        }
        Ok(None)
    }

    /// Fetch a job by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(JobRow::into_job).transpose()
    }

    /// Record the device's outcome for a claimed job, keyed on `(id, device_id)`
    /// so a device can only complete jobs it actually claimed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the job is not in the `claimed` state
    /// owned by `device_id`, `AppError::Db` otherwise.
    pub async fn complete_job(
        &self,
        id: &str,
        device_id: &str,
        completion: JobCompletion,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let state = if completion.success {
            state_str(JobState::Completed)
        } else {
            state_str(JobState::Failed)
        };

        let result = sqlx::query(
            "UPDATE jobs SET
                state = ?1, result_session_id = ?2, result_run_id = ?3, result_branch = ?4,
                result_pr_url = ?5, result_commit_sha = ?6, result_success = ?7, result_error = ?8,
                completed_at = ?9, updated_at = ?9
             WHERE id = ?10 AND device_id = ?11 AND state = 'claimed'",
        )
        .bind(state)
        .bind(&completion.session_id)
        .bind(&completion.run_id)
        .bind(&completion.branch)
        .bind(&completion.pr_url)
        .bind(&completion.commit_sha)
        .bind(i64::from(completion.success))
        .bind(&completion.error)
        .bind(&now)
        .bind(id)
        .bind(device_id)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Conflict(format!(
                "job {id} is not claimed by device {device_id}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job() -> NewJob {
        NewJob {
            kind: JobKind::StartSession,
            device_id: "device-a".into(),
            team_id: "T1".into(),
            channel_id: "C1".into(),
            root_ts: "100.001".into(),
            slack_user_id: "U1".into(),
            prompt: "fix the bug".into(),
            repo: Some("git@example.com:org/repo.git".into()),
            tool: Some("claude".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn enqueue_rejects_start_session_without_repo() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = JobRepo::new(db);
        let job = NewJob { repo: None, ..new_job() };
        let result = repo.enqueue_job(job).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn enqueue_rejects_follow_up_without_session_id() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = JobRepo::new(db);
        let job = NewJob {
            kind: JobKind::FollowUp,
            session_id: None,
            repo: None,
            ..new_job()
        };
        let result = repo.enqueue_job(job).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn enqueue_accepts_follow_up_with_session_id() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = JobRepo::new(db);
        let job = NewJob {
            kind: JobKind::FollowUp,
            session_id: Some("sess-1".into()),
            repo: None,
            ..new_job()
        };
        assert!(repo.enqueue_job(job).await.is_ok());
    }

    #[tokio::test]
    async fn claim_returns_oldest_queued_job_once() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = JobRepo::new(db);
        repo.enqueue_job(new_job()).await.unwrap();

        let claimed = repo.claim_next_job("device-a").await.unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Claimed);

        assert!(repo.claim_next_job("device-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_ignores_other_devices_queue() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = JobRepo::new(db);
        repo.enqueue_job(new_job()).await.unwrap();

        assert!(repo.claim_next_job("device-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_requires_matching_device_and_claimed_state() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = JobRepo::new(db);
        let id = repo.enqueue_job(new_job()).await.unwrap();

        let wrong_device = repo
            .complete_job(&id, "device-b", JobCompletion { success: true, ..Default::default() })
            .await;
        assert!(matches!(wrong_device, Err(AppError::Conflict(_))));

        let claimed = repo.claim_next_job("device-a").await.unwrap().unwrap();
        assert_eq!(claimed.id, id);

        repo.complete_job(
            &id,
            "device-a",
            JobCompletion {
                success: true,
                session_id: Some("sess-1".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let job = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result_session_id.as_deref(), Some("sess-1"));

        let repeat = repo
            .complete_job(&id, "device-a", JobCompletion { success: true, ..Default::default() })
            .await;
        assert!(matches!(repeat, Err(AppError::Conflict(_))));
    }
}
