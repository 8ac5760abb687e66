//! Domain entities persisted by the local state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Run`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Run persisted, not yet started.
    Created,
    /// Running the session's `setup_cmd`.
    Setup,
    /// The AI tool is executing.
    AiRunning,
    /// Running the session's `validate_cmd`.
    Validating,
    /// Changes committed to the worktree branch.
    Committed,
    /// A draft pull request has been opened.
    PrCreated,
    /// Terminal: run finished successfully.
    Completed,
    /// Terminal: run finished with an error.
    Failed,
    /// Terminal: run was canceled.
    Cancelled,
}

impl RunState {
    /// Terminal states never transition further.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A single append-only event recorded against a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    /// `setup_cmd` started.
    Setup,
    /// The AI tool invocation started.
    AiStart,
    /// Incremental AI output, buffered and flushed by the run stream writer.
    AiStream,
    /// Final AI transcript, truncated to 8 KiB.
    AiOutput,
    /// Conversation id captured from the tool's streamed output.
    AiSession,
    /// A commit was made (or none was needed).
    Commit,
    /// A push or PR-creation step completed.
    Pr,
    /// Cancellation was requested for this run.
    CancelRequested,
    /// The run reached the `Cancelled` terminal state.
    Cancelled,
    /// The run reached the `Failed` terminal state.
    Error,
    /// A non-fatal problem occurred (e.g. fork summary generation failed).
    Warning,
    /// The run reached the `Completed` terminal state.
    Complete,
    /// This run was created by forking another session.
    Fork,
}

/// A managed git repository: one bare clone plus a base worktree tracking
/// its default branch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repo {
    /// `"owner/repo"`, the repo's unique identifier.
    pub name: String,
    /// Clone URL used by `ensure_repo`.
    pub url: String,
    /// Host, e.g. `"github.com"`.
    pub host: String,
    /// Repo owner/org.
    pub owner: String,
    /// Repo short name.
    pub repo: String,
    /// Absolute path to the bare clone.
    pub bare_path: String,
    /// Absolute path to the base (non-bare) worktree.
    pub base_worktree_path: String,
    /// Resolved default branch name.
    pub default_branch: String,
}

/// A user-facing coding session: one branch, one worktree lineage, many
/// runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// UUID.
    pub id: String,
    /// Foreign key into `repos.name`.
    pub repo_name: String,
    /// Branch this session's runs execute on.
    pub branch: String,
    /// Path of the most recent run's worktree.
    pub worktree_path: String,
    /// Adapter name (`claude`, `cursor`, `gemini`, `aider`).
    pub tool: String,
    /// Optional model override passed to the adapter.
    pub model: Option<String>,
    /// Whether completed runs should open a draft PR automatically.
    pub autopr: bool,
    /// URL of the opened pull request, if any.
    pub pr_url: Option<String>,
    /// Mirrors the state of the session's latest run.
    pub status: RunState,
    /// `true` while a run is in flight; the session-level mutex.
    pub busy: bool,
    /// Conversation id from the latest run's tool invocation, normalized
    /// here so follow-ups read it in O(1).
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One execution of a tool against a session's worktree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Run {
    /// UUID.
    pub id: String,
    /// Foreign key into `sessions.id`.
    pub session_id: String,
    /// The prompt this run was given.
    pub prompt: String,
    /// Worktree this run executed in.
    pub worktree_path: String,
    /// Current lifecycle state.
    pub state: RunState,
    /// Commit SHA produced by the commit pipeline, if any.
    pub commit_sha: Option<String>,
    /// Commit message used, if a commit was made.
    pub commit_msg: Option<String>,
    /// Error message, set when `state == Failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly once, when the run reaches a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

/// An append-only log entry for a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunEvent {
    /// Monotonic, assigned by the database.
    pub id: i64,
    /// Foreign key into `runs.id`.
    pub run_id: String,
    pub ts: DateTime<Utc>,
    pub kind: RunEventKind,
    /// Short human-readable summary.
    pub message: Option<String>,
    /// Arbitrary JSON payload (e.g. truncated transcript text).
    pub data: Option<String>,
}

/// A plain `(key, value)` configuration row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Setting {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}
