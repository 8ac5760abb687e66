//! Domain entities persisted by the cloud relay's multi-tenant store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Slack workspace that has installed the app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Installation {
    /// Slack team id, the tenancy key.
    pub team_id: String,
    /// Bot user id within the team.
    pub bot_user_id: String,
    /// `nonce || AES-GCM(bot_token)`, sealed under `aad = "slack_bot_token:" + team_id`.
    pub bot_token_sealed: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A local `fogd` instance that has claimed a pairing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    /// Opaque device id, generated on first claim.
    pub id: String,
    /// SHA-256 hex digest of the device's bearer token.
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A 1:1 binding between a Slack user in a workspace and a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pairing {
    pub team_id: String,
    pub slack_user_id: String,
    pub device_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A one-time code issued so a device can claim a pairing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairingRequest {
    /// Uppercased 4-byte hex code.
    pub code: String,
    pub team_id: String,
    pub slack_user_id: String,
    pub channel_id: String,
    pub root_ts: String,
    pub expires_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Maps a Slack thread root to the session created by its first job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadSession {
    pub team_id: String,
    pub channel_id: String,
    pub root_ts: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

/// Idempotency marker for a processed Slack event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeenEvent {
    pub team_id: String,
    pub event_id: String,
    pub seen_at: DateTime<Utc>,
}

/// Kind of work a [`Job`] represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    StartSession,
    FollowUp,
}

/// Lifecycle state of a [`Job`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Claimed,
    Completed,
    Failed,
}

impl JobState {
    /// Terminal states never transition further.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One unit of work targeting a paired device: a new session or a follow-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub device_id: String,
    pub team_id: String,
    pub channel_id: String,
    pub root_ts: String,
    pub slack_user_id: String,
    pub kind: JobKind,
    pub state: JobState,

    // start_session fields
    pub repo: Option<String>,
    pub tool: Option<String>,
    pub model: Option<String>,
    pub autopr: Option<bool>,
    pub branch_name: Option<String>,
    pub commit_msg: Option<String>,

    // follow_up fields
    pub session_id: Option<String>,

    /// Shared by both kinds: the user's prompt text.
    pub prompt: String,

    // completion payload
    pub result_session_id: Option<String>,
    pub result_run_id: Option<String>,
    pub result_branch: Option<String>,
    pub result_pr_url: Option<String>,
    pub result_commit_sha: Option<String>,
    pub result_success: Option<bool>,
    pub result_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
