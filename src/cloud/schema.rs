//! `SQLite` schema bootstrap for the cloud relay's multi-tenant database.

use sqlx::SqlitePool;

use crate::Result;

/// Apply every table definition idempotently. Safe to call on every startup.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS installations (
    team_id             TEXT PRIMARY KEY NOT NULL,
    bot_user_id         TEXT NOT NULL,
    bot_token_sealed    BLOB NOT NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS devices (
    id              TEXT PRIMARY KEY NOT NULL,
    token_hash      TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pairings (
    team_id         TEXT NOT NULL,
    slack_user_id   TEXT NOT NULL,
    device_id       TEXT NOT NULL REFERENCES devices(id),
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (team_id, slack_user_id)
);

CREATE TABLE IF NOT EXISTS pairing_requests (
    code            TEXT PRIMARY KEY NOT NULL,
    team_id         TEXT NOT NULL,
    slack_user_id   TEXT NOT NULL,
    channel_id      TEXT NOT NULL,
    root_ts         TEXT NOT NULL,
    expires_at      TEXT NOT NULL,
    claimed_at      TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS thread_sessions (
    team_id         TEXT NOT NULL,
    channel_id      TEXT NOT NULL,
    root_ts         TEXT NOT NULL,
    session_id      TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    PRIMARY KEY (team_id, channel_id, root_ts)
);

CREATE TABLE IF NOT EXISTS seen_events (
    team_id         TEXT NOT NULL,
    event_id        TEXT NOT NULL,
    seen_at         TEXT NOT NULL,
    PRIMARY KEY (team_id, event_id)
);

CREATE TABLE IF NOT EXISTS jobs (
    id                  TEXT PRIMARY KEY NOT NULL,
    device_id           TEXT NOT NULL REFERENCES devices(id),
    team_id             TEXT NOT NULL,
    channel_id          TEXT NOT NULL,
    root_ts             TEXT NOT NULL,
    slack_user_id       TEXT NOT NULL,
    kind                TEXT NOT NULL CHECK(kind IN ('start_session','follow_up')),
    state               TEXT NOT NULL CHECK(state IN ('queued','claimed','completed','failed')),
    repo                TEXT,
    tool                TEXT,
    model               TEXT,
    autopr              INTEGER,
    branch_name         TEXT,
    commit_msg          TEXT,
    session_id          TEXT,
    prompt              TEXT NOT NULL,
    result_session_id   TEXT,
    result_run_id       TEXT,
    result_branch       TEXT,
    result_pr_url       TEXT,
    result_commit_sha   TEXT,
    result_success      INTEGER,
    result_error        TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    claimed_at          TEXT,
    completed_at        TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_device_state_created
    ON jobs(device_id, state, created_at);
CREATE INDEX IF NOT EXISTS idx_thread_sessions_lookup
    ON thread_sessions(team_id, channel_id, root_ts, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_pairing_requests_team_user
    ON pairing_requests(team_id, slack_user_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
