//! `SQLite` schema bootstrap logic for the local daemon's database.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` — safe to re-run
//! on every server startup.

use sqlx::SqlitePool;

use crate::Result;

/// Add a column to a table if it does not already exist.
///
/// Uses `PRAGMA table_info` to check column presence before issuing
/// `ALTER TABLE`, making the operation idempotent on repeated startups.
///
/// # Errors
///
/// Returns `AppError::Db` if the PRAGMA query or `ALTER TABLE` fails.
async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    alter_sql: &str,
) -> Result<()> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = '{column}'"
    ))
    .fetch_one(pool)
    .await?;

    if count == 0 {
        sqlx::raw_sql(alter_sql).execute(pool).await?;
    }
    Ok(())
}

/// Migrate columns added after the initial schema shipped.
///
/// # Errors
///
/// Returns `AppError::Db` if any check or migration fails.
async fn migrate_columns(pool: &SqlitePool) -> Result<()> {
    add_column_if_missing(
        pool,
        "runs",
        "worktree_path",
        "ALTER TABLE runs ADD COLUMN worktree_path TEXT NOT NULL DEFAULT ''",
    )
    .await?;

    add_column_if_missing(
        pool,
        "sessions",
        "conversation_id",
        "ALTER TABLE sessions ADD COLUMN conversation_id TEXT",
    )
    .await?;

    Ok(())
}

/// Apply all table definitions to the connected `SQLite` database.
///
/// Creates every table idempotently. Safe to call on every startup.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS settings (
    key             TEXT PRIMARY KEY NOT NULL,
    value           TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS secrets (
    key             TEXT PRIMARY KEY NOT NULL,
    ciphertext      BLOB NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS repos (
    name                TEXT PRIMARY KEY NOT NULL,
    url                 TEXT NOT NULL,
    host                TEXT NOT NULL,
    owner               TEXT NOT NULL,
    repo                TEXT NOT NULL,
    bare_path           TEXT NOT NULL,
    base_worktree_path  TEXT NOT NULL,
    default_branch      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY NOT NULL,
    repo_name       TEXT NOT NULL REFERENCES repos(name),
    branch          TEXT NOT NULL,
    worktree_path   TEXT NOT NULL,
    tool            TEXT NOT NULL,
    model           TEXT,
    autopr          INTEGER NOT NULL DEFAULT 0,
    pr_url          TEXT,
    status          TEXT NOT NULL CHECK(status IN
        ('created','setup','ai_running','validating','committed','pr_created',
         'completed','failed','cancelled')),
    busy            INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id              TEXT PRIMARY KEY NOT NULL,
    session_id      TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    prompt          TEXT NOT NULL,
    worktree_path   TEXT NOT NULL DEFAULT '',
    state           TEXT NOT NULL CHECK(state IN
        ('created','setup','ai_running','validating','committed','pr_created',
         'completed','failed','cancelled')),
    commit_sha      TEXT,
    commit_msg      TEXT,
    error           TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    completed_at    TEXT
);

CREATE TABLE IF NOT EXISTS run_events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id          TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    ts              TEXT NOT NULL,
    type            TEXT NOT NULL CHECK(type IN
        ('setup','ai_start','ai_stream','ai_output','ai_session','commit','pr',
         'cancel_requested','cancelled','error','warning','complete','fork')),
    message         TEXT,
    data            TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions(updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_runs_session_created ON runs(session_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_run_events_run_id ON run_events(run_id, id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    migrate_columns(pool).await?;
    Ok(())
}
