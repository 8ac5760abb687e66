//! State store (C4): the local daemon's `SQLite`-backed persistence layer.

mod db;
mod models;
mod repo_repo;
mod run_event_repo;
mod run_repo;
mod schema;
mod secrets_repo;
mod session_repo;
mod settings_repo;

use std::path::Path;
use std::sync::Arc;

pub use db::Database;
pub use models::{Repo, Run, RunEvent, RunEventKind, RunState, Session, Setting};
pub use repo_repo::RepoRepo;
pub use run_event_repo::RunEventRepo;
pub use run_repo::{is_valid_transition, RunRepo};
pub use secrets_repo::SecretsRepo;
pub use session_repo::SessionRepo;
pub use settings_repo::SettingsRepo;

use crate::Result;

/// Bundles every repository over one shared connection pool.
#[derive(Clone)]
pub struct Store {
    /// Managed repos.
    pub repos: RepoRepo,
    /// Coding sessions.
    pub sessions: SessionRepo,
    /// Runs within a session.
    pub runs: RunRepo,
    /// Per-run append-only event log.
    pub run_events: RunEventRepo,
    /// Plain settings.
    pub settings: SettingsRepo,
    /// Encrypted secrets.
    pub secrets: SecretsRepo,
}

impl Store {
    /// Open (creating if necessary) the local daemon's database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the connection or schema bootstrap fails.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = Arc::new(db::connect(path).await?);
        Ok(Self::from_pool(pool))
    }

    /// Open an in-memory database, primarily for tests.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the connection or schema bootstrap fails.
    pub async fn open_memory() -> Result<Self> {
        let pool = Arc::new(db::connect_memory().await?);
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: Arc<Database>) -> Self {
        Self {
            repos: RepoRepo::new(Arc::clone(&pool)),
            sessions: SessionRepo::new(Arc::clone(&pool)),
            runs: RunRepo::new(Arc::clone(&pool)),
            run_events: RunEventRepo::new(Arc::clone(&pool)),
            settings: SettingsRepo::new(Arc::clone(&pool)),
            secrets: SecretsRepo::new(pool),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppError;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_repo() -> Repo {
        Repo {
            name: "acme/widgets".to_string(),
            url: "https://github.com/acme/widgets.git".to_string(),
            host: "github.com".to_string(),
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
            bare_path: "/tmp/acme/widgets/repo.git".to_string(),
            base_worktree_path: "/tmp/acme/widgets/base".to_string(),
            default_branch: "main".to_string(),
        }
    }

    fn sample_session(repo_name: &str) -> Session {
        let now = Utc::now();
        Session {
            id: Uuid::new_v4().to_string(),
            repo_name: repo_name.to_string(),
            branch: "fog/task".to_string(),
            worktree_path: "/tmp/acme/widgets/worktrees/fog-task-aaaaaaaa".to_string(),
            tool: "claude".to_string(),
            model: None,
            autopr: false,
            pr_url: None,
            status: RunState::Created,
            busy: true,
            conversation_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_run(session_id: &str) -> Run {
        let now = Utc::now();
        Run {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            prompt: "add a widget".to_string(),
            worktree_path: "/tmp/acme/widgets/worktrees/fog-task-aaaaaaaa".to_string(),
            state: RunState::Created,
            commit_sha: None,
            commit_msg: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn repo_upsert_is_idempotent_and_queryable() {
        let store = Store::open_memory().await.unwrap();
        let repo = sample_repo();
        store.repos.upsert(&repo).await.unwrap();
        store.repos.upsert(&repo).await.unwrap();

        let fetched = store.repos.require_by_name(&repo.name).await.unwrap();
        assert_eq!(fetched, repo);
        assert_eq!(store.repos.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn session_busy_claim_is_exclusive() {
        let store = Store::open_memory().await.unwrap();
        store.repos.upsert(&sample_repo()).await.unwrap();
        let mut session = sample_session("acme/widgets");
        session.busy = false;
        store.sessions.create(&session).await.unwrap();

        assert!(store.sessions.try_claim_busy(&session.id).await.unwrap());
        assert!(!store.sessions.try_claim_busy(&session.id).await.unwrap());
    }

    #[tokio::test]
    async fn run_state_transition_rejects_skipping_ai_running() {
        let store = Store::open_memory().await.unwrap();
        store.repos.upsert(&sample_repo()).await.unwrap();
        let session = sample_session("acme/widgets");
        store.sessions.create(&session).await.unwrap();
        let run = sample_run(&session.id);
        store.runs.create(&run).await.unwrap();

        let result = store.runs.set_state(&run.id, RunState::Committed).await;
        assert!(result.is_err());

        store.runs.set_state(&run.id, RunState::AiRunning).await.unwrap();
        let fetched = store.runs.require(&run.id).await.unwrap();
        assert_eq!(fetched.state, RunState::AiRunning);
    }

    #[tokio::test]
    async fn run_events_preserve_insertion_order() {
        let store = Store::open_memory().await.unwrap();
        store.repos.upsert(&sample_repo()).await.unwrap();
        let session = sample_session("acme/widgets");
        store.sessions.create(&session).await.unwrap();
        let run = sample_run(&session.id);
        store.runs.create(&run).await.unwrap();

        store
            .run_events
            .append(&run.id, RunEventKind::Setup, Some("running setup"), None)
            .await
            .unwrap();
        store
            .run_events
            .append(&run.id, RunEventKind::AiStart, None, None)
            .await
            .unwrap();

        let events = store.run_events.list(&run.id, 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, RunEventKind::Setup);
        assert_eq!(events[1].kind, RunEventKind::AiStart);
        assert!(events[0].id < events[1].id);
    }

    #[tokio::test]
    async fn missing_session_update_is_not_found() {
        let store = Store::open_memory().await.unwrap();
        let result = store.sessions.update_status("does-not-exist", RunState::Setup).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }
}
