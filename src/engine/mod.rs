//! Session engine (C5): the session/run state machine, orchestration of
//! [`crate::git`] and [`crate::tool`], and the cancellation registry.

mod branch;
mod cancel;
mod pipeline;

use std::path::PathBuf;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub use cancel::{ActiveRun, ActiveRunRegistry};
pub use pipeline::RunOptions;

use crate::git::{self, RepoPaths};
use crate::store::{Repo, Run, RunEventKind, RunState, Session, Store};
use crate::tool::{self, ToolAdapter};
use crate::{AppError, Result};

/// Options accepted by [`Engine::start_session`].
#[derive(Debug, Clone)]
pub struct StartSessionOptions {
    pub repo_name: String,
    pub branch: Option<String>,
    pub tool: String,
    pub model: Option<String>,
    pub prompt: String,
    pub autopr: bool,
    pub setup_cmd: Option<String>,
    pub validate: bool,
    pub validate_cmd: Option<String>,
    pub commit_msg: Option<String>,
}

fn require_nonempty(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn repo_paths(repo: &Repo) -> RepoPaths {
    RepoPaths {
        bare_path: PathBuf::from(&repo.bare_path),
        base_worktree_path: PathBuf::from(&repo.base_worktree_path),
    }
}

/// Owns the store, the tool adapter registry, and the cancellation
/// registry. Constructed once per process as an `Arc<Engine>`.
#[derive(Clone)]
pub struct Engine {
    store: Store,
    active_runs: ActiveRunRegistry,
    default_tool: String,
    branch_prefix: String,
}

impl Engine {
    /// Build a new engine over an already-open store.
    #[must_use]
    pub fn new(store: Store, default_tool: String, branch_prefix: String) -> Self {
        Self {
            store,
            active_runs: ActiveRunRegistry::new(),
            default_tool,
            branch_prefix,
        }
    }

    /// The underlying store, for read-only queries from the HTTP layer.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    fn resolve_tool(&self, requested: &str) -> Result<Box<dyn ToolAdapter>> {
        let name = if requested.trim().is_empty() {
            self.default_tool.as_str()
        } else {
            requested
        };
        tool::by_name(name).ok_or_else(|| AppError::Validation(format!("unknown tool {name}")))
    }

    /// `StartSession(opts)`: validate, create the worktree, persist the
    /// session and its first run, then execute the run to completion.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if required fields are missing or the
    /// branch name is invalid, and propagates any persistence error.
    pub async fn start_session(&self, opts: StartSessionOptions) -> Result<(Session, Run)> {
        let (session, run, cancel, options) = self.prepare_start(opts).await?;
        self.run_to_completion(&session, &run, cancel, options).await?;
        let session = self.store.sessions.require(&session.id).await?;
        let run = self.store.runs.require(&run.id).await?;
        Ok((session, run))
    }

    /// `StartSessionAsync(opts)`: identical to [`Engine::start_session`] but
    /// returns immediately after persistence, executing the run on a
    /// spawned task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if required fields are missing or the
    /// branch name is invalid.
    pub async fn start_session_async(&self, opts: StartSessionOptions) -> Result<(Session, Run)> {
        let (session, run, cancel, options) = self.prepare_start(opts).await?;
        let engine = self.clone();
        let spawned_session = session.clone();
        let spawned_run = run.clone();
        tokio::spawn(async move {
            if let Err(err) = engine
                .run_to_completion(&spawned_session, &spawned_run, cancel, options)
                .await
            {
                warn!(session_id = %spawned_session.id, %err, "run execution task failed");
            }
        });
        Ok((session, run))
    }

    async fn prepare_start(
        &self,
        opts: StartSessionOptions,
    ) -> Result<(Session, Run, CancellationToken, RunOptions)> {
        let repo_name = require_nonempty("repoName", &opts.repo_name)?;
        let tool_name = require_nonempty("tool", &opts.tool)?;
        let prompt = require_nonempty("prompt", &opts.prompt)?;

        let repo = self.store.repos.require_by_name(&repo_name).await?;
        let branch = branch::resolve(opts.branch.as_deref(), &prompt, &self.branch_prefix)?;

        let run_id = Uuid::new_v4().to_string();
        let paths = repo_paths(&repo);
        let worktree_path = git::create_worktree(
            &CancellationToken::new(),
            &paths,
            &branch,
            &run_id,
        )
        .await?
        .to_string_lossy()
        .into_owned();

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            repo_name,
            branch,
            worktree_path: worktree_path.clone(),
            tool: tool_name,
            model: opts.model,
            autopr: opts.autopr,
            pr_url: None,
            status: RunState::Created,
            busy: true,
            conversation_id: None,
            created_at: now,
            updated_at: now,
        };
        self.store.sessions.create(&session).await?;

        let run = Run {
            id: run_id,
            session_id: session.id.clone(),
            prompt,
            worktree_path,
            state: RunState::Created,
            commit_sha: None,
            commit_msg: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.store.runs.create(&run).await?;

        let cancel = self.active_runs.register(&session.id, &run.id);
        let options = RunOptions {
            setup_cmd: opts.setup_cmd,
            validate: opts.validate,
            validate_cmd: opts.validate_cmd,
            commit_msg: opts.commit_msg,
            autopr: opts.autopr,
        };

        Ok((session, run, cancel, options))
    }

    async fn run_to_completion(
        &self,
        session: &Session,
        run: &Run,
        cancel: CancellationToken,
        options: RunOptions,
    ) -> Result<()> {
        let adapter = self.resolve_tool(&session.tool)?;

        let result = pipeline::execute_run(pipeline::RunContext {
            store: &self.store,
            cancel: &cancel,
            session_id: session.id.clone(),
            run_id: run.id.clone(),
            worktree_path: run.worktree_path.clone(),
            prompt: run.prompt.clone(),
            tool: adapter.as_ref(),
            model: session.model.clone(),
            conversation_id: session.conversation_id.clone(),
            options,
        })
        .await;

        self.active_runs.clear(&session.id);
        result
    }

    async fn prepare_continue(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<(Session, Run, CancellationToken, RunOptions)> {
        let prompt = require_nonempty("prompt", prompt)?;
        let session = self.store.sessions.require(session_id).await?;

        if !self.store.sessions.try_claim_busy(session_id).await? {
            return Err(AppError::Conflict(format!(
                "session {session_id} is already busy"
            )));
        }

        let repo = self.store.repos.require_by_name(&session.repo_name).await?;
        let paths = repo_paths(&repo);
        let cancel = CancellationToken::new();
        git::detach_worktree(&cancel, std::path::Path::new(&session.worktree_path)).await;

        let run_id = Uuid::new_v4().to_string();
        let worktree_path = git::create_worktree(&cancel, &paths, &session.branch, &run_id)
            .await?
            .to_string_lossy()
            .into_owned();
        self.store.sessions.set_worktree_path(session_id, &worktree_path).await?;

        let now = Utc::now();
        let run = Run {
            id: run_id,
            session_id: session.id.clone(),
            prompt,
            worktree_path,
            state: RunState::Created,
            commit_sha: None,
            commit_msg: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.store.runs.create(&run).await?;

        let cancel = self.active_runs.register(&session.id, &run.id);
        let session = self.store.sessions.require(session_id).await?;
        let options = RunOptions {
            setup_cmd: None,
            validate: false,
            validate_cmd: None,
            commit_msg: None,
            autopr: session.autopr,
        };

        Ok((session, run, cancel, options))
    }

    /// `ContinueSession(sessionID, prompt)`: requires the session to exist
    /// and be idle, detaches the prior worktree, creates a fresh one, and
    /// executes a new run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the session is already busy, or
    /// `AppError::NotFound` if it does not exist.
    pub async fn continue_session(&self, session_id: &str, prompt: &str) -> Result<(Session, Run)> {
        let (session, run, cancel, options) = self.prepare_continue(session_id, prompt).await?;
        self.run_to_completion(&session, &run, cancel, options).await?;

        let session = self.store.sessions.require(session_id).await?;
        let run = self.store.runs.require(&run.id).await?;
        Ok((session, run))
    }

    /// `ContinueSessionAsync(sessionID, prompt)`: identical to
    /// [`Engine::continue_session`] but returns as soon as the new run is
    /// persisted, executing it on a spawned task.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::continue_session`].
    pub async fn continue_session_async(
        &self,
        session_id: &str,
        prompt: &str,
    ) -> Result<(Session, Run)> {
        let (session, run, cancel, options) = self.prepare_continue(session_id, prompt).await?;
        let engine = self.clone();
        let spawned_session = session.clone();
        let spawned_run = run.clone();
        tokio::spawn(async move {
            if let Err(err) = engine
                .run_to_completion(&spawned_session, &spawned_run, cancel, options)
                .await
            {
                warn!(session_id = %spawned_session.id, %err, "run execution task failed");
            }
        });
        Ok((session, run))
    }

    /// `ForkSession(srcID, opts)`: create a fresh session on a new branch,
    /// optionally prefixing the prompt with a bounded AI-generated summary
    /// of the source session, then delegate to `StartSession`.
    ///
    /// # Errors
    ///
    /// Propagates the same errors as [`Engine::start_session`].
    pub async fn fork_session(
        &self,
        source_id: &str,
        opts: StartSessionOptions,
    ) -> Result<(Session, Run)> {
        let (opts, summary_unavailable) = self.apply_fork_summary(source_id, opts).await?;
        let (session, run) = self.start_session(opts).await?;
        self.record_fork_event(&run.id, source_id, summary_unavailable).await?;
        Ok((session, run))
    }

    /// `ForkSessionAsync(srcID, opts)`: identical to [`Engine::fork_session`]
    /// but executes the forked run on a spawned task.
    ///
    /// # Errors
    ///
    /// Propagates the same errors as [`Engine::start_session_async`].
    pub async fn fork_session_async(
        &self,
        source_id: &str,
        opts: StartSessionOptions,
    ) -> Result<(Session, Run)> {
        let (opts, summary_unavailable) = self.apply_fork_summary(source_id, opts).await?;
        let (session, run) = self.start_session_async(opts).await?;
        self.record_fork_event(&run.id, source_id, summary_unavailable).await?;
        Ok((session, run))
    }

    /// Prefix `opts.prompt` with a bounded AI-generated summary of the
    /// source session's latest run, if one can be generated. Returns the
    /// (possibly unmodified) options plus whether summary generation was
    /// attempted and failed, so the caller can surface a warning event.
    async fn apply_fork_summary(
        &self,
        source_id: &str,
        mut opts: StartSessionOptions,
    ) -> Result<(StartSessionOptions, bool)> {
        let source = self.store.sessions.require(source_id).await?;
        let mut summary_unavailable = false;

        if let Some(latest) = self.store.runs.get_latest_run(source_id).await? {
            let events = self.store.run_events.list(&latest.id, 0).await?;
            let transcript: String = events
                .iter()
                .filter(|e| e.kind == RunEventKind::AiOutput)
                .filter_map(|e| e.data.clone())
                .collect::<Vec<_>>()
                .join("\n");

            if !transcript.trim().is_empty() {
                if let Ok(adapter) = self.resolve_tool(&source.tool) {
                    let cancel = CancellationToken::new();
                    match pipeline::generate_fork_summary(&cancel, adapter.as_ref(), &transcript).await {
                        Some(summary) => {
                            opts.prompt = format!("{summary}\n\n{}", opts.prompt);
                        }
                        None => {
                            info!(source_id, "fork summary unavailable, using plain prompt");
                            summary_unavailable = true;
                        }
                    }
                }
            }
        }

        Ok((opts, summary_unavailable))
    }

    async fn record_fork_event(
        &self,
        run_id: &str,
        source_id: &str,
        summary_unavailable: bool,
    ) -> Result<()> {
        self.store
            .run_events
            .append(
                run_id,
                RunEventKind::Fork,
                Some(&format!("forked from session {source_id}")),
                None,
            )
            .await?;
        if summary_unavailable {
            self.store
                .run_events
                .append(
                    run_id,
                    RunEventKind::Warning,
                    Some("fork summary unavailable, continuing with plain prompt"),
                    None,
                )
                .await?;
        }
        Ok(())
    }

    /// `cancelLatest(sessionID)`: cancel the active run for a session if it
    /// is still the session's latest run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no run is active, or
    /// `AppError::Conflict` if the active run is not the latest.
    pub async fn cancel_latest(&self, session_id: &str) -> Result<()> {
        let latest = self
            .store
            .runs
            .get_latest_run(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} has no runs")))?;

        self.active_runs.cancel_latest(session_id, &latest.id)?;
        self.store
            .run_events
            .append(&latest.id, RunEventKind::CancelRequested, None, None)
            .await?;
        Ok(())
    }
}
