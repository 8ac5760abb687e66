//! Run stream writer and the linear run-execution / commit pipelines.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::{RunEventKind, RunState, Store};
use crate::tool::{Chunk, ExecuteRequest, ToolAdapter};
use crate::{process, AppError, Result};

const STREAM_FLUSH_THRESHOLD: usize = 1024;
const STREAM_FLUSH_INTERVAL: Duration = Duration::from_millis(600);
const AI_OUTPUT_TRUNCATE: usize = 8 * 1024;
const COMMIT_DIFF_TRUNCATE: usize = 12 * 1024;
const COMMIT_MSG_PROMPT_CHARS: usize = 120;
const FORK_SUMMARY_TIMEOUT: Duration = Duration::from_secs(60);

fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Buffered sink fronting [`crate::store::RunEventRepo::append`]. Accumulates
/// chunks from a tool adapter and flushes an `ai_stream` event when either
/// the buffer reaches [`STREAM_FLUSH_THRESHOLD`] or
/// [`STREAM_FLUSH_INTERVAL`] has elapsed, whichever comes first.
pub struct RunStreamWriter {
    tx: mpsc::UnboundedSender<String>,
    handle: tokio::task::JoinHandle<()>,
}

async fn flush_buffer(store: &Store, run_id: &str, buffer: &mut String) {
    if buffer.is_empty() {
        return;
    }
    let data = truncate_str(buffer, AI_OUTPUT_TRUNCATE);
    if let Err(err) = store
        .run_events
        .append(run_id, RunEventKind::AiStream, None, Some(&data))
        .await
    {
        warn!(run_id, %err, "failed to flush ai_stream event");
    }
    buffer.clear();
}

impl RunStreamWriter {
    /// Spawn the writer's background flush task.
    #[must_use]
    pub fn spawn(store: Store, run_id: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let handle = tokio::spawn(async move {
            let mut buffer = String::new();
            let mut ticker = interval(STREAM_FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = ticker.tick() => {
                        flush_buffer(&store, &run_id, &mut buffer).await;
                    }
                    received = rx.recv() => {
                        match received {
                            Some(text) => {
                                buffer.push_str(&text);
                                if buffer.len() >= STREAM_FLUSH_THRESHOLD {
                                    flush_buffer(&store, &run_id, &mut buffer).await;
                                    ticker.reset();
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            flush_buffer(&store, &run_id, &mut buffer).await;
        });
        Self { tx, handle }
    }

    /// Enqueue a chunk of text for later flushing. Infallible from the
    /// caller's perspective: a closed channel silently drops the chunk,
    /// which only happens after `finish` has already been called.
    pub fn push(&self, text: &str) {
        let _ = self.tx.send(text.to_string());
    }

    /// Close the channel and wait for the final unconditional flush.
    pub async fn finish(self) {
        drop(self.tx);
        let _ = self.handle.await;
    }
}

/// Options for one run's execution, independent of how the run was started.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Shell command run before the AI tool, only meaningful on a session's
    /// first run.
    pub setup_cmd: Option<String>,
    /// Whether to run `validate_cmd` after the AI tool returns.
    pub validate: bool,
    /// Shell command that must exit zero for the run to proceed to commit.
    pub validate_cmd: Option<String>,
    /// User-supplied commit message; if absent, one is generated.
    pub commit_msg: Option<String>,
    /// Push and open a draft PR on completion if no PR exists yet.
    pub autopr: bool,
}

/// Everything the pipeline needs for one run, already resolved.
pub struct RunContext<'a> {
    pub store: &'a Store,
    pub cancel: &'a CancellationToken,
    pub session_id: String,
    pub run_id: String,
    pub worktree_path: String,
    pub prompt: String,
    pub tool: &'a dyn ToolAdapter,
    pub model: Option<String>,
    pub conversation_id: Option<String>,
    pub options: RunOptions,
}

/// Outcome of a completed commit pipeline attempt.
pub struct CommitOutcome {
    pub changed: bool,
    pub commit_sha: Option<String>,
    pub commit_msg: Option<String>,
}

async fn git(cancel: &CancellationToken, dir: &Path, args: &[&str]) -> Result<process::RunOutput> {
    process::run(cancel, dir, "git", args).await
}

fn text(output: &process::RunOutput) -> String {
    String::from_utf8_lossy(&output.combined).trim().to_string()
}

/// Run the full linear pipeline for one run: optional setup, AI invocation,
/// optional validation, commit, optional push/PR, terminal completion.
///
/// # Errors
///
/// Returns an error only if persistence itself fails in a way the `fail`
/// handler cannot recover from; all tool/process failures are translated
/// into a `Failed` or `Cancelled` terminal run state and `Ok(())`.
pub async fn execute_run(ctx: RunContext<'_>) -> Result<()> {
    let RunContext {
        store,
        cancel,
        session_id,
        run_id,
        worktree_path,
        prompt,
        tool,
        model,
        conversation_id,
        options,
    } = ctx;
    let dir = Path::new(&worktree_path);

    if let Some(setup_cmd) = options.setup_cmd.as_deref() {
        store.runs.set_state(&run_id, RunState::Setup).await?;
        store
            .run_events
            .append(&run_id, RunEventKind::Setup, Some(setup_cmd), None)
            .await?;
        let out = process::run_shell(cancel, dir, setup_cmd).await;
        match out {
            Ok(out) if out.success => {}
            Ok(out) => {
                return fail(
                    store,
                    &session_id,
                    &run_id,
                    AppError::Subprocess(format!("setup command failed: {}", text(&out))),
                )
                .await;
            }
            Err(err) => return fail(store, &session_id, &run_id, err).await,
        }
    }

    store.runs.set_state(&run_id, RunState::AiRunning).await?;
    store
        .run_events
        .append(&run_id, RunEventKind::AiStart, None, None)
        .await?;

    let writer = RunStreamWriter::spawn(store.clone(), run_id.clone());
    let req = ExecuteRequest {
        workdir: dir.to_path_buf(),
        prompt: prompt.clone(),
        model,
        conversation_id,
    };

    let streamed_output = Arc::new(Mutex::new(String::new()));
    let streamed_output_for_chunk = Arc::clone(&streamed_output);
    let mut on_chunk = |chunk: Chunk| {
        writer.push(&chunk.text);
        streamed_output_for_chunk
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_str(&chunk.text);
    };
    let ai_result = tool.execute_stream(cancel, &req, &mut on_chunk).await;
    writer.finish().await;

    let ai_result = match ai_result {
        Ok(result) => result,
        Err(err) => {
            let partial = streamed_output
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            if !partial.trim().is_empty() {
                store
                    .run_events
                    .append(
                        &run_id,
                        RunEventKind::AiOutput,
                        None,
                        Some(&truncate_str(&partial, AI_OUTPUT_TRUNCATE)),
                    )
                    .await?;
            }
            return fail(store, &session_id, &run_id, err).await;
        }
    };

    if let Some(conversation_id) = &ai_result.conversation_id {
        store
            .run_events
            .append(&run_id, RunEventKind::AiSession, None, Some(conversation_id))
            .await?;
        if let Err(err) = store.sessions.set_conversation_id(&session_id, conversation_id).await {
            warn!(session_id, %err, "failed to persist conversation id");
        }
    }
    store
        .run_events
        .append(
            &run_id,
            RunEventKind::AiOutput,
            None,
            Some(&truncate_str(&ai_result.output, AI_OUTPUT_TRUNCATE)),
        )
        .await?;

    if !ai_result.success {
        let message = ai_result.error.unwrap_or_else(|| "tool invocation failed".to_string());
        return fail(store, &session_id, &run_id, AppError::Subprocess(message)).await;
    }

    if options.validate {
        if let Some(validate_cmd) = options.validate_cmd.as_deref() {
            store.runs.set_state(&run_id, RunState::Validating).await?;
            match process::run_shell(cancel, dir, validate_cmd).await {
                Ok(out) if out.success => {}
                Ok(out) => {
                    return fail(
                        store,
                        &session_id,
                        &run_id,
                        AppError::Validation(format!("validation failed: {}", text(&out))),
                    )
                    .await;
                }
                Err(err) => return fail(store, &session_id, &run_id, err).await,
            }
        }
    }

    store.runs.set_state(&run_id, RunState::Committed).await?;
    let commit = match commit_pipeline(cancel, dir, &prompt, options.commit_msg.as_deref(), tool).await
    {
        Ok(outcome) => outcome,
        Err(err) => return fail(store, &session_id, &run_id, err).await,
    };

    if commit.changed {
        store
            .run_events
            .append(
                &run_id,
                RunEventKind::Commit,
                commit.commit_msg.as_deref(),
                commit.commit_sha.as_deref(),
            )
            .await?;
    } else {
        store
            .run_events
            .append(&run_id, RunEventKind::Commit, Some("No changes to commit"), None)
            .await?;
    }

    let session = store.sessions.require(&session_id).await?;
    if commit.changed && (options.autopr || session.pr_url.is_some()) {
        if let Err(err) = push_and_maybe_pr(cancel, dir, store, &session_id, &run_id, options.autopr, session.pr_url.is_some()).await {
            return fail(store, &session_id, &run_id, err).await;
        }
    }

    store
        .runs
        .complete(
            &run_id,
            RunState::Completed,
            commit.commit_sha.as_deref(),
            commit.commit_msg.as_deref(),
            None,
        )
        .await?;
    store
        .run_events
        .append(&run_id, RunEventKind::Complete, None, None)
        .await?;
    update_session_status_if_latest(store, &session_id, &run_id, RunState::Completed).await?;

    detach_and_release(cancel, store, &session_id, dir).await;
    Ok(())
}

async fn push_and_maybe_pr(
    cancel: &CancellationToken,
    dir: &Path,
    store: &Store,
    session_id: &str,
    run_id: &str,
    autopr: bool,
    has_pr: bool,
) -> Result<()> {
    let session = store.sessions.require(session_id).await?;
    let push_args: &[&str] = if has_pr {
        &["push"]
    } else {
        &["push", "-u", "origin", session.branch.as_str()]
    };
    let out = git(cancel, dir, push_args).await?;
    if !out.success {
        return Err(AppError::Subprocess(format!("git push failed: {}", text(&out))));
    }

    if autopr && !has_pr {
        let out = process::run(cancel, dir, "gh", &["pr", "create", "--draft", "--fill"]).await?;
        if !out.success {
            return Err(AppError::Subprocess(format!(
                "gh pr create failed: {}",
                text(&out)
            )));
        }
        let pr_url = text(&out);
        store.sessions.set_pr_url(session_id, &pr_url).await?;
    }

    store
        .run_events
        .append(run_id, RunEventKind::Pr, None, None)
        .await?;
    Ok(())
}

/// `fail(phase, err)`: translate a pipeline error into a terminal run state
/// and record the corresponding event, updating the session's mirrored
/// status if this run is still the latest.
async fn fail(store: &Store, session_id: &str, run_id: &str, err: AppError) -> Result<()> {
    let canceled = matches!(err, AppError::Canceled);
    let state = if canceled { RunState::Cancelled } else { RunState::Failed };
    let kind = if canceled { RunEventKind::Cancelled } else { RunEventKind::Error };
    let message = err.to_string();

    store
        .runs
        .complete(
            run_id,
            state,
            None,
            None,
            (!canceled).then_some(message.as_str()),
        )
        .await?;
    store
        .run_events
        .append(run_id, kind, Some(&message), None)
        .await?;
    update_session_status_if_latest(store, session_id, run_id, state).await?;

    let worktree_path = store.runs.require(run_id).await?.worktree_path;
    let cancel = CancellationToken::new();
    detach_and_release(&cancel, store, session_id, Path::new(&worktree_path)).await;
    Ok(())
}

async fn update_session_status_if_latest(
    store: &Store,
    session_id: &str,
    run_id: &str,
    status: RunState,
) -> Result<()> {
    if let Some(latest) = store.runs.get_latest_run(session_id).await? {
        if latest.id == run_id {
            store.sessions.update_status(session_id, status).await?;
        }
    }
    Ok(())
}

async fn detach_and_release(cancel: &CancellationToken, store: &Store, session_id: &str, dir: &Path) {
    crate::git::detach_worktree(cancel, dir).await;
    if let Err(err) = store.sessions.set_busy(session_id, false).await {
        warn!(session_id, %err, "failed to clear session busy flag");
    }
}

/// Commit pipeline: stage all changes, commit with a user-supplied or
/// AI-generated Conventional Commits message, and return the resulting SHA.
///
/// # Errors
///
/// Returns an error if a required git command fails to run at all (not if
/// it merely reports no changes).
pub async fn commit_pipeline(
    cancel: &CancellationToken,
    dir: &Path,
    prompt: &str,
    user_commit_msg: Option<&str>,
    tool: &dyn ToolAdapter,
) -> Result<CommitOutcome> {
    let status = git(cancel, dir, &["status", "--porcelain"]).await?;
    if !status.success {
        return Err(AppError::Subprocess(format!(
            "git status failed: {}",
            text(&status)
        )));
    }
    if text(&status).is_empty() {
        return Ok(CommitOutcome {
            changed: false,
            commit_sha: None,
            commit_msg: None,
        });
    }

    let add = git(cancel, dir, &["add", "."]).await?;
    if !add.success {
        return Err(AppError::Subprocess(format!("git add failed: {}", text(&add))));
    }

    let message = match user_commit_msg {
        Some(msg) if !msg.trim().is_empty() => msg.trim().to_string(),
        _ => generate_commit_message(cancel, dir, prompt, tool).await,
    };

    let commit = git(cancel, dir, &["commit", "-m", &message]).await?;
    if !commit.success {
        return Err(AppError::Subprocess(format!(
            "git commit failed: {}",
            text(&commit)
        )));
    }

    let rev_parse = git(cancel, dir, &["rev-parse", "HEAD"]).await?;
    if !rev_parse.success {
        return Err(AppError::Subprocess(format!(
            "git rev-parse HEAD failed: {}",
            text(&rev_parse)
        )));
    }

    Ok(CommitOutcome {
        changed: true,
        commit_sha: Some(text(&rev_parse)),
        commit_msg: Some(message),
    })
}

fn fallback_commit_message(prompt: &str) -> String {
    let trimmed = truncate_str(prompt.trim(), COMMIT_MSG_PROMPT_CHARS);
    format!("feat: {trimmed}\n\nGenerated by Fog session")
}

fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```")
        .and_then(|s| s.strip_suffix("```"))
        .map_or(trimmed, |s| s.trim_start_matches(|c: char| c.is_alphabetic()))
        .trim()
        .to_string()
}

async fn generate_commit_message(
    cancel: &CancellationToken,
    dir: &Path,
    prompt: &str,
    tool: &dyn ToolAdapter,
) -> String {
    let name_status = git(cancel, dir, &["diff", "--staged", "--name-status"])
        .await
        .map(|o| text(&o))
        .unwrap_or_default();
    let stat = git(cancel, dir, &["diff", "--staged", "--stat"])
        .await
        .map(|o| text(&o))
        .unwrap_or_default();
    let patch = git(cancel, dir, &["diff", "--staged"])
        .await
        .map(|o| truncate_str(&text(&o), COMMIT_DIFF_TRUNCATE))
        .unwrap_or_default();

    let Ok(scratch) = tempfile::tempdir() else {
        return fallback_commit_message(prompt);
    };

    let commit_prompt = format!(
        "Write a single Conventional Commits message (no body beyond an \
         optional short explanation) for this change. Respond with only the \
         commit message text.\n\nName/status:\n{name_status}\n\nStat:\n{stat}\n\nPatch:\n{patch}"
    );
    let req = ExecuteRequest {
        workdir: scratch.path().to_path_buf(),
        prompt: commit_prompt,
        model: None,
        conversation_id: None,
    };

    let result = tokio::time::timeout(FORK_SUMMARY_TIMEOUT, tool.execute(cancel, &req)).await;
    match result {
        Ok(Ok(result)) if result.success => {
            let cleaned = strip_code_fences(&result.output);
            if cleaned.is_empty() {
                fallback_commit_message(prompt)
            } else {
                cleaned
            }
        }
        _ => fallback_commit_message(prompt),
    }
}

/// Generate a short summary of a source session for use in a forked
/// session's prompt, bounded to [`FORK_SUMMARY_TIMEOUT`]. Returns `None` on
/// any failure or timeout; callers record a `warning` event rather than
/// failing the fork.
pub async fn generate_fork_summary(
    cancel: &CancellationToken,
    tool: &dyn ToolAdapter,
    source_transcript: &str,
) -> Option<String> {
    let Ok(scratch) = tempfile::tempdir() else {
        return None;
    };
    let req = ExecuteRequest {
        workdir: scratch.path().to_path_buf(),
        prompt: format!(
            "Summarize the following prior session transcript in 2-3 sentences \
             so it can be prepended to a follow-up prompt:\n\n{source_transcript}"
        ),
        model: None,
        conversation_id: None,
    };

    match tokio::time::timeout(FORK_SUMMARY_TIMEOUT, tool.execute(cancel, &req)).await {
        Ok(Ok(result)) if result.success && !result.output.trim().is_empty() => {
            Some(result.output.trim().to_string())
        }
        Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
            info!("fork summary generation failed or timed out, proceeding with plain prompt");
            None
        }
    }
}
