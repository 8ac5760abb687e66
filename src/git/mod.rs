//! Git worktree manager (C3): creates per-run worktrees from a bare clone,
//! detaches HEAD on release, lists branches, and validates repos.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::process::{self, RunOutput};
use crate::{AppError, Result};

/// Bounded worker pool size for importing many repos concurrently.
pub const IMPORT_CONCURRENCY: usize = 5;

/// A managed repository's on-disk layout.
#[derive(Debug, Clone)]
pub struct RepoPaths {
    /// Bare clone, e.g. `<fog_home>/repos/<owner>/<repo>/repo.git`.
    pub bare_path: PathBuf,
    /// Non-bare worktree tracking the default branch.
    pub base_worktree_path: PathBuf,
}

impl RepoPaths {
    /// Derive the standard bare/base layout for `owner/repo` under `root`.
    #[must_use]
    pub fn for_repo(root: &Path, owner: &str, repo: &str) -> Self {
        let dir = root.join(owner).join(repo);
        Self {
            bare_path: dir.join("repo.git"),
            base_worktree_path: dir.join("base"),
        }
    }

    /// Sibling `worktrees/` directory for per-run worktrees.
    #[must_use]
    pub fn worktrees_root(&self) -> PathBuf {
        self.bare_path
            .parent()
            .map(|p| p.join("worktrees"))
            .unwrap_or_else(|| PathBuf::from("worktrees"))
    }
}

fn combined_text(output: &RunOutput) -> String {
    String::from_utf8_lossy(&output.combined).trim().to_string()
}

async fn git(cancel: &CancellationToken, dir: &Path, args: &[&str]) -> Result<RunOutput> {
    process::run(cancel, dir, "git", args).await
}

fn subprocess_err(cmd: &str, output: &RunOutput) -> AppError {
    AppError::Subprocess(format!(
        "{cmd} failed: {}",
        process::tail_for_error(&output.combined, 4096)
    ))
}

/// Returns `true` if `path` is a valid git-dir (`git rev-parse --git-dir`
/// succeeds when run with `--git-dir=<path>`).
pub async fn is_valid_git_dir(cancel: &CancellationToken, path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    let git_dir_flag = format!("--git-dir={}", path.display());
    process::run(
        cancel,
        Path::new("."),
        "git",
        &[git_dir_flag.as_str(), "rev-parse", "--git-dir"],
    )
    .await
    .map(|out| out.success)
    .unwrap_or(false)
}

/// `ensureRepo(bare, base)`: clone the bare mirror and base worktree if
/// missing, repairing both atomically if either is invalid.
///
/// # Errors
///
/// Returns `AppError::Subprocess` if `git`/`gh` invocations fail in a way
/// that isn't recoverable by the fallback paths described below.
pub async fn ensure_repo(
    cancel: &CancellationToken,
    paths: &RepoPaths,
    clone_url: &str,
) -> Result<()> {
    let bare_valid = is_valid_git_dir(cancel, &paths.bare_path).await;

    if !bare_valid {
        if paths.bare_path.exists() {
            tokio::fs::remove_dir_all(&paths.bare_path).await.ok();
        }
        if paths.base_worktree_path.exists() {
            tokio::fs::remove_dir_all(&paths.base_worktree_path).await.ok();
        }
        if let Some(parent) = paths.bare_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bare_str = paths.bare_path.to_string_lossy().into_owned();
        let out = process::run(
            cancel,
            Path::new("."),
            "gh",
            &[
                "repo",
                "clone",
                clone_url,
                &bare_str,
                "--",
                "--bare",
                "--filter=blob:none",
            ],
        )
        .await?;

        if !out.success {
            warn!(clone_url, "gh clone --filter=blob:none failed, retrying without --filter");
            let retry = process::run(
                cancel,
                Path::new("."),
                "gh",
                &["repo", "clone", clone_url, &bare_str, "--", "--bare"],
            )
            .await?;
            if !retry.success {
                return Err(subprocess_err("gh repo clone --bare", &retry));
            }
        }
    }

    if !paths.base_worktree_path.exists() {
        let git_dir_flag = format!("--git-dir={}", paths.bare_path.display());
        let base_str = paths.base_worktree_path.to_string_lossy().into_owned();
        let out = git(
            cancel,
            Path::new("."),
            &[git_dir_flag.as_str(), "worktree", "add", &base_str],
        )
        .await?;
        if !out.success {
            return Err(subprocess_err("git worktree add (base)", &out));
        }
    }

    Ok(())
}

/// A repo surfaced by [`discover_repos`], not yet imported.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct DiscoveredRepo {
    /// `"owner/repo"`.
    #[serde(rename = "nameWithOwner")]
    pub name_with_owner: String,
    /// HTTPS clone URL.
    pub url: String,
}

/// List the caller's accessible repos via the `gh` helper, for the
/// repo-import picker.
///
/// # Errors
///
/// Returns `AppError::Subprocess` if `gh repo list` fails or its output is
/// not the expected JSON shape.
pub async fn discover_repos(cancel: &CancellationToken) -> Result<Vec<DiscoveredRepo>> {
    let out = process::run(
        cancel,
        Path::new("."),
        "gh",
        &["repo", "list", "--limit", "200", "--json", "nameWithOwner,url"],
    )
    .await?;
    if !out.success {
        return Err(subprocess_err("gh repo list", &out));
    }
    serde_json::from_slice(&out.combined)
        .map_err(|err| AppError::Subprocess(format!("gh repo list: invalid json: {err}")))
}

/// Import several repos concurrently, bounded by [`IMPORT_CONCURRENCY`].
///
/// # Errors
///
/// Returns the first error encountered; other in-flight imports are allowed
/// to finish but their results are discarded.
pub async fn import_many(
    cancel: &CancellationToken,
    jobs: Vec<(RepoPaths, String)>,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(IMPORT_CONCURRENCY));
    let mut handles = Vec::with_capacity(jobs.len());

    for (paths, clone_url) in jobs {
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await;
            ensure_repo(&cancel, &paths, &clone_url).await
        }));
    }

    let mut first_err = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) if first_err.is_none() => first_err = Some(err),
            Err(join_err) if first_err.is_none() => {
                first_err = Some(AppError::Subprocess(format!("import task panicked: {join_err}")));
            }
            _ => {}
        }
    }

    first_err.map_or(Ok(()), Err)
}

/// Resolve the repo's default branch: `symbolic-ref HEAD`, then
/// `refs/remotes/origin/HEAD`, then `main`/`master`, finally the first
/// available local branch.
///
/// # Errors
///
/// Returns `AppError::Subprocess` if no branch can be resolved at all.
pub async fn default_branch(cancel: &CancellationToken, repo_path: &Path) -> Result<String> {
    if let Ok(out) = git(cancel, repo_path, &["symbolic-ref", "--short", "HEAD"]).await {
        if out.success {
            let name = combined_text(&out);
            if !name.is_empty() {
                return Ok(name);
            }
        }
    }

    if let Ok(out) = git(
        cancel,
        repo_path,
        &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
    )
    .await
    {
        if out.success {
            let name = combined_text(&out);
            if let Some(stripped) = name.strip_prefix("origin/") {
                return Ok(stripped.to_string());
            }
        }
    }

    for candidate in ["main", "master"] {
        let out = git(
            cancel,
            repo_path,
            &["show-ref", "--verify", "--quiet", &format!("refs/heads/{candidate}")],
        )
        .await?;
        if out.success {
            return Ok(candidate.to_string());
        }
    }

    let branches = list_branches(cancel, repo_path).await?;
    branches
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Subprocess("no branch available to resolve default".into()))
}

/// List local branch names in `repo_path`.
///
/// # Errors
///
/// Returns `AppError::Subprocess` if `git branch` fails.
pub async fn list_branches(cancel: &CancellationToken, repo_path: &Path) -> Result<Vec<String>> {
    let out = git(
        cancel,
        repo_path,
        &["for-each-ref", "--format=%(refname:short)", "refs/heads/"],
    )
    .await?;
    if !out.success {
        return Err(subprocess_err("git for-each-ref", &out));
    }
    Ok(combined_text(&out)
        .lines()
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .collect())
}

/// Deterministic per-run worktree path: `<branch>-<runID[:8]>` under the
/// repo's sibling `worktrees/` directory.
#[must_use]
pub fn worktree_path_for_run(paths: &RepoPaths, branch: &str, run_id: &str) -> PathBuf {
    let suffix: String = run_id.chars().take(8).collect();
    let sanitized = sanitize_path_component(branch);
    paths.worktrees_root().join(format!("{sanitized}-{suffix}"))
}

fn sanitize_path_component(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// `createWorktreePath(repoPath, name, branch)`: create `branch` from the
/// repo's resolved default branch if it doesn't already exist, then
/// `git worktree add` at the deterministic path.
///
/// # Errors
///
/// Returns `AppError::Subprocess` if `git worktree add` fails.
pub async fn create_worktree(
    cancel: &CancellationToken,
    paths: &RepoPaths,
    branch: &str,
    run_id: &str,
) -> Result<PathBuf> {
    let git_dir_flag = format!("--git-dir={}", paths.bare_path.display());
    let worktree_path = worktree_path_for_run(paths, branch, run_id);
    let worktree_str = worktree_path.to_string_lossy().into_owned();

    let existing_branches = list_branches(cancel, &paths.base_worktree_path).await?;
    let branch_exists = existing_branches.iter().any(|b| b == branch);

    let out = if branch_exists {
        git(
            cancel,
            Path::new("."),
            &[git_dir_flag.as_str(), "worktree", "add", &worktree_str, branch],
        )
        .await?
    } else {
        let start_point = default_branch(cancel, &paths.base_worktree_path).await?;
        git(
            cancel,
            Path::new("."),
            &[
                git_dir_flag.as_str(),
                "worktree",
                "add",
                "-b",
                branch,
                &worktree_str,
                &start_point,
            ],
        )
        .await?
    };

    if !out.success {
        return Err(subprocess_err("git worktree add", &out));
    }

    info!(branch, path = %worktree_path.display(), "created worktree");
    Ok(worktree_path)
}

/// `detachWorktree(path)`: detach HEAD so the branch is free for a
/// subsequent run. Idempotent; silent if the path no longer exists.
pub async fn detach_worktree(cancel: &CancellationToken, path: &Path) {
    if !path.exists() {
        return;
    }
    match git(cancel, path, &["checkout", "--detach"]).await {
        Ok(out) if !out.success => {
            warn!(path = %path.display(), "git checkout --detach failed");
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "git checkout --detach errored");
        }
        _ => {}
    }
}

/// Textual diff of `HEAD` in `worktree_path` against `base_branch`, using
/// the three-dot (`merge-base`) form so the output reflects only the
/// session branch's own changes.
///
/// # Errors
///
/// Returns `AppError::Subprocess` if `git diff` fails.
pub async fn diff_against_base(
    cancel: &CancellationToken,
    worktree_path: &Path,
    base_branch: &str,
) -> Result<String> {
    let range = format!("{base_branch}...HEAD");
    let out = git(cancel, worktree_path, &["diff", &range]).await?;
    if !out.success {
        return Err(subprocess_err("git diff", &out));
    }
    Ok(combined_text(&out))
}

/// `hasUncommittedChanges(path)`: `true` if `git status --porcelain` is
/// non-empty.
///
/// # Errors
///
/// Returns `AppError::Subprocess` if the status check fails to run.
pub async fn has_uncommitted_changes(cancel: &CancellationToken, path: &Path) -> Result<bool> {
    let out = git(cancel, path, &["status", "--porcelain"]).await?;
    if !out.success {
        return Err(subprocess_err("git status --porcelain", &out));
    }
    Ok(!combined_text(&out).is_empty())
}
