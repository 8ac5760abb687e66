use std::path::Path;
use std::process::Command;

use fog::git::{
    create_worktree, default_branch, detach_worktree, diff_against_base, has_uncommitted_changes,
    is_valid_git_dir, list_branches, worktree_path_for_run, RepoPaths,
};
use tokio_util::sync::CancellationToken;

fn run_git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git must be on PATH to run these tests");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

/// Builds a bare repo with one commit on `main` plus a checked-out base
/// worktree tracking it, entirely with local `git` — no `gh`, no network.
fn setup_repo() -> (tempfile::TempDir, RepoPaths) {
    let root = tempfile::tempdir().unwrap();

    let origin = root.path().join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    run_git(&origin, &["init", "--initial-branch=main"]);
    run_git(&origin, &["config", "user.email", "fog@example.com"]);
    run_git(&origin, &["config", "user.name", "fog"]);
    std::fs::write(origin.join("README.md"), "hello\n").unwrap();
    run_git(&origin, &["add", "."]);
    run_git(&origin, &["commit", "-m", "initial commit"]);

    let bare_path = root.path().join("repo.git");
    run_git(
        root.path(),
        &["clone", "--bare", origin.to_str().unwrap(), bare_path.to_str().unwrap()],
    );

    let base_worktree_path = root.path().join("base");
    let git_dir_flag = format!("--git-dir={}", bare_path.display());
    run_git(
        root.path(),
        &[&git_dir_flag, "worktree", "add", base_worktree_path.to_str().unwrap(), "main"],
    );

    let paths = RepoPaths { bare_path, base_worktree_path };
    (root, paths)
}

#[tokio::test]
async fn is_valid_git_dir_recognizes_bare_repos_and_rejects_missing_paths() {
    let cancel = CancellationToken::new();
    let (_root, paths) = setup_repo();

    assert!(is_valid_git_dir(&cancel, &paths.bare_path).await);
    assert!(!is_valid_git_dir(&cancel, Path::new("/no/such/path/at/all")).await);
}

#[tokio::test]
async fn default_branch_resolves_from_checked_out_head() {
    let cancel = CancellationToken::new();
    let (_root, paths) = setup_repo();

    let branch = default_branch(&cancel, &paths.base_worktree_path).await.unwrap();
    assert_eq!(branch, "main");
}

#[tokio::test]
async fn list_branches_returns_local_branches() {
    let cancel = CancellationToken::new();
    let (_root, paths) = setup_repo();

    let branches = list_branches(&cancel, &paths.base_worktree_path).await.unwrap();
    assert_eq!(branches, vec!["main".to_string()]);
}

#[test]
fn worktree_path_for_run_is_deterministic_and_sanitizes_branch_names() {
    let root = tempfile::tempdir().unwrap();
    let paths = RepoPaths::for_repo(root.path(), "acme", "widgets");

    let a = worktree_path_for_run(&paths, "feature/cool thing", "0123456789abcdef");
    let b = worktree_path_for_run(&paths, "feature/cool thing", "0123456789abcdef");
    assert_eq!(a, b);

    let name = a.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("feature-cool-thing-"));
    assert!(name.ends_with("01234567"));
}

#[tokio::test]
async fn create_worktree_detach_and_diff_roundtrip() {
    let cancel = CancellationToken::new();
    let (_root, paths) = setup_repo();

    let worktree_path = create_worktree(&cancel, &paths, "fog/my-change", "deadbeef01234567")
        .await
        .unwrap();
    assert!(worktree_path.is_dir());

    assert!(!has_uncommitted_changes(&cancel, &worktree_path).await.unwrap());

    std::fs::write(worktree_path.join("README.md"), "hello\nmore\n").unwrap();
    assert!(has_uncommitted_changes(&cancel, &worktree_path).await.unwrap());

    run_git(&worktree_path, &["add", "."]);
    run_git(
        &worktree_path,
        &["-c", "user.email=fog@example.com", "-c", "user.name=fog", "commit", "-m", "tweak readme"],
    );
    assert!(!has_uncommitted_changes(&cancel, &worktree_path).await.unwrap());

    let diff = diff_against_base(&cancel, &worktree_path, "main").await.unwrap();
    assert!(diff.contains("more"));

    detach_worktree(&cancel, &worktree_path).await;
    // idempotent on a path that no longer exists
    detach_worktree(&cancel, Path::new("/no/such/worktree")).await;
}

#[tokio::test]
async fn create_worktree_reuses_an_existing_branch() {
    let cancel = CancellationToken::new();
    let (_root, paths) = setup_repo();

    let first = create_worktree(&cancel, &paths, "fog/shared", "11111111").await.unwrap();
    detach_worktree(&cancel, &first).await;
    run_git(&paths.base_worktree_path, &["worktree", "remove", "--force", first.to_str().unwrap()]);

    let second = create_worktree(&cancel, &paths, "fog/shared", "22222222").await.unwrap();
    assert!(second.is_dir());
    assert_ne!(first, second);
}
