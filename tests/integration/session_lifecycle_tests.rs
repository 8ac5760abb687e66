use std::path::Path;
use std::process::Command;
use std::time::Duration;

use fog::engine::{Engine, StartSessionOptions};
use fog::store::{Repo, RunState, Store};

fn run_git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git must be on PATH to run these tests");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

/// Restores `PATH` when dropped, so a fake-tool prefix never leaks into
/// later tests in this binary.
struct PathGuard {
    original: Option<String>,
}

impl PathGuard {
    fn prepend(fake_bin_dir: &Path) -> Self {
        let original = std::env::var("PATH").ok();
        let joined = match &original {
            Some(existing) => format!("{}:{existing}", fake_bin_dir.display()),
            None => fake_bin_dir.display().to_string(),
        };
        std::env::set_var("PATH", joined);
        Self { original }
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        match &self.original {
            Some(value) => std::env::set_var("PATH", value),
            None => std::env::remove_var("PATH"),
        }
    }
}

/// Writes an executable `claude` shell script to a fresh temp directory and
/// returns the directory (keep it alive for the duration of the test).
fn fake_claude_script(body: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("claude");
    std::fs::write(&script_path, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    dir
}

/// Builds a bare repo with one commit on `main` plus a checked-out base
/// worktree, registers it in `store`, and returns the repo name.
async fn setup_repo(store: &Store) -> (tempfile::TempDir, String) {
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

    let name = "acme/widgets".to_string();
    store
        .repos
        .upsert(&Repo {
            name: name.clone(),
            url: origin.to_string_lossy().into_owned(),
            host: "local".to_string(),
            owner: "acme".to_string(),
            repo: "widgets".to_string(),
            bare_path: bare_path.to_string_lossy().into_owned(),
            base_worktree_path: base_worktree_path.to_string_lossy().into_owned(),
            default_branch: "main".to_string(),
        })
        .await
        .unwrap();

    (root, name)
}

#[tokio::test]
#[serial_test::serial]
async fn session_lifecycle_happy_path_completes_and_commits() {
    let store = Store::open_memory().await.unwrap();
    let (_repo_root, repo_name) = setup_repo(&store).await;
    let engine = Engine::new(store, "claude".to_string(), "fog".to_string());

    let script_dir = fake_claude_script(
        "echo 'touched by the agent' >> agent_output.txt\n\
         echo '{\"text\": \"done\", \"session_id\": \"session-abc\"}'",
    );
    let _guard = PathGuard::prepend(script_dir.path());

    let (session, run) = engine
        .start_session(StartSessionOptions {
            repo_name,
            branch: None,
            tool: "claude".to_string(),
            model: None,
            prompt: "add a greeting".to_string(),
            autopr: false,
            setup_cmd: None,
            validate: false,
            validate_cmd: None,
            commit_msg: None,
        })
        .await
        .unwrap();

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(session.status, RunState::Completed);
    assert!(run.commit_sha.is_some());
    assert!(!session.busy);
    assert_eq!(session.conversation_id.as_deref(), Some("session-abc"));

    let events = engine.store().run_events.list(&run.id, 0).await.unwrap();
    let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&fog::store::RunEventKind::AiStart));
    assert!(kinds.contains(&fog::store::RunEventKind::AiOutput));
    assert!(kinds.contains(&fog::store::RunEventKind::Commit));
    assert!(kinds.contains(&fog::store::RunEventKind::Complete));
}

#[tokio::test]
#[serial_test::serial]
async fn cancel_during_ai_phase_marks_run_cancelled() {
    let store = Store::open_memory().await.unwrap();
    let (_repo_root, repo_name) = setup_repo(&store).await;
    let engine = Engine::new(store, "claude".to_string(), "fog".to_string());

    let script_dir = fake_claude_script(
        "sleep 5\n\
         echo '{\"text\": \"too late\", \"session_id\": \"slow\"}'",
    );
    let _guard = PathGuard::prepend(script_dir.path());

    let (session, run) = engine
        .start_session_async(StartSessionOptions {
            repo_name,
            branch: None,
            tool: "claude".to_string(),
            model: None,
            prompt: "do something slow".to_string(),
            autopr: false,
            setup_cmd: None,
            validate: false,
            validate_cmd: None,
            commit_msg: None,
        })
        .await
        .unwrap();
    assert_eq!(run.state, RunState::Created);

    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.cancel_latest(&session.id).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let fetched = engine.store().runs.require(&run.id).await.unwrap();
        if fetched.state.is_terminal() {
            assert_eq!(fetched.state, RunState::Cancelled);
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("run did not reach a terminal state after cancellation");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let fetched_session = engine.store().sessions.require(&session.id).await.unwrap();
    assert!(!fetched_session.busy);
}

#[tokio::test]
#[serial_test::serial]
async fn continue_session_rejects_a_still_busy_session() {
    let store = Store::open_memory().await.unwrap();
    let (_repo_root, repo_name) = setup_repo(&store).await;

    let now = chrono::Utc::now();
    let session = fog::store::Session {
        id: uuid::Uuid::new_v4().to_string(),
        repo_name,
        branch: "fog/in-flight".to_string(),
        worktree_path: "/tmp/does-not-matter".to_string(),
        tool: "claude".to_string(),
        model: None,
        autopr: false,
        pr_url: None,
        status: RunState::AiRunning,
        busy: true,
        conversation_id: None,
        created_at: now,
        updated_at: now,
    };
    store.sessions.create(&session).await.unwrap();

    let engine = Engine::new(store, "claude".to_string(), "fog".to_string());
    let result = engine.continue_session(&session.id, "follow up").await;
    assert!(matches!(result, Err(fog::AppError::Conflict(_))));
}
