use chrono::Utc;
use fog::store::{is_valid_transition, Repo, Run, RunEventKind, RunState, Session, Store};
use uuid::Uuid;

fn sample_repo(name: &str) -> Repo {
    Repo {
        name: name.to_string(),
        url: format!("https://github.com/{name}.git"),
        host: "github.com".to_string(),
        owner: name.split('/').next().unwrap_or(name).to_string(),
        repo: name.split('/').nth(1).unwrap_or(name).to_string(),
        bare_path: format!("/tmp/{name}/repo.git"),
        base_worktree_path: format!("/tmp/{name}/base"),
        default_branch: "main".to_string(),
    }
}

fn sample_session(repo_name: &str) -> Session {
    let now = Utc::now();
    Session {
        id: Uuid::new_v4().to_string(),
        repo_name: repo_name.to_string(),
        branch: "fog/task".to_string(),
        worktree_path: "/tmp/worktrees/fog-task".to_string(),
        tool: "claude".to_string(),
        model: None,
        autopr: false,
        pr_url: None,
        status: RunState::Created,
        busy: false,
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
        worktree_path: "/tmp/worktrees/fog-task".to_string(),
        state: RunState::Created,
        commit_sha: None,
        commit_msg: None,
        error: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

#[test]
fn run_state_transition_matrix() {
    assert!(is_valid_transition(RunState::Created, RunState::Setup));
    assert!(is_valid_transition(RunState::Created, RunState::AiRunning));
    assert!(is_valid_transition(RunState::Setup, RunState::AiRunning));
    assert!(is_valid_transition(RunState::AiRunning, RunState::Validating));
    assert!(is_valid_transition(RunState::AiRunning, RunState::Committed));
    assert!(is_valid_transition(RunState::Validating, RunState::Committed));
    assert!(is_valid_transition(RunState::Committed, RunState::PrCreated));
    assert!(is_valid_transition(RunState::Committed, RunState::Completed));
    assert!(is_valid_transition(RunState::PrCreated, RunState::Completed));

    assert!(!is_valid_transition(RunState::Created, RunState::Committed));
    assert!(!is_valid_transition(RunState::Completed, RunState::Failed));
    assert!(!is_valid_transition(RunState::Cancelled, RunState::Setup));
}

#[test]
fn any_nonterminal_state_can_fail_or_cancel() {
    for state in [
        RunState::Created,
        RunState::Setup,
        RunState::AiRunning,
        RunState::Validating,
        RunState::Committed,
        RunState::PrCreated,
    ] {
        assert!(is_valid_transition(state, RunState::Failed));
        assert!(is_valid_transition(state, RunState::Cancelled));
    }
}

#[tokio::test]
async fn repo_get_by_name_returns_none_for_unknown() {
    let store = Store::open_memory().await.unwrap();
    assert!(store.repos.get_by_name("nobody/nothing").await.unwrap().is_none());
    assert!(store.repos.require_by_name("nobody/nothing").await.is_err());
}

#[tokio::test]
async fn session_set_pr_url_worktree_path_and_conversation_id() {
    let store = Store::open_memory().await.unwrap();
    store.repos.upsert(&sample_repo("acme/widgets")).await.unwrap();
    let session = sample_session("acme/widgets");
    store.sessions.create(&session).await.unwrap();

    store.sessions.set_pr_url(&session.id, "https://github.com/acme/widgets/pull/1").await.unwrap();
    store.sessions.set_worktree_path(&session.id, "/tmp/worktrees/other").await.unwrap();
    store.sessions.set_conversation_id(&session.id, "conv-123").await.unwrap();

    let fetched = store.sessions.require(&session.id).await.unwrap();
    assert_eq!(fetched.pr_url.as_deref(), Some("https://github.com/acme/widgets/pull/1"));
    assert_eq!(fetched.worktree_path, "/tmp/worktrees/other");
    assert_eq!(fetched.conversation_id.as_deref(), Some("conv-123"));
}

#[tokio::test]
async fn session_mutations_on_missing_session_are_not_found() {
    let store = Store::open_memory().await.unwrap();
    assert!(store.sessions.set_pr_url("ghost", "https://x").await.is_err());
    assert!(store.sessions.set_worktree_path("ghost", "/tmp").await.is_err());
    assert!(store.sessions.set_conversation_id("ghost", "c").await.is_err());
    assert!(store.sessions.set_busy("ghost", true).await.is_err());
}

#[tokio::test]
async fn session_list_orders_by_most_recently_updated() {
    let store = Store::open_memory().await.unwrap();
    store.repos.upsert(&sample_repo("acme/widgets")).await.unwrap();
    let first = sample_session("acme/widgets");
    store.sessions.create(&first).await.unwrap();
    let second = sample_session("acme/widgets");
    store.sessions.create(&second).await.unwrap();

    store.sessions.update_status(&first.id, RunState::Setup).await.unwrap();

    let listed = store.sessions.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, first.id);
}

#[tokio::test]
async fn run_complete_requires_terminal_state() {
    let store = Store::open_memory().await.unwrap();
    store.repos.upsert(&sample_repo("acme/widgets")).await.unwrap();
    let session = sample_session("acme/widgets");
    store.sessions.create(&session).await.unwrap();
    let run = sample_run(&session.id);
    store.runs.create(&run).await.unwrap();

    let err = store.runs.complete(&run.id, RunState::Setup, None, None, None).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn run_complete_sets_commit_sha_and_completed_at_once() {
    let store = Store::open_memory().await.unwrap();
    store.repos.upsert(&sample_repo("acme/widgets")).await.unwrap();
    let session = sample_session("acme/widgets");
    store.sessions.create(&session).await.unwrap();
    let run = sample_run(&session.id);
    store.runs.create(&run).await.unwrap();

    store.runs.set_state(&run.id, RunState::AiRunning).await.unwrap();
    store.runs.set_state(&run.id, RunState::Committed).await.unwrap();
    store
        .runs
        .complete(&run.id, RunState::Completed, Some("deadbeef"), Some("feat: widget"), None)
        .await
        .unwrap();

    let fetched = store.runs.require(&run.id).await.unwrap();
    assert_eq!(fetched.state, RunState::Completed);
    assert_eq!(fetched.commit_sha.as_deref(), Some("deadbeef"));
    assert_eq!(fetched.commit_msg.as_deref(), Some("feat: widget"));
    assert!(fetched.completed_at.is_some());
}

#[tokio::test]
async fn run_complete_on_missing_run_is_not_found() {
    let store = Store::open_memory().await.unwrap();
    let err = store.runs.complete("ghost", RunState::Failed, None, None, Some("boom")).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn run_list_by_session_and_get_latest() {
    let store = Store::open_memory().await.unwrap();
    store.repos.upsert(&sample_repo("acme/widgets")).await.unwrap();
    let session = sample_session("acme/widgets");
    store.sessions.create(&session).await.unwrap();

    let first = sample_run(&session.id);
    store.runs.create(&first).await.unwrap();
    let second = sample_run(&session.id);
    store.runs.create(&second).await.unwrap();

    let all = store.runs.list_by_session(&session.id).await.unwrap();
    assert_eq!(all.len(), 2);

    let latest = store.runs.get_latest_run(&session.id).await.unwrap().unwrap();
    assert_eq!(latest.id, second.id);
}

#[tokio::test]
async fn run_event_limit_clamps_to_bounds() {
    let store = Store::open_memory().await.unwrap();
    store.repos.upsert(&sample_repo("acme/widgets")).await.unwrap();
    let session = sample_session("acme/widgets");
    store.sessions.create(&session).await.unwrap();
    let run = sample_run(&session.id);
    store.runs.create(&run).await.unwrap();

    for _ in 0..5 {
        store.run_events.append(&run.id, RunEventKind::AiStream, None, None).await.unwrap();
    }

    let default_limited = store.run_events.list(&run.id, 0).await.unwrap();
    assert_eq!(default_limited.len(), 5);

    let capped = store.run_events.list(&run.id, 2).await.unwrap();
    assert_eq!(capped.len(), 2);
}

#[tokio::test]
async fn run_event_list_after_resumes_from_last_seen_id() {
    let store = Store::open_memory().await.unwrap();
    store.repos.upsert(&sample_repo("acme/widgets")).await.unwrap();
    let session = sample_session("acme/widgets");
    store.sessions.create(&session).await.unwrap();
    let run = sample_run(&session.id);
    store.runs.create(&run).await.unwrap();

    let first_id = store.run_events.append(&run.id, RunEventKind::Setup, None, None).await.unwrap();
    store.run_events.append(&run.id, RunEventKind::AiStart, None, None).await.unwrap();
    store.run_events.append(&run.id, RunEventKind::Complete, None, None).await.unwrap();

    let after = store.run_events.list_after(&run.id, first_id).await.unwrap();
    assert_eq!(after.len(), 2);
    assert_eq!(after[0].kind, RunEventKind::AiStart);
    assert_eq!(after[1].kind, RunEventKind::Complete);
}

#[tokio::test]
async fn settings_roundtrip_and_upsert_overwrites() {
    let store = Store::open_memory().await.unwrap();
    assert!(store.settings.get("device_id").await.unwrap().is_none());

    store.settings.set("device_id", "abc").await.unwrap();
    store.settings.set("device_id", "xyz").await.unwrap();

    let setting = store.settings.get("device_id").await.unwrap().unwrap();
    assert_eq!(setting.value, "xyz");

    store.settings.set("another", "1").await.unwrap();
    let all = store.settings.list().await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn secrets_are_sealed_and_unsealed_with_the_master_key() {
    let store = Store::open_memory().await.unwrap();
    let master_key = [7u8; 32];

    assert!(!store.secrets.has("device_token").await.unwrap());
    store.secrets.save(&master_key, "device_token", b"super-secret").await.unwrap();
    assert!(store.secrets.has("device_token").await.unwrap());

    let plaintext = store.secrets.get(&master_key, "device_token").await.unwrap().unwrap();
    assert_eq!(plaintext, b"super-secret");

    store.secrets.delete("device_token").await.unwrap();
    assert!(store.secrets.get(&master_key, "device_token").await.unwrap().is_none());
}

#[tokio::test]
async fn secrets_fail_to_open_under_the_wrong_master_key() {
    let store = Store::open_memory().await.unwrap();
    store.secrets.save(&[1u8; 32], "k", b"payload").await.unwrap();
    let result = store.secrets.get(&[2u8; 32], "k").await;
    assert!(result.is_err());
}
