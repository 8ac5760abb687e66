//! The local daemon's axum HTTP surface: the REST API a desktop shell or
//! web UI drives the session engine (C5) through.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::GlobalConfig;
use crate::engine::{Engine, StartSessionOptions};
use crate::git::{self, RepoPaths};
use crate::store::{Repo, RunEvent, Session};
use crate::{AppError, Result};

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared state for every local HTTP handler.
#[derive(Clone)]
pub struct HttpState {
    pub engine: Arc<Engine>,
    pub config: Arc<GlobalConfig>,
    pub api_token: Arc<String>,
}

/// Build the local daemon's router, wired with bearer auth, CORS, a body
/// size limit, and request tracing.
#[must_use]
pub fn router(state: HttpState) -> Router {
    let public = Router::new().route("/health", get(get_health));

    let api = Router::new()
        .route("/api/repos", get(get_repos))
        .route("/api/repos/branches", get(get_repo_branches))
        .route("/api/repos/discover", post(post_repos_discover))
        .route("/api/repos/import", post(post_repos_import))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/sessions", get(get_sessions).post(post_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/runs", post(post_session_runs))
        .route("/api/sessions/{id}/fork", post(post_session_fork))
        .route("/api/sessions/{id}/cancel", post(post_session_cancel))
        .route("/api/sessions/{id}/diff", get(get_session_diff))
        .route("/api/sessions/{id}/open", post(post_session_open))
        .route(
            "/api/sessions/{id}/runs/{run_id}/events",
            get(get_run_events),
        )
        .route(
            "/api/sessions/{id}/runs/{run_id}/stream",
            get(get_run_stream),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer_auth));

    public
        .merge(api)
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

fn is_allowed_origin(origin: &str) -> bool {
    if origin == "wails://wails" {
        return true;
    }
    for prefix in ["http://wails.localhost", "http://localhost", "http://127.0.0.1"] {
        if origin == prefix {
            return true;
        }
        if let Some(rest) = origin.strip_prefix(prefix) {
            if rest.starts_with(':') && rest[1..].chars().all(|c| c.is_ascii_digit()) {
                return true;
            }
        }
    }
    false
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin, _| {
            origin.to_str().is_ok_and(is_allowed_origin)
        }))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

/// Bearer-token auth for everything under `/api`. CORS preflight is
/// answered by the outer [`CorsLayer`] before it reaches this middleware.
/// Comparison is constant-time.
async fn require_bearer_auth(
    State(state): State<HttpState>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if !crate::crypto::constant_time_eq(token.as_bytes(), state.api_token.as_bytes()) {
        return error_response(&AppError::Unauthorized("missing or invalid bearer token".into()));
    }

    next.run(req).await
}

fn error_response(err: &AppError) -> Response {
    let status = match err {
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        AppError::Validation(_) | AppError::PathViolation(_) => StatusCode::BAD_REQUEST,
        AppError::Conflict(_) | AppError::AlreadyConsumed(_) => StatusCode::CONFLICT,
        AppError::Canceled => StatusCode::OK,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

fn ok<T: Serialize>(value: &T) -> Response {
    Json(value).into_response()
}

// ── GET /health ──────────────────────────────────────────────────────────

async fn get_health() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

// ── /api/repos, /api/repos/branches, /api/repos/discover, /api/repos/import

async fn get_repos(State(state): State<HttpState>) -> Response {
    match state.engine.store().repos.list().await {
        Ok(repos) => ok(&repos),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct BranchesQuery {
    name: String,
}

#[derive(Debug, Serialize)]
struct BranchInfo {
    name: String,
    is_default: bool,
}

async fn get_repo_branches(
    State(state): State<HttpState>,
    Query(query): Query<BranchesQuery>,
) -> Response {
    let repo = match state.engine.store().repos.require_by_name(&query.name).await {
        Ok(repo) => repo,
        Err(err) => return error_response(&err),
    };

    let cancel = CancellationToken::new();
    let base = std::path::Path::new(&repo.base_worktree_path);
    let branches = match git::list_branches(&cancel, base).await {
        Ok(branches) => branches,
        Err(err) => return error_response(&err),
    };

    let infos: Vec<BranchInfo> = branches
        .into_iter()
        .map(|name| {
            let is_default = name == repo.default_branch;
            BranchInfo { name, is_default }
        })
        .collect();
    ok(&infos)
}

async fn post_repos_discover(State(_state): State<HttpState>) -> Response {
    let cancel = CancellationToken::new();
    match git::discover_repos(&cancel).await {
        Ok(repos) => ok(&json!({ "repos": repos })),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct ImportCandidate {
    name_with_owner: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    repos: Vec<ImportCandidate>,
}

fn split_owner_repo(name_with_owner: &str) -> Result<(&str, &str)> {
    name_with_owner
        .split_once('/')
        .ok_or_else(|| AppError::Validation(format!("invalid repo name {name_with_owner}")))
}

async fn post_repos_import(
    State(state): State<HttpState>,
    Json(req): Json<ImportRequest>,
) -> Response {
    let cancel = CancellationToken::new();
    let root = state.config.repos_root();

    let mut jobs = Vec::with_capacity(req.repos.len());
    let mut parsed = Vec::with_capacity(req.repos.len());
    for candidate in &req.repos {
        let (owner, repo) = match split_owner_repo(&candidate.name_with_owner) {
            Ok(pair) => pair,
            Err(err) => return error_response(&err),
        };
        let paths = RepoPaths::for_repo(&root, owner, repo);
        jobs.push((paths.clone(), candidate.url.clone()));
        parsed.push((owner.to_string(), repo.to_string(), paths, candidate.url.clone()));
    }

    if let Err(err) = git::import_many(&cancel, jobs).await {
        return error_response(&err);
    }

    let mut imported = Vec::with_capacity(parsed.len());
    for (owner, repo_name, paths, url) in parsed {
        let default_branch = match git::default_branch(&cancel, &paths.base_worktree_path).await {
            Ok(branch) => branch,
            Err(err) => return error_response(&err),
        };
        let name = format!("{owner}/{repo_name}");
        let host = url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or("github.com")
            .to_string();
        let repo = Repo {
            name: name.clone(),
            url,
            host,
            owner,
            repo: repo_name,
            bare_path: paths.bare_path.to_string_lossy().into_owned(),
            base_worktree_path: paths.base_worktree_path.to_string_lossy().into_owned(),
            default_branch,
        };
        if let Err(err) = state.engine.store().repos.upsert(&repo).await {
            return error_response(&err);
        }
        imported.push(name);
    }

    ok(&json!({ "imported": imported }))
}

// ── /api/settings ────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct SettingsView {
    default_tool: String,
    tool_models: HashMap<String, String>,
    branch_prefix: String,
    autopr_default: bool,
}

async fn load_settings(state: &HttpState) -> Result<SettingsView> {
    let settings = state.engine.store().settings.list().await?;
    let mut view = SettingsView {
        default_tool: state.config.default_tool.clone(),
        tool_models: state.config.tool_models.models.clone(),
        branch_prefix: state.config.branch_prefix.clone(),
        autopr_default: state.config.autopr_default,
    };
    for setting in settings {
        match setting.key.as_str() {
            "default_tool" => view.default_tool = setting.value,
            "branch_prefix" => view.branch_prefix = setting.value,
            "autopr_default" => view.autopr_default = setting.value == "true",
            "tool_models" => {
                if let Ok(map) = serde_json::from_str(&setting.value) {
                    view.tool_models = map;
                }
            }
            _ => {}
        }
    }
    Ok(view)
}

async fn get_settings(State(state): State<HttpState>) -> Response {
    match load_settings(&state).await {
        Ok(view) => ok(&view),
        Err(err) => error_response(&err),
    }
}

async fn put_settings(State(state): State<HttpState>, Json(view): Json<SettingsView>) -> Response {
    let store = state.engine.store();
    if let Err(err) = store.settings.set("default_tool", &view.default_tool).await {
        return error_response(&err);
    }
    if let Err(err) = store.settings.set("branch_prefix", &view.branch_prefix).await {
        return error_response(&err);
    }
    if let Err(err) = store
        .settings
        .set("autopr_default", if view.autopr_default { "true" } else { "false" })
        .await
    {
        return error_response(&err);
    }
    let encoded = serde_json::to_string(&view.tool_models).unwrap_or_default();
    if let Err(err) = store.settings.set("tool_models", &encoded).await {
        return error_response(&err);
    }
    ok(&view)
}

// ── /api/sessions ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SessionWithLatestRun {
    #[serde(flatten)]
    session: Session,
    latest_run: Option<crate::store::Run>,
}

async fn get_sessions(State(state): State<HttpState>) -> Response {
    let store = state.engine.store();
    let sessions = match store.sessions.list().await {
        Ok(sessions) => sessions,
        Err(err) => return error_response(&err),
    };

    let mut out = Vec::with_capacity(sessions.len());
    for session in sessions {
        let latest_run = match store.runs.get_latest_run(&session.id).await {
            Ok(run) => run,
            Err(err) => return error_response(&err),
        };
        out.push(SessionWithLatestRun { session, latest_run });
    }
    ok(&out)
}

#[derive(Debug, Deserialize)]
struct NewSessionRequest {
    repo: String,
    tool: Option<String>,
    model: Option<String>,
    prompt: String,
    branch_name: Option<String>,
    #[serde(default)]
    autopr: bool,
    setup_cmd: Option<String>,
    #[serde(default)]
    validate: bool,
    validate_cmd: Option<String>,
    /// Accepted for API compatibility; the engine always roots a new
    /// session's branch on the repo's resolved default branch.
    #[serde(default)]
    base_branch: Option<String>,
    commit_msg: Option<String>,
    r#async: Option<bool>,
}

impl NewSessionRequest {
    fn into_options(self, default_tool: &str) -> StartSessionOptions {
        let _ = self.base_branch;
        StartSessionOptions {
            repo_name: self.repo,
            branch: self.branch_name,
            tool: self.tool.unwrap_or_else(|| default_tool.to_string()),
            model: self.model,
            prompt: self.prompt,
            autopr: self.autopr,
            setup_cmd: self.setup_cmd,
            validate: self.validate,
            validate_cmd: self.validate_cmd,
            commit_msg: self.commit_msg,
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionRunIds {
    session_id: String,
    run_id: String,
}

async fn post_sessions(State(state): State<HttpState>, Json(req): Json<NewSessionRequest>) -> Response {
    let is_async = req.r#async.unwrap_or(true);
    let opts = req.into_options(&state.config.default_tool);

    if is_async {
        match state.engine.start_session_async(opts).await {
            Ok((session, run)) => (
                StatusCode::ACCEPTED,
                Json(SessionRunIds { session_id: session.id, run_id: run.id }),
            )
                .into_response(),
            Err(err) => error_response(&err),
        }
    } else {
        match state.engine.start_session(opts).await {
            Ok((session, run)) => {
                (StatusCode::OK, Json(json!({"session": session, "run": run}))).into_response()
            }
            Err(err) => error_response(&err),
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionDetail {
    session: Session,
    runs: Vec<crate::store::Run>,
}

async fn get_session(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    let store = state.engine.store();
    let session = match store.sessions.require(&id).await {
        Ok(session) => session,
        Err(err) => return error_response(&err),
    };
    let runs = match store.runs.list_by_session(&id).await {
        Ok(runs) => runs,
        Err(err) => return error_response(&err),
    };
    ok(&SessionDetail { session, runs })
}

#[derive(Debug, Deserialize)]
struct FollowUpRequest {
    prompt: String,
    r#async: Option<bool>,
}

async fn post_session_runs(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Json(req): Json<FollowUpRequest>,
) -> Response {
    let is_async = req.r#async.unwrap_or(true);
    let result = if is_async {
        state.engine.continue_session_async(&id, &req.prompt).await
    } else {
        state.engine.continue_session(&id, &req.prompt).await
    };

    match result {
        Ok((session, run)) if is_async => (
            StatusCode::ACCEPTED,
            Json(SessionRunIds { session_id: session.id, run_id: run.id }),
        )
            .into_response(),
        Ok((session, run)) => {
            (StatusCode::OK, Json(json!({"session": session, "run": run}))).into_response()
        }
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct ForkRequest {
    repo: Option<String>,
    tool: Option<String>,
    model: Option<String>,
    prompt: String,
    branch_name: Option<String>,
    #[serde(default)]
    autopr: bool,
    commit_msg: Option<String>,
    r#async: Option<bool>,
}

async fn post_session_fork(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Json(req): Json<ForkRequest>,
) -> Response {
    let source = match state.engine.store().sessions.require(&id).await {
        Ok(session) => session,
        Err(err) => return error_response(&err),
    };

    let is_async = req.r#async.unwrap_or(true);
    let opts = StartSessionOptions {
        repo_name: req.repo.unwrap_or(source.repo_name),
        branch: req.branch_name,
        tool: req.tool.unwrap_or(source.tool),
        model: req.model.or(source.model),
        prompt: req.prompt,
        autopr: req.autopr,
        setup_cmd: None,
        validate: false,
        validate_cmd: None,
        commit_msg: req.commit_msg,
    };

    let result = if is_async {
        state.engine.fork_session_async(&id, opts).await
    } else {
        state.engine.fork_session(&id, opts).await
    };

    match result {
        Ok((session, run)) if is_async => (
            StatusCode::ACCEPTED,
            Json(SessionRunIds { session_id: session.id, run_id: run.id }),
        )
            .into_response(),
        Ok((session, run)) => {
            (StatusCode::OK, Json(json!({"session": session, "run": run}))).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn post_session_cancel(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    match state.engine.cancel_latest(&id).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"status": "cancel_requested"}))).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn get_session_diff(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    let store = state.engine.store();
    let session = match store.sessions.require(&id).await {
        Ok(session) => session,
        Err(err) => return error_response(&err),
    };
    let repo = match store.repos.require_by_name(&session.repo_name).await {
        Ok(repo) => repo,
        Err(err) => return error_response(&err),
    };

    let cancel = CancellationToken::new();
    let worktree = std::path::Path::new(&session.worktree_path);
    match git::diff_against_base(&cancel, worktree, &repo.default_branch).await {
        Ok(diff) => ok(&json!({"diff": diff})),
        Err(err) => error_response(&err),
    }
}

/// Launch the configured editor on the session's current worktree. The
/// editor command itself is an external collaborator: this only resolves
/// its name from settings and spawns it detached, never waiting on it.
async fn post_session_open(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    let session = match state.engine.store().sessions.require(&id).await {
        Ok(session) => session,
        Err(err) => return error_response(&err),
    };

    let editor = match state.engine.store().settings.get("editor_cmd").await {
        Ok(Some(setting)) => setting.value,
        Ok(None) => "code".to_string(),
        Err(err) => return error_response(&err),
    };

    match tokio::process::Command::new(&editor)
        .arg(&session.worktree_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(_) => ok(&json!({"opened": true, "editor": editor})),
        Err(err) => error_response(&AppError::Subprocess(format!(
            "failed to launch editor {editor}: {err}"
        ))),
    }
}

// ── /api/sessions/{id}/runs/{runID}/events, .../stream ──────────────────

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    limit: i64,
}

async fn get_run_events(
    State(state): State<HttpState>,
    Path((_session_id, run_id)): Path<(String, String)>,
    Query(query): Query<EventsQuery>,
) -> Response {
    match state.engine.store().run_events.list(&run_id, query.limit).await {
        Ok(events) => ok(&events),
        Err(err) => error_response(&err),
    }
}

const SSE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

/// Polling state for one client's live-tail of a run's event log.
struct TailState {
    store: crate::store::Store,
    run_id: String,
    last_id: i64,
    interval: tokio::time::Interval,
    finished: bool,
}

type SseItem = std::result::Result<Event, std::convert::Infallible>;

/// One poll tick: fetch events newer than `last_id`, translate them to SSE
/// items, and decide whether the tail is done (run reached a terminal state
/// or vanished).
async fn poll_tail(mut st: TailState) -> Option<(Vec<SseItem>, TailState)> {
    if st.finished {
        return None;
    }
    st.interval.tick().await;

    let events: Vec<RunEvent> = match st.store.run_events.list_after(&st.run_id, st.last_id).await {
        Ok(events) => events,
        Err(err) => {
            st.finished = true;
            return Some((vec![Ok(Event::default().event("error").data(err.to_string()))], st));
        }
    };

    let mut batch = Vec::with_capacity(events.len() + 1);
    let mut reached_terminal = false;
    for event in &events {
        st.last_id = event.id;
        let payload = serde_json::to_string(event).unwrap_or_default();
        batch.push(Ok(Event::default().event("event").id(event.id.to_string()).data(payload)));
        if is_terminal_event(event) {
            reached_terminal = true;
        }
    }

    if reached_terminal {
        batch.push(Ok(Event::default().event("done").data("{}")));
        st.finished = true;
        return Some((batch, st));
    }

    match st.store.runs.get(&st.run_id).await {
        Ok(Some(run)) if run.state.is_terminal() && events.is_empty() => {
            batch.push(Ok(Event::default().event("done").data("{}")));
            st.finished = true;
        }
        Ok(None) => st.finished = true,
        _ => {}
    }

    Some((batch, st))
}

async fn get_run_stream(
    State(state): State<HttpState>,
    Path((_session_id, run_id)): Path<(String, String)>,
) -> Sse<impl Stream<Item = SseItem>> {
    let initial = TailState {
        store: state.engine.store().clone(),
        run_id,
        last_id: 0,
        interval: tokio::time::interval(SSE_POLL_INTERVAL),
        finished: false,
    };

    let batches = stream::unfold(initial, poll_tail);
    let flattened = batches.flat_map(stream::iter);

    Sse::new(flattened).keep_alive(KeepAlive::default())
}

fn is_terminal_event(event: &RunEvent) -> bool {
    matches!(
        event.kind,
        crate::store::RunEventKind::Complete
            | crate::store::RunEventKind::Error
            | crate::store::RunEventKind::Cancelled
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_known_origin_patterns() {
        assert!(is_allowed_origin("wails://wails"));
        assert!(is_allowed_origin("http://localhost"));
        assert!(is_allowed_origin("http://localhost:5173"));
        assert!(is_allowed_origin("http://127.0.0.1:4173"));
        assert!(is_allowed_origin("http://wails.localhost:1234"));
    }

    #[test]
    fn rejects_unknown_origins() {
        assert!(!is_allowed_origin("https://evil.example.com"));
        assert!(!is_allowed_origin("http://localhost.evil.com"));
    }

    #[test]
    fn split_owner_repo_parses_a_valid_name() {
        assert_eq!(split_owner_repo("acme/widgets").unwrap(), ("acme", "widgets"));
    }

    #[test]
    fn split_owner_repo_rejects_a_bare_name() {
        assert!(split_owner_repo("widgets").is_err());
    }
}
