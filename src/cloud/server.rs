//! The cloud relay's axum HTTP surface (C7): Slack Events API webhook,
//! OAuth install flow, pairing, and the device job queue.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use slack_morphism::prelude::{
    SlackApiChatPostMessageRequest, SlackApiToken, SlackApiTokenType, SlackApiTokenValue,
    SlackChannelId, SlackClient, SlackClientHyperHttpsConnector, SlackMessageContent, SlackTs,
};

use crate::config::CloudConfig;
use crate::{AppError, Result};

use super::command;
use super::job_repo::{JobCompletion, NewJob};
use super::models::JobKind;
use super::CloudStore;

/// Shared state for every cloud HTTP handler.
#[derive(Clone)]
pub struct CloudState {
    pub store: CloudStore,
    pub config: Arc<CloudConfig>,
    pub master_key: [u8; 32],
    pub slack_client: Arc<SlackClient<SlackClientHyperHttpsConnector>>,
}

impl CloudState {
    /// Construct cloud state, building the Slack HTTPS connector.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Slack` if the HTTPS connector cannot be created.
    pub fn new(store: CloudStore, config: CloudConfig, master_key: [u8; 32]) -> Result<Self> {
        let connector = SlackClientHyperHttpsConnector::new()
            .map_err(|err| AppError::Slack(format!("failed to init slack connector: {err}")))?;
        Ok(Self {
            store,
            config: Arc::new(config),
            master_key,
            slack_client: Arc::new(SlackClient::new(connector)),
        })
    }

    async fn post_message(
        &self,
        bot_token: &str,
        channel: &str,
        thread_ts: &str,
        text: &str,
    ) -> Result<()> {
        let token = SlackApiToken {
            token_value: SlackApiTokenValue(bot_token.to_string()),
            cookie: None,
            team_id: None,
            scope: None,
            token_type: Some(SlackApiTokenType::Bot),
        };
        let session = self.slack_client.open_session(&token);
        let request = SlackApiChatPostMessageRequest {
            channel: SlackChannelId(channel.to_string()),
            content: SlackMessageContent {
                text: Some(text.to_string()),
                blocks: None,
                attachments: None,
                upload: None,
                files: None,
                reactions: None,
                metadata: None,
            },
            as_user: None,
            icon_emoji: None,
            icon_url: None,
            link_names: Some(true),
            parse: None,
            thread_ts: Some(SlackTs(thread_ts.to_string())),
            username: None,
            reply_broadcast: None,
            unfurl_links: None,
            unfurl_media: None,
        };
        session
            .chat_post_message(&request)
            .await
            .map_err(|err| AppError::Slack(format!("failed to post message: {err}")))?;
        Ok(())
    }
}

/// Build the cloud relay's router.
#[must_use]
pub fn router(state: CloudState) -> Router {
    let public = Router::new()
        .route("/slack/events", post(post_slack_events))
        .route("/slack/install", get(get_slack_install))
        .route("/slack/oauth/callback", get(get_slack_oauth_callback))
        .route("/v1/pair/claim", post(post_pair_claim));

    let device_protected = Router::new()
        .route("/v1/pair/unpair", post(post_pair_unpair))
        .route("/v1/device/jobs/claim", post(post_jobs_claim))
        .route("/v1/device/jobs/{id}/complete", post(post_jobs_complete))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_device_auth));

    public
        .merge(device_protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Identity of the authenticated device, attached to request extensions by
/// [`require_device_auth`].
#[derive(Clone)]
struct AuthedDevice(String);

async fn require_device_auth(
    State(state): State<CloudState>,
    headers: HeaderMap,
    mut req: axum::extract::Request,
    next: Next,
) -> Response {
    let device_id = headers
        .get("x-fog-device-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if device_id.is_empty() {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "missing X-Fog-Device-ID"})))
            .into_response();
    }

    match state.store.devices.authenticate(device_id, token).await {
        Ok(true) => {
            req.extensions_mut().insert(AuthedDevice(device_id.to_string()));
            next.run(req).await
        }
        Ok(false) => {
            (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid device credentials"})))
                .into_response()
        }
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &AppError) -> Response {
    let status = match err {
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::Conflict(_) | AppError::AlreadyConsumed(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

// ── POST /slack/events ──────────────────────────────────────────────────

async fn post_slack_events(
    State(state): State<CloudState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let timestamp = headers
        .get("x-slack-request-timestamp")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let signature = headers
        .get("x-slack-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if let Err(err) = super::sig::verify(
        &state.config.slack_signing_secret,
        timestamp,
        &body,
        signature,
        chrono::Utc::now(),
    ) {
        return error_response(&err);
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid json"}))).into_response(),
    };

    if payload.get("type").and_then(Value::as_str) == Some("url_verification") {
        let challenge = payload.get("challenge").and_then(Value::as_str).unwrap_or("");
        return Json(json!({"challenge": challenge})).into_response();
    }

    if payload.get("type").and_then(Value::as_str) == Some("event_callback") {
        let team_id = payload.get("team_id").and_then(Value::as_str).unwrap_or("").to_string();
        let event_id = payload.get("event_id").and_then(Value::as_str).unwrap_or("").to_string();

        match state.store.events.record_event_id(&team_id, &event_id).await {
            Ok(true) => {}
            Ok(false) => return StatusCode::OK.into_response(),
            Err(err) => return error_response(&err),
        }

        if let Some(event) = payload.get("event") {
            if event.get("type").and_then(Value::as_str) == Some("app_mention") {
                if let Err(err) = handle_app_mention(&state, &team_id, event).await {
                    tracing::error!(error = ?err, "failed to handle app_mention");
                }
            }
        }
    }

    StatusCode::OK.into_response()
}

async fn handle_app_mention(state: &CloudState, team_id: &str, event: &Value) -> Result<()> {
    let text = event.get("text").and_then(Value::as_str).unwrap_or("");
    let channel_id = event.get("channel").and_then(Value::as_str).unwrap_or("").to_string();
    let user_id = event.get("user").and_then(Value::as_str).unwrap_or("").to_string();
    let ts = event.get("ts").and_then(Value::as_str).unwrap_or("").to_string();
    let root_ts = event
        .get("thread_ts")
        .and_then(Value::as_str)
        .unwrap_or(&ts)
        .to_string();

    let bot_token = state.store.installations.bot_token(&state.master_key, team_id).await?;

    let pairing = state.store.pairings.get_pairing(team_id, &user_id).await?;
    let Some(pairing) = pairing else {
        let request = state
            .store
            .pairings
            .create_pairing_request(
                team_id,
                &user_id,
                &channel_id,
                &root_ts,
                std::time::Duration::from_secs(state.config.pairing_ttl_secs),
            )
            .await?;
        let text = format!(
            "You're not paired with a device yet. Run `fogd pair --code {}` on your machine to connect it.",
            request.code
        );
        state.post_message(&bot_token, &channel_id, &ts, &text).await?;
        return Ok(());
    };

    let existing_session = state.store.threads.get(team_id, &channel_id, &root_ts).await?;

    let new_job = if let Some(thread_session) = existing_session {
        let prompt = command::parse_follow_up(text)?;
        NewJob {
            kind: JobKind::FollowUp,
            device_id: pairing.device_id,
            team_id: team_id.to_string(),
            channel_id: channel_id.clone(),
            root_ts,
            slack_user_id: user_id,
            prompt,
            session_id: Some(thread_session.session_id),
            ..Default::default()
        }
    } else {
        let (options, prompt) = command::parse_new_session(text)?;
        NewJob {
            kind: JobKind::StartSession,
            device_id: pairing.device_id,
            team_id: team_id.to_string(),
            channel_id: channel_id.clone(),
            root_ts,
            slack_user_id: user_id,
            prompt,
            repo: Some(options.repo),
            tool: options.tool,
            model: options.model,
            autopr: options.autopr,
            branch_name: options.branch_name,
            commit_msg: options.commit_msg,
            session_id: None,
        }
    };

    state.store.jobs.enqueue_job(new_job).await?;
    state
        .post_message(&bot_token, &channel_id, &ts, "Working on it...")
        .await?;
    Ok(())
}

// ── GET /slack/install, GET /slack/oauth/callback ───────────────────────

const SLACK_OAUTH_SCOPES: &str = "app_mentions:read,chat:write";

async fn get_slack_install(State(state): State<CloudState>) -> Redirect {
    let url = format!(
        "https://slack.com/oauth/v2/authorize?client_id={}&scope={}",
        state.config.slack_client_id, SLACK_OAUTH_SCOPES
    );
    Redirect::temporary(&url)
}

#[derive(Debug, Deserialize)]
struct OAuthCallbackParams {
    code: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthAccessResponse {
    ok: bool,
    error: Option<String>,
    access_token: Option<String>,
    bot_user_id: Option<String>,
    team: Option<OAuthTeam>,
}

#[derive(Debug, Deserialize)]
struct OAuthTeam {
    id: String,
}

async fn get_slack_oauth_callback(
    State(state): State<CloudState>,
    Query(params): Query<OAuthCallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": error}))).into_response();
    }
    let Some(code) = params.code else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing code"}))).into_response();
    };

    let client = reqwest::Client::new();
    let result = client
        .post("https://slack.com/api/oauth.v2.access")
        .form(&[
            ("client_id", state.config.slack_client_id.as_str()),
            ("client_secret", state.config.slack_client_secret.as_str()),
            ("code", code.as_str()),
        ])
        .send()
        .await
        .and_then(reqwest::Response::error_for_status);

    let response = match result {
        Ok(resp) => resp,
        Err(err) => return error_response(&AppError::from(err)),
    };

    let parsed: OAuthAccessResponse = match response.json().await {
        Ok(v) => v,
        Err(err) => return error_response(&AppError::from(err)),
    };

    if !parsed.ok {
        return error_response(&AppError::Slack(
            parsed.error.unwrap_or_else(|| "oauth exchange failed".into()),
        ));
    }

    let (Some(access_token), Some(bot_user_id), Some(team)) =
        (parsed.access_token, parsed.bot_user_id, parsed.team)
    else {
        return error_response(&AppError::Slack("incomplete oauth response".into()));
    };

    if let Err(err) = state
        .store
        .installations
        .save_installation(&state.master_key, &team.id, &bot_user_id, &access_token)
        .await
    {
        return error_response(&err);
    }

    Json(json!({"installed": true, "team_id": team.id})).into_response()
}

// ── POST /v1/pair/claim, POST /v1/pair/unpair ───────────────────────────

#[derive(Debug, Deserialize)]
struct PairClaimRequest {
    code: String,
    device_id: String,
    device_token: String,
}

#[derive(Debug, Serialize)]
struct PairClaimResponse {
    team_id: String,
    slack_user_id: String,
    device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_token: Option<String>,
}

async fn post_pair_claim(
    State(state): State<CloudState>,
    Json(req): Json<PairClaimRequest>,
) -> Response {
    match state
        .store
        .pairings
        .claim_pairing_request(&req.code, &req.device_id, &req.device_token)
        .await
    {
        Ok(outcome) => Json(PairClaimResponse {
            team_id: outcome.team_id,
            slack_user_id: outcome.slack_user_id,
            device_id: outcome.device_id,
            device_token: outcome.device_token,
        })
        .into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct UnpairRequest {
    team_id: String,
    slack_user_id: String,
}

async fn post_pair_unpair(
    State(state): State<CloudState>,
    Json(req): Json<UnpairRequest>,
) -> Response {
    match state.store.pairings.unpair(&req.team_id, &req.slack_user_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

// ── POST /v1/device/jobs/claim, POST /v1/device/jobs/{id}/complete ─────

async fn post_jobs_claim(
    State(state): State<CloudState>,
    req: axum::extract::Request,
) -> Response {
    let device_id = req
        .extensions()
        .get::<AuthedDevice>()
        .map(|d| d.0.clone())
        .unwrap_or_default();

    match state.store.jobs.claim_next_job(&device_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct JobCompleteRequest {
    success: bool,
    session_id: Option<String>,
    run_id: Option<String>,
    branch: Option<String>,
    pr_url: Option<String>,
    commit_sha: Option<String>,
    error: Option<String>,
}

async fn post_jobs_complete(
    State(state): State<CloudState>,
    Path(id): Path<String>,
    req: axum::extract::Request,
) -> Response {
    let device_id = req
        .extensions()
        .get::<AuthedDevice>()
        .map(|d| d.0.clone())
        .unwrap_or_default();

    // Body has to be extracted manually since `req` was taken by value above
    // for the extension lookup; axum's `Json` extractor can't run afterward.
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, 1024 * 1024).await {
        Ok(b) => b,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid body"}))).into_response(),
    };
    let completion: JobCompleteRequest = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid json"}))).into_response(),
    };
    let _ = parts;

    let job = match state.store.jobs.get(&id).await {
        Ok(Some(job)) => job,
        Ok(None) => return error_response(&AppError::NotFound(format!("job {id} not found"))),
        Err(err) => return error_response(&err),
    };

    if let Err(err) = state
        .store
        .jobs
        .complete_job(
            &id,
            &device_id,
            JobCompletion {
                success: completion.success,
                session_id: completion.session_id.clone(),
                run_id: completion.run_id,
                branch: completion.branch,
                pr_url: completion.pr_url.clone(),
                commit_sha: completion.commit_sha,
                error: completion.error.clone(),
            },
        )
        .await
    {
        return error_response(&err);
    }

    if completion.success && job.kind == JobKind::StartSession {
        if let Some(session_id) = &completion.session_id {
            if let Err(err) = state
                .store
                .threads
                .bind(&job.team_id, &job.channel_id, &job.root_ts, session_id)
                .await
            {
                tracing::error!(error = ?err, "failed to bind thread to session");
            }
        }
    }

    if let Ok(Some(installation)) = state.store.installations.get(&job.team_id).await {
        let _ = installation;
        if let Ok(bot_token) = state
            .store
            .installations
            .bot_token(&state.master_key, &job.team_id)
            .await
        {
            let text = if completion.success {
                let mut msg = "Done.".to_string();
                if let Some(branch) = &completion.branch {
                    msg.push_str(&format!(" Branch `{branch}`."));
                }
                if let Some(pr_url) = &completion.pr_url {
                    msg.push_str(&format!(" PR: {pr_url}"));
                }
                msg
            } else {
                format!("That run failed: {}", completion.error.unwrap_or_else(|| "unknown error".into()))
            };
            if let Err(err) = state
                .post_message(&bot_token, &job.channel_id, &job.root_ts, &text)
                .await
            {
                tracing::error!(error = ?err, "failed to post completion message");
            }
        }
    }

    StatusCode::OK.into_response()
}
