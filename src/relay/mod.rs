//! Cloud relay client (C8): pairs this daemon with a Slack workspace, then
//! long-polls the cloud for queued jobs and drives them through the
//! session engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::{Engine, StartSessionOptions};
use crate::store::{RunState, Session, Store};
use crate::{AppError, Result};

/// How long a worker sleeps between claim attempts, whether the prior
/// attempt found no job or failed outright.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

const DEVICE_ID_SETTING: &str = "relay_device_id";
const DEVICE_TOKEN_SECRET: &str = "relay_device_token";

/// A device's paired identity: the id/token pair sent with every relay
/// request, and the team this device is paired to.
#[derive(Debug, Clone)]
pub struct DeviceCredentials {
    pub device_id: String,
    pub device_token: String,
}

/// Load this daemon's device credentials, generating and persisting a
/// fresh device id/token pair if none exist yet. The token is sealed with
/// the daemon's own master key, the same as any other local secret.
///
/// # Errors
///
/// Propagates any persistence or crypto failure.
pub async fn load_or_create_credentials(
    store: &Store,
    master_key: &[u8; 32],
) -> Result<DeviceCredentials> {
    let device_id = match store.settings.get(DEVICE_ID_SETTING).await? {
        Some(setting) => setting.value,
        None => {
            let generated = Uuid::new_v4().to_string();
            store.settings.set(DEVICE_ID_SETTING, &generated).await?;
            generated
        }
    };

    let device_token = match store.secrets.get(master_key, DEVICE_TOKEN_SECRET).await? {
        Some(bytes) => String::from_utf8(bytes)
            .map_err(|err| AppError::Crypto(format!("device token is not valid utf-8: {err}")))?,
        None => {
            let generated = hex::encode(rand_bytes::<32>());
            store
                .secrets
                .save(master_key, DEVICE_TOKEN_SECRET, generated.as_bytes())
                .await?;
            generated
        }
    };

    Ok(DeviceCredentials { device_id, device_token })
}

fn rand_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut buf = [0u8; N];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[derive(Debug, Serialize)]
struct PairClaimRequest<'a> {
    code: &'a str,
    device_id: &'a str,
    device_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct PairClaimResponse {
    team_id: String,
    slack_user_id: String,
}

/// Claim a one-time pairing code printed by the Slack `/fog pair` command,
/// binding this device's credentials to that Slack user.
///
/// # Errors
///
/// Returns `AppError::Slack` (via the cloud's own error mapping) if the
/// code is invalid, expired, or already consumed.
pub async fn pair(
    client: &reqwest::Client,
    cloud_base_url: &str,
    code: &str,
    creds: &DeviceCredentials,
) -> Result<(String, String)> {
    let url = format!("{cloud_base_url}/v1/pair/claim");
    let resp = client
        .post(url)
        .json(&PairClaimRequest { code, device_id: &creds.device_id, device_token: &creds.device_token })
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(AppError::from)?;
    let parsed: PairClaimResponse = resp.json().await.map_err(AppError::from)?;
    Ok((parsed.team_id, parsed.slack_user_id))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum JobKind {
    StartSession,
    FollowUp,
}

#[derive(Debug, Deserialize)]
struct ClaimedJob {
    id: String,
    kind: JobKind,
    repo: Option<String>,
    tool: Option<String>,
    model: Option<String>,
    autopr: Option<bool>,
    branch_name: Option<String>,
    commit_msg: Option<String>,
    session_id: Option<String>,
    prompt: String,
}

#[derive(Debug, Serialize, Default)]
struct JobCompletion {
    success: bool,
    session_id: Option<String>,
    run_id: Option<String>,
    branch: Option<String>,
    pr_url: Option<String>,
    commit_sha: Option<String>,
    error: Option<String>,
}

fn device_headers(
    builder: reqwest::RequestBuilder,
    creds: &DeviceCredentials,
) -> reqwest::RequestBuilder {
    builder
        .header("x-fog-device-id", &creds.device_id)
        .bearer_auth(&creds.device_token)
}

async fn claim_job(
    client: &reqwest::Client,
    cloud_base_url: &str,
    creds: &DeviceCredentials,
) -> Result<Option<ClaimedJob>> {
    let url = format!("{cloud_base_url}/v1/device/jobs/claim");
    let req = device_headers(client.post(url), creds);
    let resp = req.send().await.map_err(AppError::from)?;

    if resp.status() == reqwest::StatusCode::NO_CONTENT {
        return Ok(None);
    }
    let resp = resp.error_for_status().map_err(AppError::from)?;
    let job: ClaimedJob = resp.json().await.map_err(AppError::from)?;
    Ok(Some(job))
}

async fn complete_job(
    client: &reqwest::Client,
    cloud_base_url: &str,
    creds: &DeviceCredentials,
    job_id: &str,
    completion: &JobCompletion,
) -> Result<()> {
    let url = format!("{cloud_base_url}/v1/device/jobs/{job_id}/complete");
    let req = device_headers(client.post(url), creds).json(completion);
    req.send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(AppError::from)?;
    Ok(())
}

fn completion_from_run(session: &Session, run: &crate::store::Run, error: Option<String>) -> JobCompletion {
    JobCompletion {
        success: run.state == RunState::Committed
            || run.state == RunState::PrCreated
            || run.state == RunState::Completed,
        session_id: Some(session.id.clone()),
        run_id: Some(run.id.clone()),
        branch: Some(session.branch.clone()),
        pr_url: session.pr_url.clone(),
        commit_sha: run.commit_sha.clone(),
        error: error.or_else(|| run.error.clone()),
    }
}

/// Run one claimed job to completion through the engine and build the
/// completion payload to post back to the cloud.
async fn dispatch(engine: &Engine, job: &ClaimedJob) -> JobCompletion {
    let result = match job.kind {
        JobKind::StartSession => {
            let Some(repo_name) = job.repo.clone() else {
                return JobCompletion {
                    success: false,
                    error: Some("start_session job missing repo".into()),
                    ..Default::default()
                };
            };
            engine
                .start_session(StartSessionOptions {
                    repo_name,
                    branch: job.branch_name.clone(),
                    tool: job.tool.clone().unwrap_or_default(),
                    model: job.model.clone(),
                    prompt: job.prompt.clone(),
                    autopr: job.autopr.unwrap_or(false),
                    setup_cmd: None,
                    validate: false,
                    validate_cmd: None,
                    commit_msg: job.commit_msg.clone(),
                })
                .await
        }
        JobKind::FollowUp => {
            let Some(session_id) = job.session_id.clone() else {
                return JobCompletion {
                    success: false,
                    error: Some("follow_up job missing session_id".into()),
                    ..Default::default()
                };
            };
            engine.continue_session(&session_id, &job.prompt).await
        }
    };

    match result {
        Ok((session, run)) => completion_from_run(&session, &run, None),
        Err(err) => JobCompletion { success: false, error: Some(err.to_string()), ..Default::default() },
    }
}

/// Long-poll the cloud for jobs addressed to this device and drive each
/// one through the engine, until `cancel` fires. Matches the cloud's own
/// retry posture: any claim/complete failure is logged and the loop
/// continues unchanged after `POLL_INTERVAL`, rather than backing off.
pub async fn run(engine: Engine, cloud_base_url: String, creds: DeviceCredentials, cancel: CancellationToken) {
    let client = reqwest::Client::new();
    info!(device_id = %creds.device_id, "relay worker starting");

    loop {
        if cancel.is_cancelled() {
            info!("relay worker stopping");
            return;
        }

        let job = tokio::select! {
            () = cancel.cancelled() => return,
            result = claim_job(&client, &cloud_base_url, &creds) => result,
        };

        let job = match job {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
            Err(err) => {
                warn!(error = %err, "relay job claim failed");
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        };

        let job_id = job.id.clone();
        let completion = dispatch(&engine, &job).await;
        if let Err(err) = complete_job(&client, &cloud_base_url, &creds, &job_id, &completion).await {
            error!(error = %err, job_id = %job_id, "relay job completion post failed");
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Run, RunState};

    fn sample_session() -> Session {
        Session {
            id: "s1".into(),
            repo_name: "acme/widgets".into(),
            branch: "fog/abc".into(),
            worktree_path: "/tmp/x".into(),
            tool: "claude".into(),
            model: None,
            autopr: false,
            pr_url: Some("https://example.com/pr/1".into()),
            status: RunState::Completed,
            busy: false,
            conversation_id: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn sample_run(state: RunState) -> Run {
        Run {
            id: "r1".into(),
            session_id: "s1".into(),
            prompt: "do the thing".into(),
            worktree_path: "/tmp/x".into(),
            state,
            commit_sha: Some("deadbeef".into()),
            commit_msg: None,
            error: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            completed_at: Some(chrono::Utc::now()),
        }
    }

    #[test]
    fn completion_marks_success_for_terminal_success_states() {
        let session = sample_session();
        let run = sample_run(RunState::Completed);
        let completion = completion_from_run(&session, &run, None);
        assert!(completion.success);
        assert_eq!(completion.branch.as_deref(), Some("fog/abc"));
        assert_eq!(completion.commit_sha.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn completion_marks_failure_for_failed_state() {
        let session = sample_session();
        let mut run = sample_run(RunState::Failed);
        run.error = Some("boom".into());
        let completion = completion_from_run(&session, &run, None);
        assert!(!completion.success);
        assert_eq!(completion.error.as_deref(), Some("boom"));
    }
}
