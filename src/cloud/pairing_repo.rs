//! Pairing repository: one-time codes, the 1:1 Slack-user/device binding,
//! and the atomic claim transaction (C6 §4.6, P5 in spec.md §8).

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use sqlx::FromRow;

use crate::crypto;
use crate::{AppError, Result};

use super::db::Database;
use super::models::{Pairing, PairingRequest};

const CODE_CREATE_RETRIES: usize = 5;
const DEVICE_TOKEN_BYTES: usize = 24;

fn random_hex(n_bytes: usize) -> String {
    let mut bytes = vec![0u8; n_bytes];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(FromRow)]
struct PairingRequestRow {
    code: String,
    team_id: String,
    slack_user_id: String,
    channel_id: String,
    root_ts: String,
    expires_at: String,
    claimed_at: Option<String>,
    created_at: String,
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid timestamp: {e}")))
}

impl PairingRequestRow {
    fn into_request(self) -> Result<PairingRequest> {
        Ok(PairingRequest {
            code: self.code,
            team_id: self.team_id,
            slack_user_id: self.slack_user_id,
            channel_id: self.channel_id,
            root_ts: self.root_ts,
            expires_at: parse_ts(&self.expires_at)?,
            claimed_at: self.claimed_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[derive(FromRow)]
struct PairingRow {
    team_id: String,
    slack_user_id: String,
    device_id: String,
    created_at: String,
    updated_at: String,
}

impl PairingRow {
    fn into_pairing(self) -> Result<Pairing> {
        Ok(Pairing {
            team_id: self.team_id,
            slack_user_id: self.slack_user_id,
            device_id: self.device_id,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Outcome of [`PairingRepo::claim_pairing_request`].
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub team_id: String,
    pub slack_user_id: String,
    pub device_id: String,
    /// Present only the first time a device is minted a token.
    pub device_token: Option<String>,
}

/// Repository wrapper around `SQLite` for pairings and pairing requests.
#[derive(Clone)]
pub struct PairingRepo {
    db: Arc<Database>,
}

impl PairingRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Generate a fresh one-time 4-byte hex code (uppercased), retrying up
    /// to [`CODE_CREATE_RETRIES`] times on a unique-constraint collision.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if every retry collides, or
    /// `AppError::Db` on any other failure.
    pub async fn create_pairing_request(
        &self,
        team_id: &str,
        slack_user_id: &str,
        channel_id: &str,
        root_ts: &str,
        ttl: std::time::Duration,
    ) -> Result<PairingRequest> {
        let now = Utc::now();
        let expires_at = now
            + ChronoDuration::from_std(ttl)
                .map_err(|e| AppError::Config(format!("invalid ttl: {e}")))?;

        for attempt in 0..CODE_CREATE_RETRIES {
            let code = random_hex(4).to_uppercase();
            let result = sqlx::query(
                "INSERT INTO pairing_requests
                 (code, team_id, slack_user_id, channel_id, root_ts, expires_at, claimed_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)",
            )
            .bind(&code)
            .bind(team_id)
            .bind(slack_user_id)
            .bind(channel_id)
            .bind(root_ts)
            .bind(expires_at.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(self.db.as_ref())
            .await;

            match result {
                Ok(_) => {
                    return Ok(PairingRequest {
                        code,
                        team_id: team_id.to_string(),
                        slack_user_id: slack_user_id.to_string(),
                        channel_id: channel_id.to_string(),
                        root_ts: root_ts.to_string(),
                        expires_at,
                        claimed_at: None,
                        created_at: now,
                    });
                }
                Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                    tracing::warn!(attempt, "pairing request code collided, retrying");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(AppError::Conflict(
            "could not generate a unique pairing code".into(),
        ))
    }

    /// Claim a pairing request by code: one transaction that validates the
    /// code, verifies or mints the device's token, enforces one-device-per-user,
    /// and marks the request claimed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the code is unknown,
    /// `AppError::AlreadyConsumed` if already claimed, `AppError::Validation`
    /// if expired, `AppError::Unauthorized` if `presented_token` does not
    /// match an existing device, and `AppError::Conflict` ("unpair first")
    /// if the Slack user is already paired to a different device.
    pub async fn claim_pairing_request(
        &self,
        code: &str,
        device_id: &str,
        presented_token: &str,
    ) -> Result<ClaimOutcome> {
        let mut tx = self.db.begin().await?;

        let row: Option<PairingRequestRow> =
            sqlx::query_as("SELECT * FROM pairing_requests WHERE code = ?1")
                .bind(code)
                .fetch_optional(&mut *tx)
                .await?;
        let row = row.ok_or_else(|| AppError::NotFound(format!("unknown pairing code {code}")))?;
        let request = row.into_request()?;

        if request.claimed_at.is_some() {
            return Err(AppError::AlreadyConsumed("pairing code already claimed".into()));
        }
        if request.expires_at < Utc::now() {
            return Err(AppError::Validation("pairing code has expired".into()));
        }

        let existing_device: Option<(String,)> =
            sqlx::query_as("SELECT token_hash FROM devices WHERE id = ?1")
                .bind(device_id)
                .fetch_optional(&mut *tx)
                .await?;

        let device_token = if let Some((stored_hash,)) = existing_device {
            let presented_hash = crypto::hash_device_token(presented_token);
            if !crypto::constant_time_eq(presented_hash.as_bytes(), stored_hash.as_bytes()) {
                return Err(AppError::Unauthorized("device token mismatch".into()));
            }
            None
        } else {
            let fresh_token = random_hex(DEVICE_TOKEN_BYTES);
            let now = Utc::now().to_rfc3339();
            sqlx::query("INSERT INTO devices (id, token_hash, created_at) VALUES (?1, ?2, ?3)")
                .bind(device_id)
                .bind(crypto::hash_device_token(&fresh_token))
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            Some(fresh_token)
        };

        let existing_pairing: Option<(String,)> = sqlx::query_as(
            "SELECT device_id FROM pairings WHERE team_id = ?1 AND slack_user_id = ?2",
        )
        .bind(&request.team_id)
        .bind(&request.slack_user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((paired_device,)) = &existing_pairing {
            if paired_device != device_id {
                return Err(AppError::Conflict(
                    "slack user is already paired to another device; unpair first".into(),
                ));
            }
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO pairings (team_id, slack_user_id, device_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(team_id, slack_user_id) DO UPDATE SET
                device_id = excluded.device_id, updated_at = excluded.updated_at",
        )
        .bind(&request.team_id)
        .bind(&request.slack_user_id)
        .bind(device_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "UPDATE pairing_requests SET claimed_at = ?1 WHERE code = ?2 AND claimed_at IS NULL",
        )
        .bind(&now)
        .bind(code)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::AlreadyConsumed("pairing code already claimed".into()));
        }

        tx.commit().await?;

        Ok(ClaimOutcome {
            team_id: request.team_id,
            slack_user_id: request.slack_user_id,
            device_id: device_id.to_string(),
            device_token,
        })
    }

    /// Remove the pairing for `(team_id, slack_user_id)`, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn unpair(&self, team_id: &str, slack_user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM pairings WHERE team_id = ?1 AND slack_user_id = ?2")
            .bind(team_id)
            .bind(slack_user_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Fetch the device paired to a Slack user, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_pairing(&self, team_id: &str, slack_user_id: &str) -> Result<Option<Pairing>> {
        let row: Option<PairingRow> = sqlx::query_as(
            "SELECT * FROM pairings WHERE team_id = ?1 AND slack_user_id = ?2",
        )
        .bind(team_id)
        .bind(slack_user_id)
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(PairingRow::into_pairing).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn claim_is_atomic_across_two_concurrent_attempts() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = PairingRepo::new(db);
        let request = repo
            .create_pairing_request("T1", "U1", "C1", "100.001", Duration::from_secs(600))
            .await
            .unwrap();

        let first = repo.claim_pairing_request(&request.code, "device-a", "").await;
        let second = repo.claim_pairing_request(&request.code, "device-b", "").await;

        assert!(first.is_ok());
        assert!(matches!(second, Err(AppError::AlreadyConsumed(_))));
    }

    #[tokio::test]
    async fn claim_mints_device_token_once_then_requires_it() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = PairingRepo::new(db);

        let first_request = repo
            .create_pairing_request("T1", "U1", "C1", "100.001", Duration::from_secs(600))
            .await
            .unwrap();
        let claim = repo
            .claim_pairing_request(&first_request.code, "device-a", "")
            .await
            .unwrap();
        let token = claim.device_token.expect("fresh device mints a token");

        let second_request = repo
            .create_pairing_request("T1", "U2", "C1", "100.002", Duration::from_secs(600))
            .await
            .unwrap();
        let wrong = repo
            .claim_pairing_request(&second_request.code, "device-a", "wrong-token")
            .await;
        assert!(matches!(wrong, Err(AppError::Unauthorized(_))));

        let third_request = repo
            .create_pairing_request("T1", "U2", "C1", "100.003", Duration::from_secs(600))
            .await
            .unwrap();
        let ok = repo
            .claim_pairing_request(&third_request.code, "device-a", &token)
            .await
            .unwrap();
        assert!(ok.device_token.is_none());
    }

    #[tokio::test]
    async fn claim_rejects_second_device_for_same_user() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = PairingRepo::new(db);

        let r1 = repo
            .create_pairing_request("T1", "U1", "C1", "100.001", Duration::from_secs(600))
            .await
            .unwrap();
        repo.claim_pairing_request(&r1.code, "device-a", "").await.unwrap();

        let r2 = repo
            .create_pairing_request("T1", "U1", "C1", "100.002", Duration::from_secs(600))
            .await
            .unwrap();
        let result = repo.claim_pairing_request(&r2.code, "device-b", "").await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn claim_rejects_expired_code() {
        let db = Arc::new(super::super::db::connect_memory().await.unwrap());
        let repo = PairingRepo::new(db);
        let request = repo
            .create_pairing_request("T1", "U1", "C1", "100.001", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = repo.claim_pairing_request(&request.code, "device-a", "").await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
