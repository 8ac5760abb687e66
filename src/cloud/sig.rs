//! Slack Events API request-signature verification.
//!
//! Distinct from Socket Mode (used elsewhere via `slack-morphism` for
//! outbound `chat.postMessage`): the HTTP Events API carries a per-request
//! HMAC-SHA256 signature that must be checked before trusting the body.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

const CLOCK_SKEW_SECONDS: i64 = 5 * 60;

/// Verify a Slack `X-Slack-Signature` header against the raw request body.
///
/// `timestamp` is the raw `X-Slack-Request-Timestamp` header value,
/// `signature` is the raw `X-Slack-Signature` header value (`v0=<hex>`),
/// and `now` is the verifier's current time (injected so tests can control
/// the clock window).
///
/// # Errors
///
/// Returns `AppError::Slack` if the timestamp is malformed, outside the
/// clock window, or the computed signature does not match.
pub fn verify(
    signing_secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| AppError::Slack("invalid X-Slack-Request-Timestamp".into()))?;

    let delta = (now.timestamp() - ts).abs();
    if delta > CLOCK_SKEW_SECONDS {
        return Err(AppError::Slack("request timestamp outside clock window".into()));
    }

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .map_err(|e| AppError::Slack(format!("invalid signing secret: {e}")))?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    let expected = format!("v0={}", hex::encode(mac.finalize().into_bytes()));

    if !crate::crypto::constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
        return Err(AppError::Slack("signature mismatch".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sign(secret: &str, ts: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(b"v0:");
        mac.update(ts.as_bytes());
        mac.update(b":");
        mac.update(body);
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_a_valid_signature_within_the_clock_window() {
        let now = chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let ts = "1700000000";
        let body = br#"{"type":"event_callback"}"#;
        let sig = sign("shh", ts, body);
        assert!(verify("shh", ts, body, &sig, now).is_ok());
    }

    #[test]
    fn rejects_a_stale_timestamp() {
        let now = chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let ts = "1699999000";
        let body = b"{}";
        let sig = sign("shh", ts, body);
        assert!(verify("shh", ts, body, &sig, now).is_err());
    }

    #[test]
    fn rejects_a_tampered_body() {
        let now = chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let ts = "1700000000";
        let sig = sign("shh", ts, b"original");
        assert!(verify("shh", ts, b"tampered", &sig, now).is_err());
    }

    #[test]
    fn rejects_wrong_secret() {
        let now = chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let ts = "1700000000";
        let body = b"payload";
        let sig = sign("shh", ts, body);
        assert!(verify("different", ts, body, &sig, now).is_err());
    }
}
