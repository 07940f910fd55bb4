//! Slack request signing, `v0` scheme.
//!
//! `x-slack-signature` is `v0=` followed by the hex HMAC-SHA256 of
//! `v0:<x-slack-request-timestamp>:<raw body>` keyed by the signing secret.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const VERSION: &str = "v0";
const SIGNATURE_HEADER: &str = "x-slack-signature";
const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Requests older or newer than this are rejected as replays.
const MAX_CLOCK_SKEW_SECS: i64 = 60 * 5;

pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(format!("{}:{}:", VERSION, timestamp).as_bytes());
    mac.update(body);
    Some(format!("{}={}", VERSION, hex::encode(mac.finalize().into_bytes())))
}

/// `now` is unix seconds.
pub fn verify_slack_request(secret: &str, headers: &HeaderMap, body: &[u8], now: i64) -> bool {
    let Some(given) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        tracing::info!("missing x-slack-signature header");
        return false;
    };
    let Some(raw_ts) = headers.get(TIMESTAMP_HEADER).and_then(|v| v.to_str().ok()) else {
        tracing::info!("missing x-slack-request-timestamp header");
        return false;
    };
    let timestamp: i64 = match raw_ts.parse() {
        Ok(ts) => ts,
        Err(e) => {
            tracing::info!(error = %e, timestamp = raw_ts, "failed to parse timestamp");
            return false;
        }
    };

    let diff = now.saturating_sub(timestamp).saturating_abs();
    if diff > MAX_CLOCK_SKEW_SECS {
        tracing::info!(now, timestamp, diff, "expired timestamp given");
        return false;
    }

    let Some(expected) = sign(secret, timestamp, body) else {
        return false;
    };
    let ok: bool = given.as_bytes().ct_eq(expected.as_bytes()).into();
    if !ok {
        tracing::info!("signature verification failed");
    }
    ok
}
