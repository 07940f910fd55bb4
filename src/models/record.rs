use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// A persisted per-channel credential.
///
/// Keyed by `(channel_name, version)`. Records are immutable once written:
/// the only mutation is deletion. `channel_name` is a snapshot of the Slack
/// channel name at creation time and goes stale when the channel is renamed;
/// `channel_id` is the stable identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CredentialRecord {
    pub channel_name: String,
    pub version: i32,
    pub channel_id: String,
    pub token: String,
    /// RFC 3339, UTC, nanosecond precision.
    pub created_at: String,
}

impl CredentialRecord {
    pub fn new(channel_id: &str, channel_name: &str, token: String, version: i32) -> Self {
        Self {
            channel_name: channel_name.to_string(),
            version,
            channel_id: channel_id.to_string(),
            token,
            created_at: current_timestamp(),
        }
    }
}

/// Public view of a stored token, as shown by the `show` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub token: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<&CredentialRecord> for Entry {
    type Error = AppError;

    fn try_from(rec: &CredentialRecord) -> Result<Self, Self::Error> {
        let created_at = parse_timestamp(&rec.created_at).ok_or_else(|| AppError::CorruptedRecord {
            channel_name: rec.channel_name.clone(),
            version: rec.version,
            created_at: rec.created_at.clone(),
        })?;
        Ok(Self {
            token: rec.token.clone(),
            version: rec.version,
            created_at,
        })
    }
}

pub fn current_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
