use serde::{Deserialize, Serialize};

/// A conversation as listed by the Slack directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_archived: bool,
}

/// Outcome of a `chat.postMessage` call.
///
/// Transport errors that are not timeouts are reported as `Err` by the
/// client instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostMessageResult {
    Ok,
    Timeout,
    /// Non-200 HTTP status from the API.
    ServerFailure { status: u16, body: String },
    /// HTTP 200 with `"ok": false`, e.g. `channel_not_found` when the bot
    /// is not invited to a private channel.
    Rejected {
        reason: String,
        channel_id: String,
        channel_name: String,
    },
}

/// A slash command invocation after channel name resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashCommand {
    pub command: String,
    pub channel_id: String,
    /// Name resolved through `conversations.info`.
    pub channel_name: String,
    /// Name as sent in the command payload. Stale for legacy private groups.
    pub original_channel_name: String,
    pub text: String,
    pub supported: bool,
}
