//! `POST /slash/`: token management through Slack slash commands.
//!
//! Every reply is an `in_channel` message so the whole channel sees which
//! tokens were issued or revoked.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap},
    Json,
};
use chrono::SecondsFormat;
use serde::Serialize;

use crate::errors::AppError;
use crate::metrics;
use crate::models::channel::SlashCommand;
use crate::service::token::{RegenerateResult, RevokeRenamedResult, RevokeResult};
use crate::slack::{signature, SlashCommandForm};
use crate::AppState;

pub const CMD_SHOW: &str = "/hookrelay-show";
pub const CMD_GENERATE: &str = "/hookrelay-generate";
pub const CMD_REGENERATE: &str = "/hookrelay-regenerate";
pub const CMD_REVOKE: &str = "/hookrelay-revoke";
pub const CMD_REVOKE_RENAMED: &str = "/hookrelay-revoke-renamed";

const TRY_AGAIN: &str =
    "Another token operation for this channel finished at the same time. Check with `/hookrelay-show` and try again.\n";

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub text: String,
    pub response_type: &'static str,
}

fn in_channel(text: impl Into<String>) -> Json<CommandResponse> {
    Json(CommandResponse {
        text: text.into(),
        response_type: "in_channel",
    })
}

pub async fn slash_command(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CommandResponse>, AppError> {
    let now = chrono::Utc::now().timestamp();
    if !signature::verify_slack_request(&state.config.slack_signing_secret, &headers, &body, now) {
        return Err(AppError::InvalidSignature);
    }

    let form = SlashCommandForm::parse(&body);
    let cmd = state.slack.resolve_command(form).await?;
    tracing::info!(
        command = %cmd.command,
        channel_id = %cmd.channel_id,
        channel_name = %cmd.channel_name,
        original_channel_name = %cmd.original_channel_name,
        supported = cmd.supported,
        "command given"
    );
    metrics::record_command(&cmd.command);

    if !cmd.supported {
        return Ok(in_channel(
            "hookrelay only supports public/private channels. If this is a private channel, invite the hookrelay bot.\n",
        ));
    }

    let domain = state
        .config
        .custom_domain
        .clone()
        .or_else(|| {
            headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .unwrap_or_else(|| "localhost".to_string());

    let result = match cmd.command.as_str() {
        CMD_SHOW => show(&state, &cmd, &domain).await,
        CMD_GENERATE => generate(&state, &cmd, &domain).await,
        CMD_REGENERATE => regenerate(&state, &cmd, &domain).await,
        CMD_REVOKE => revoke(&state, &cmd).await,
        CMD_REVOKE_RENAMED => revoke_renamed(&state, &cmd).await,
        other => {
            tracing::info!(command = other, "missing command given");
            Ok("Missing command.\n".to_string())
        }
    };

    match result {
        Ok(msg) => Ok(in_channel(msg)),
        Err(e) if e.is_conflict() => {
            tracing::info!(error = %e, channel_name = %cmd.channel_name, "concurrent token write, asking user to retry");
            Ok(in_channel(TRY_AGAIN))
        }
        Err(e) => Err(e),
    }
}

pub fn build_webhook_url(domain: &str, channel_name: &str, token: &str) -> String {
    format!("https://{}/p/{}/{}/", domain, channel_name, token)
}

async fn show(state: &AppState, cmd: &SlashCommand, domain: &str) -> Result<String, AppError> {
    let entries = state.tokens.get_tokens(&cmd.channel_name).await?;
    if entries.is_empty() {
        return Ok("No token and url generated for this channel.\n".to_string());
    }

    let lines: Vec<String> = entries
        .iter()
        .map(|entry| {
            format!(
                "- {} (v{}, {}): {}",
                entry.token,
                entry.version,
                entry.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                build_webhook_url(domain, &cmd.channel_name, &entry.token)
            )
        })
        .collect();
    Ok(format!("Available tokens for this channel:\n{}\n", lines.join("\n")))
}

async fn generate(state: &AppState, cmd: &SlashCommand, domain: &str) -> Result<String, AppError> {
    let res = state
        .tokens
        .generate_and_save_token(&cmd.channel_id, &cmd.channel_name)
        .await?;
    if !res.is_generated {
        return Ok(format!(
            "Token already generated. To check generated token, use `{}`. To generate another token, use `{}`.\n",
            CMD_SHOW, CMD_REGENERATE
        ));
    }

    let url = build_webhook_url(domain, &cmd.channel_name, &res.token);
    Ok(format!("Token generated: {}, {}\n", res.token, url))
}

async fn regenerate(state: &AppState, cmd: &SlashCommand, domain: &str) -> Result<String, AppError> {
    let res = state
        .tokens
        .regenerate_token(&cmd.channel_id, &cmd.channel_name)
        .await?;
    Ok(match res {
        RegenerateResult::NoTokenFound => format!(
            "No token has been generated for this channel. Use `{}` to generate a token.\n",
            CMD_GENERATE
        ),
        RegenerateResult::TooManyToken => format!(
            "Two tokens have been generated for this channel. Ensure the old token is not used, then revoke it with `{}`.\n",
            CMD_REVOKE
        ),
        RegenerateResult::Generated { token } => format!(
            "Another token generated for this channel: {}\n",
            build_webhook_url(domain, &cmd.channel_name, &token)
        ),
    })
}

async fn revoke(state: &AppState, cmd: &SlashCommand) -> Result<String, AppError> {
    let token = cmd.text.trim();
    let res = state.tokens.revoke_token(&cmd.channel_name, token).await?;
    Ok(match res {
        RevokeResult::NotFound => format!(
            "No pair found, check the token: channel_name={}, token={}\n",
            cmd.channel_name, token
        ),
        RevokeResult::Revoked => format!(
            "Token revoked: channel_name={}, token={}\n",
            cmd.channel_name, token
        ),
    })
}

async fn revoke_renamed(state: &AppState, cmd: &SlashCommand) -> Result<String, AppError> {
    let args: Vec<&str> = cmd.text.split_whitespace().collect();
    let [channel_name, token] = args.as_slice() else {
        return Ok(
            "Invalid arguments for the slash command. This command expects `<channel name> <token>` as arguments.\n"
                .to_string(),
        );
    };

    let res = state
        .tokens
        .revoke_renamed_token(&cmd.channel_id, channel_name, token)
        .await?;
    Ok(match res {
        RevokeRenamedResult::NotFound => format!(
            "No pair found, check the token: channel_name={}, token={}\n",
            channel_name, token
        ),
        RevokeRenamedResult::ChannelIdUnmatch { linked_channel_id } => format!(
            "Found pair but the token is still linked to this channel, revoke it from a channel named {} with `{}`: channel_name={}, token={}, linked_channel_id={}, channel_id={}\n",
            channel_name, CMD_REVOKE, channel_name, token, linked_channel_id, cmd.channel_id
        ),
        RevokeRenamedResult::Revoked => format!(
            "Token revoked: old_channel_name={}, token={}\n",
            channel_name, token
        ),
    })
}
