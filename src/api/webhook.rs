//! `POST /p/<channel_name>/<token>/`: Slack incoming-webhook compatible relay.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::command::CMD_GENERATE;
use crate::errors::AppError;
use crate::metrics;
use crate::models::channel::PostMessageResult;
use crate::service::token::VerifyResult;
use crate::AppState;

static PATH_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/p/([^/]+)/([^/]+)/?$").unwrap());

/// Splits a raw request path into `(channel_name, token)`, percent-decoding
/// each segment after splitting so encoded slashes stay inside a segment.
pub fn parse_path(raw_path: &str) -> Option<(String, String)> {
    let caps = PATH_REGEX.captures(raw_path)?;
    let channel_name = urlencoding::decode(&caps[1]).ok()?.into_owned();
    let token = urlencoding::decode(&caps[2]).ok()?.into_owned();
    Some((channel_name, token))
}

/// Path as safe to log: the token segment is replaced.
pub fn mask_path(raw_path: &str) -> String {
    match PATH_REGEX.captures(raw_path) {
        Some(caps) => format!("/p/{}/****/", &caps[1]),
        None if raw_path.starts_with("/p/") => "/p/****".to_string(),
        None => raw_path.to_string(),
    }
}

/// Legacy Slack webhooks accept a JSON body under any content type, and a
/// form body whose `payload` field holds the JSON.
pub fn parse_request_body(headers: &HeaderMap, body: &[u8]) -> Result<Map<String, Value>, String> {
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().eq_ignore_ascii_case("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    let json_bytes: Vec<u8> = if is_form {
        let values: Vec<String> = url::form_urlencoded::parse(body)
            .filter(|(key, _)| key == "payload")
            .map(|(_, value)| value.into_owned())
            .collect();
        match values.len() {
            // Raw JSON sent with a form content type.
            0 => body.to_vec(),
            1 => values.into_iter().next().unwrap_or_default().into_bytes(),
            n => return Err(format!("the `payload` field must be a single value: len={}", n)),
        }
    } else {
        body.to_vec()
    };

    serde_json::from_slice(&json_bytes).map_err(|e| format!("failed to unmarshal JSON: {}", e))
}

fn text(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

pub async fn relay(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let Some((channel_name, token)) = parse_path(uri.path()) else {
        tracing::info!(path = %mask_path(uri.path()), "invalid request path given");
        metrics::record_webhook("invalid_path");
        return Ok(text(StatusCode::BAD_REQUEST, "Invalid request path\n"));
    };

    let (channel_id, channel_name) = match state.tokens.verify_token(&channel_name, &token).await? {
        VerifyResult::NotFound => {
            tracing::info!(%channel_name, "no token generated, response not found");
            metrics::record_webhook("not_found");
            return Ok(text(
                StatusCode::NOT_FOUND,
                format!(
                    "No token generated for {}, generate token with `{}` slash command.\n",
                    channel_name, CMD_GENERATE
                ),
            ));
        }
        VerifyResult::Unmatch => {
            tracing::info!(%channel_name, "invalid token given, response unauthorized");
            metrics::record_webhook("unmatch");
            return Ok(text(
                StatusCode::UNAUTHORIZED,
                "Invalid token given. Check generated URL.\n",
            ));
        }
        VerifyResult::Matched {
            channel_id,
            channel_name,
        } => (channel_id, channel_name),
    };

    let payload = match parse_request_body(&headers, &body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::info!(error = %e, body_size = body.len(), "invalid body given, response bad request");
            metrics::record_webhook("bad_body");
            return Ok(text(
                StatusCode::BAD_REQUEST,
                "Invalid body given. JSON Unmarshal failed.\n",
            ));
        }
    };

    let result = state
        .slack
        .post_message(&channel_id, &channel_name, payload)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, %channel_id, %channel_name, body_size = body.len(), "post message failed");
            metrics::record_webhook("error");
            e
        })?;

    let resp = match result {
        PostMessageResult::Ok => {
            tracing::info!(%channel_id, %channel_name, "post message succeeded");
            metrics::record_webhook("ok");
            text(StatusCode::OK, "ok.\n")
        }
        PostMessageResult::Timeout => {
            tracing::warn!(%channel_id, %channel_name, "post message timeout");
            metrics::record_webhook("timeout");
            text(StatusCode::GATEWAY_TIMEOUT, "Slack API timeout.\n")
        }
        PostMessageResult::ServerFailure { status, body } => {
            metrics::record_webhook("upstream_error");
            let msg = format!("Slack API error: status={}, body={}\n", status, body);
            match StatusCode::from_u16(status) {
                Ok(code) if code.is_server_error() => {
                    tracing::warn!(status, %body, "post message server error");
                    text(StatusCode::BAD_GATEWAY, msg)
                }
                Ok(code) if code.is_client_error() => {
                    tracing::info!(status, %body, "post message client error");
                    text(code, msg)
                }
                _ => {
                    return Err(AppError::Slack(format!(
                        "unexpected status code from Slack API: status={}, body={}",
                        status, body
                    )))
                }
            }
        }
        PostMessageResult::Rejected {
            reason,
            channel_id,
            channel_name,
        } => {
            metrics::record_webhook("rejected");
            if reason == "channel_not_found" {
                tracing::info!(%channel_id, %channel_name, %reason, "bot is not in the channel, response bad request");
                text(
                    StatusCode::BAD_REQUEST,
                    format!(
                        "invite bot to the channel: channel_name={}, channel_id={}, reason={}\n",
                        channel_name, channel_id, reason
                    ),
                )
            } else {
                tracing::warn!(%channel_id, %channel_name, %reason, "slack API rejected the message");
                text(
                    StatusCode::BAD_REQUEST,
                    format!("Slack API responses error: reason={}\n", reason),
                )
            }
        }
    };
    Ok(resp)
}
