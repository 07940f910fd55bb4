//! Slack Web API adapter.
//!
//! Required bot scopes: `chat:write`, `channels:read`, `groups:read`.

use async_trait::async_trait;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::RetryConfig;
use crate::errors::AppError;
use crate::jobs::reconcile::ChannelDirectory;
use crate::models::channel::{Channel, PostMessageResult, SlashCommand};

pub mod signature;

const PAGINATION_LIMIT: &str = "200";

#[derive(Clone)]
pub struct SlackClient {
    client: ClientWithMiddleware,
    token: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct ConversationsListResponse {
    ok: bool,
    #[serde(default)]
    error: String,
    #[serde(default)]
    channels: Vec<Channel>,
    #[serde(default)]
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
}

#[derive(Debug, Deserialize)]
struct ConversationInfoResponse {
    ok: bool,
    #[serde(default)]
    error: String,
    channel: Option<ConversationInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConversationInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_channel: bool,
    #[serde(default)]
    pub is_group: bool,
}

/// Slash command fields as posted by Slack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlashCommandForm {
    pub command: String,
    pub channel_id: String,
    pub channel_name: String,
    pub text: String,
}

impl SlashCommandForm {
    /// Parses the `application/x-www-form-urlencoded` body. Missing fields
    /// are left empty.
    pub fn parse(body: &[u8]) -> Self {
        let mut form = Self::default();
        for (key, value) in url::form_urlencoded::parse(body) {
            match key.as_ref() {
                "command" => form.command = value.into_owned(),
                "channel_id" => form.channel_id = value.into_owned(),
                "channel_name" => form.channel_name = value.into_owned(),
                "text" => form.text = value.into_owned(),
                _ => {}
            }
        }
        form
    }
}

impl SlackClient {
    pub fn new(token: &str, base_url: &str, retry: &RetryConfig) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(retry.read_timeout)
            .build()?;

        let mut builder = ClientBuilder::new(reqwest_client);
        if retry.max_retries > 0 {
            let retry_policy = ExponentialBackoff::builder()
                .retry_bounds(retry.wait_min, retry.wait_max)
                .build_with_max_retries(retry.max_retries);
            builder = builder.with(RetryTransientMiddleware::new_with_policy(retry_policy));
        }
        let client = builder.build();

        Ok(Self {
            client,
            token: token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    /// https://api.slack.com/methods/chat.postMessage
    ///
    /// `channel` may be a channel id or name.
    pub async fn post_message(
        &self,
        channel: &str,
        channel_name: &str,
        mut payload: Map<String, Value>,
    ) -> Result<PostMessageResult, AppError> {
        payload.insert("channel".to_string(), Value::String(channel.to_string()));
        let body = serde_json::to_vec(&payload)
            .map_err(|e| AppError::Slack(format!("encoding chat.postMessage payload failed: {}", e)))?;

        let resp = self
            .client
            .post(self.endpoint("chat.postMessage"))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(body)
            .send()
            .await;

        let resp = match resp {
            Ok(resp) => resp,
            Err(e) if is_timeout(&e) => {
                tracing::info!(error = %e, "slack API timeout");
                return Ok(PostMessageResult::Timeout);
            }
            Err(e) => {
                return Err(AppError::Slack(format!("chat.postMessage request failed: {}", e)));
            }
        };

        let status = resp.status();
        let body = match resp.text().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return Ok(PostMessageResult::Timeout),
            Err(e) => {
                return Err(AppError::Slack(format!("reading chat.postMessage body failed: {}", e)));
            }
        };

        if status != reqwest::StatusCode::OK {
            return Ok(PostMessageResult::ServerFailure {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: PostMessageResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::Slack(format!("unexpected chat.postMessage body: {}", e)))?;
        if !parsed.ok {
            return Ok(PostMessageResult::Rejected {
                reason: parsed.error,
                channel_id: channel.to_string(),
                channel_name: channel_name.to_string(),
            });
        }

        Ok(PostMessageResult::Ok)
    }

    /// https://api.slack.com/methods/conversations.list
    ///
    /// Public and private channels, archived ones included.
    pub async fn list_channels(&self) -> Result<Vec<Channel>, AppError> {
        let mut channels = Vec::new();
        let mut cursor = String::new();

        loop {
            let resp: ConversationsListResponse = self
                .get(
                    "conversations.list",
                    &[
                        ("cursor", cursor.as_str()),
                        ("exclude_archived", "false"),
                        ("limit", PAGINATION_LIMIT),
                        ("types", "public_channel,private_channel"),
                    ],
                )
                .await?;
            if !resp.ok {
                return Err(AppError::Slack(format!("conversations.list failed: {}", resp.error)));
            }

            channels.extend(resp.channels);
            cursor = resp
                .response_metadata
                .map(|m| m.next_cursor)
                .unwrap_or_default();
            if cursor.is_empty() {
                break;
            }
        }

        tracing::debug!(size = channels.len(), "listed slack channels");
        Ok(channels)
    }

    /// https://api.slack.com/methods/conversations.info
    ///
    /// `None` when the bot cannot see the conversation.
    pub async fn conversation_info(
        &self,
        channel_id: &str,
    ) -> Result<Option<ConversationInfo>, AppError> {
        let resp: ConversationInfoResponse = self
            .get("conversations.info", &[("channel", channel_id)])
            .await?;
        if !resp.ok {
            if resp.error == "channel_not_found" {
                return Ok(None);
            }
            return Err(AppError::Slack(format!("conversations.info failed: {}", resp.error)));
        }
        resp.channel
            .map(Some)
            .ok_or_else(|| AppError::Slack("conversations.info returned no channel".into()))
    }

    /// Resolves the channel name the command was sent from.
    ///
    /// Slash command payloads from legacy private groups carry a stale
    /// channel name, so the name is always looked up. Conversations the bot
    /// can't see and non-channel conversations (DMs) are unsupported.
    pub async fn resolve_command(&self, form: SlashCommandForm) -> Result<SlashCommand, AppError> {
        let info = self.conversation_info(&form.channel_id).await?;
        let (channel_name, supported) = match info {
            Some(info) => (info.name, info.is_channel || info.is_group),
            None => (form.channel_name.clone(), false),
        };
        Ok(SlashCommand {
            command: form.command,
            channel_id: form.channel_id,
            channel_name,
            original_channel_name: form.channel_name,
            text: form.text,
            supported,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, &str)],
    ) -> Result<T, AppError> {
        let resp = self
            .client
            .get(self.endpoint(method))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .map_err(|e| AppError::Slack(format!("{} request failed: {}", method, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Slack(format!(
                "{} returned error: status={}, body={}",
                method, status, body
            )));
        }

        resp.json::<T>()
            .await
            .map_err(|e| AppError::Slack(format!("unexpected {} body: {}", method, e)))
    }
}

/// Timeouts surface either directly or, after retries, wrapped by the retry
/// middleware with the last attempt's error as source.
fn is_timeout(err: &reqwest_middleware::Error) -> bool {
    match err {
        reqwest_middleware::Error::Reqwest(e) => e.is_timeout(),
        reqwest_middleware::Error::Middleware(e) => e.chain().any(|cause| {
            cause
                .downcast_ref::<reqwest::Error>()
                .is_some_and(reqwest::Error::is_timeout)
                || cause
                    .downcast_ref::<reqwest_middleware::Error>()
                    .is_some_and(is_timeout)
        }),
    }
}

#[async_trait]
impl ChannelDirectory for SlackClient {
    async fn list_channels(&self) -> Result<Vec<Channel>, AppError> {
        SlackClient::list_channels(self).await
    }

    async fn post_message(
        &self,
        channel: &str,
        channel_name: &str,
        payload: Map<String, Value>,
    ) -> Result<PostMessageResult, AppError> {
        SlackClient::post_message(self, channel, channel_name, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn no_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 0,
            wait_min: Duration::from_millis(1),
            wait_max: Duration::from_millis(1),
            read_timeout: Duration::from_millis(500),
        }
    }

    fn client(server: &MockServer) -> SlackClient {
        SlackClient::new("xoxb-test", &server.uri(), &no_retry()).unwrap()
    }

    fn text(msg: &str) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("text".into(), json!(msg));
        payload
    }

    #[tokio::test]
    async fn test_post_message_ok() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .and(header("authorization", "Bearer xoxb-test"))
            .and(body_partial_json(json!({"channel": "C1", "text": "hi"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let result = client(&server).post_message("C1", "general", text("hi")).await.unwrap();
        assert_eq!(result, PostMessageResult::Ok);
    }

    #[tokio::test]
    async fn test_post_message_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": false, "error": "channel_not_found"})),
            )
            .mount(&server)
            .await;

        let result = client(&server).post_message("C1", "secret", text("hi")).await.unwrap();
        assert_eq!(
            result,
            PostMessageResult::Rejected {
                reason: "channel_not_found".into(),
                channel_id: "C1".into(),
                channel_name: "secret".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_post_message_server_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let result = client(&server).post_message("C1", "general", text("hi")).await.unwrap();
        assert_eq!(
            result,
            PostMessageResult::ServerFailure {
                status: 503,
                body: "down".into()
            }
        );
    }

    #[tokio::test]
    async fn test_post_message_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat.postMessage"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": true}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let result = client(&server).post_message("C1", "general", text("hi")).await.unwrap();
        assert_eq!(result, PostMessageResult::Timeout);
    }

    #[tokio::test]
    async fn test_list_channels_follows_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations.list"))
            .and(query_param("cursor", ""))
            .and(query_param("exclude_archived", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "channels": [{"id": "C1", "name": "general", "is_archived": false}],
                "response_metadata": {"next_cursor": "page2"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/conversations.list"))
            .and(query_param("cursor", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "channels": [{"id": "C2", "name": "old", "is_archived": true}],
                "response_metadata": {"next_cursor": ""}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let channels = client(&server).list_channels().await.unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[1].id, "C2");
        assert!(channels[1].is_archived);
    }

    #[tokio::test]
    async fn test_list_channels_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations.list"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"ok": false, "error": "missing_scope"})),
            )
            .mount(&server)
            .await;

        let err = client(&server).list_channels().await.unwrap_err();
        assert!(err.to_string().contains("missing_scope"));
    }

    #[tokio::test]
    async fn test_resolve_command() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations.info"))
            .and(query_param("channel", "G1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "channel": {"id": "G1", "name": "real-name", "is_channel": false, "is_group": true}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/conversations.info"))
            .and(query_param("channel", "C404"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"ok": false, "error": "channel_not_found"})),
            )
            .mount(&server)
            .await;
        let slack = client(&server);

        let form = SlashCommandForm {
            command: "/hookrelay-show".into(),
            channel_id: "G1".into(),
            channel_name: "privategroup".into(),
            text: String::new(),
        };
        let cmd = slack.resolve_command(form.clone()).await.unwrap();
        assert_eq!(cmd.channel_name, "real-name");
        assert_eq!(cmd.original_channel_name, "privategroup");
        assert!(cmd.supported);

        let cmd = slack
            .resolve_command(SlashCommandForm {
                channel_id: "C404".into(),
                ..form
            })
            .await
            .unwrap();
        assert_eq!(cmd.channel_name, "privategroup");
        assert!(!cmd.supported);
    }

    #[test]
    fn test_parse_slash_command_form() {
        let form = SlashCommandForm::parse(
            b"token=x&channel_id=C1&channel_name=general&command=%2Fhookrelay-revoke&text=abc+def",
        );
        assert_eq!(form.command, "/hookrelay-revoke");
        assert_eq!(form.channel_id, "C1");
        assert_eq!(form.channel_name, "general");
        assert_eq!(form.text, "abc def");
    }
}
