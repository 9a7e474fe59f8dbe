//! Telegram Bot API client used by the bridge polling and reply flows.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::bot_helpers::{
    is_retryable_bot_api_status, is_retryable_transport_error, parse_retry_after, retry_delay,
    truncate_for_error,
};

#[derive(Debug, Clone, Deserialize)]
struct BotApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BotProfile {
    pub(crate) id: i64,
    #[serde(default)]
    pub(crate) username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BotUpdate {
    pub(crate) update_id: i64,
    #[serde(default)]
    pub(crate) message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct IncomingMessage {
    #[serde(default)]
    pub(crate) from: Option<MessageSender>,
    pub(crate) chat: MessageChat,
    #[serde(default)]
    pub(crate) text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MessageSender {
    pub(crate) id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MessageChat {
    pub(crate) id: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Clone)]
pub(crate) struct TelegramApiClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl TelegramApiClient {
    pub(crate) fn new(
        api_base: String,
        bot_token: String,
        request_timeout_ms: u64,
        retry_max_attempts: usize,
        retry_base_delay_ms: u64,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("stash-bot-bridge"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create bot api client")?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.trim().to_string(),
            retry_max_attempts: retry_max_attempts.max(1),
            retry_base_delay_ms: retry_base_delay_ms.max(1),
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Validates the bot token and returns the bot's own profile.
    pub(crate) async fn get_me(&self) -> Result<BotProfile> {
        self.request_json("getMe", || self.http.post(self.endpoint("getMe")))
            .await
    }

    /// Long-polls for updates newer than `offset`.
    ///
    /// The per-request timeout is widened past the long-poll window so the
    /// transport does not cut the poll short.
    pub(crate) async fn get_updates(
        &self,
        offset: i64,
        poll_timeout_s: u64,
    ) -> Result<Vec<BotUpdate>> {
        let payload = json!({
            "offset": offset,
            "timeout": poll_timeout_s,
            "allowed_updates": ["message"],
        });
        self.request_json("getUpdates", || {
            self.http
                .post(self.endpoint("getUpdates"))
                .timeout(Duration::from_secs(poll_timeout_s.saturating_add(10)))
                .json(&payload)
        })
        .await
    }

    /// Sends `text` to `chat_id`, returning the new message id.
    pub(crate) async fn send_message(&self, chat_id: i64, text: &str) -> Result<i64> {
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
        });
        let sent: SentMessage = self
            .request_json("sendMessage", || {
                self.http.post(self.endpoint("sendMessage")).json(&payload)
            })
            .await?;
        Ok(sent.message_id)
    }

    async fn request_json<T, F>(&self, operation: &str, mut builder: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = builder().send().await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    let retry_after = parse_retry_after(response.headers());
                    if status.is_success() {
                        let envelope = response
                            .json::<BotApiEnvelope<T>>()
                            .await
                            .with_context(|| format!("failed to decode bot api {operation}"))?;
                        if !envelope.ok {
                            bail!(
                                "bot api {operation} failed: {}",
                                envelope
                                    .description
                                    .unwrap_or_else(|| "unknown error".to_string())
                            );
                        }
                        return envelope
                            .result
                            .ok_or_else(|| anyhow!("bot api {operation} returned no result"));
                    }

                    let body = response.text().await.unwrap_or_default();
                    if attempt < self.retry_max_attempts
                        && is_retryable_bot_api_status(status.as_u16())
                    {
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }

                    bail!(
                        "bot api {operation} failed with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 800)
                    );
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("bot api {operation} request failed"));
                }
            }
        }
    }
}
