//! Telegram sender: Bot API `sendMessage`.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{Value, json};

use crate::channels::{ChannelSender, DispatchRequest, SendProgress, rejection, transport_error};
use crate::config::TelegramConfig;
use crate::error::DispatchError;
use crate::pipeline::types::ChannelType;

/// Maximum message length for Telegram's sendMessage API (in characters).
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

pub struct TelegramSender {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramSender {
    pub fn new(client: reqwest::Client, config: TelegramConfig) -> Self {
        Self { client, config }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token.expose_secret()
        )
    }

    /// Send one chunk; returns Telegram's message id.
    async fn send_chunk(
        &self,
        chat_id: &Value,
        text: &str,
        silent: bool,
    ) -> Result<String, DispatchError> {
        let body = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_notification": silent,
        });

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }

        let status = resp.status().as_u16();
        let payload: Value = resp.json().await.map_err(|e| DispatchError::ProviderRejected {
            status,
            reason: format!("unreadable sendMessage response: {e}"),
            permanent: false,
        })?;

        if payload["ok"].as_bool() != Some(true) {
            let reason = payload["description"]
                .as_str()
                .unwrap_or("sendMessage returned ok=false")
                .to_string();
            return Err(DispatchError::from_status(status, reason));
        }

        payload["result"]["message_id"]
            .as_i64()
            .map(|id| id.to_string())
            .ok_or_else(|| DispatchError::ProviderRejected {
                status,
                reason: "sendMessage response missing result.message_id".into(),
                permanent: false,
            })
    }
}

#[async_trait]
impl ChannelSender for TelegramSender {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Telegram
    }

    /// Long texts go out as several messages; the first one's id is reported.
    async fn send(
        &self,
        request: &DispatchRequest<'_>,
        progress: &SendProgress,
    ) -> Result<String, DispatchError> {
        let chat_id = chat_id(&request.channel.config)?;
        let silent = request.action_config["mute"].as_bool().unwrap_or(false);

        let mut first_id = None;
        for chunk in split_message(request.text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            let id = self.send_chunk(&chat_id, &chunk, silent).await?;
            progress.record(&id);
            first_id.get_or_insert(id);
        }

        first_id.ok_or_else(|| DispatchError::ConfigInvalid("nothing to send".into()))
    }
}

/// `config.chat_id` as either a numeric id or a non-empty string (`@channel`).
fn chat_id(config: &Value) -> Result<Value, DispatchError> {
    match config.get("chat_id") {
        Some(Value::Number(n)) if n.is_i64() => Ok(Value::Number(n.clone())),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(Value::String(s.trim().to_string())),
        Some(other) => Err(DispatchError::ConfigInvalid(format!(
            "config.chat_id must be an integer or string, got {other}"
        ))),
        None => Err(DispatchError::ConfigInvalid("config.chat_id is required".into())),
    }
}

/// Split a message into chunks of at most `max_chars` characters,
/// preferring newline then space boundaries.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let limit = match remaining.char_indices().nth(max_chars) {
            Some((byte_idx, _)) => byte_idx,
            None => {
                chunks.push(remaining.to_string());
                break;
            }
        };

        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
