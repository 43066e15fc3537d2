//! Outbound channel senders and the dispatcher that routes to them.
//!
//! Each channel type has one `ChannelSender`. The `Dispatcher` looks the
//! sender up by type and bounds every call with the configured timeout.

pub mod email;
pub mod sms;
pub mod telegram;
pub mod webhook;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::delivery::tracker::{Delivered, DispatchOutcome};
use crate::error::DispatchError;
use crate::pipeline::types::{ChannelType, DestinationChannel, IncomingMessage};

pub use email::EmailSender;
pub use sms::SmsSender;
pub use telegram::TelegramSender;
pub use webhook::WebhookSender;

/// Everything a sender needs for one delivery.
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    pub channel: &'a DestinationChannel,
    /// Rendered text (override template output or the raw body).
    pub text: &'a str,
    pub action_config: &'a serde_json::Value,
    pub message: &'a IncomingMessage,
    pub rule_id: &'a str,
}

/// Parts of one dispatch the provider has already accepted.
///
/// Senders that split a text into several provider calls record each
/// accepted part, so a later failure is not retried from the start.
#[derive(Debug, Default)]
pub struct SendProgress {
    first_id: OnceLock<String>,
    parts: AtomicUsize,
}

impl SendProgress {
    pub fn record(&self, provider_id: &str) {
        let _ = self.first_id.set(provider_id.to_string());
        self.parts.fetch_add(1, Ordering::AcqRel);
    }

    pub fn parts(&self) -> usize {
        self.parts.load(Ordering::Acquire)
    }

    pub fn first_id(&self) -> Option<&str> {
        self.first_id.get().map(String::as_str)
    }
}

/// One implementation per channel type.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    /// Deliver the request. Returns the provider's message id.
    ///
    /// Multi-part senders record every accepted part in `progress`.
    async fn send(
        &self,
        request: &DispatchRequest<'_>,
        progress: &SendProgress,
    ) -> Result<String, DispatchError>;
}

/// Routes requests to the registered sender for their channel type.
pub struct Dispatcher {
    senders: HashMap<ChannelType, Arc<dyn ChannelSender>>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            senders: HashMap::new(),
            timeout,
        }
    }

    /// Register a sender, replacing any previous one for its type.
    pub fn register(&mut self, sender: Arc<dyn ChannelSender>) {
        self.senders.insert(sender.channel_type(), sender);
    }

    pub fn with_sender(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.register(sender);
        self
    }

    /// Build the sender set from configuration. Webhooks need no
    /// credentials; the others are registered only when configured.
    pub fn from_config(config: &RelayConfig) -> Self {
        let client = reqwest::Client::new();
        let mut dispatcher = Self::new(config.delivery.dispatch_timeout);
        dispatcher.register(Arc::new(WebhookSender::new(client.clone())));

        if let Some(ref tg) = config.telegram {
            dispatcher.register(Arc::new(TelegramSender::new(client.clone(), tg.clone())));
        }
        if let Some(ref smtp) = config.smtp {
            dispatcher.register(Arc::new(EmailSender::new(
                smtp.clone(),
                config.delivery.dispatch_timeout,
            )));
        }
        if let Some(ref sms) = config.sms {
            dispatcher.register(Arc::new(SmsSender::new(client, sms.clone())));
        }
        dispatcher
    }

    pub fn supports(&self, channel_type: ChannelType) -> bool {
        self.senders.contains_key(&channel_type)
    }

    /// Send through the channel's sender, bounded by the dispatch timeout.
    ///
    /// A timeout cancels only this call. If some parts already reached the
    /// provider, the failure is reported as a delivery with a note.
    pub async fn dispatch(&self, request: &DispatchRequest<'_>) -> DispatchOutcome {
        let channel_type = request.channel.channel_type;
        let Some(sender) = self.senders.get(&channel_type) else {
            return Err(DispatchError::ConfigInvalid(format!(
                "no sender configured for channel type '{channel_type}'"
            )));
        };

        debug!(
            channel_id = %request.channel.id,
            channel_type = %channel_type,
            message_id = %request.message.id,
            "Dispatching"
        );

        let progress = SendProgress::default();
        let result = match tokio::time::timeout(self.timeout, sender.send(request, &progress)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::elapsed(self.timeout)),
        };

        match result {
            Ok(provider_id) => Ok(Delivered::from(provider_id)),
            Err(err) => match progress.first_id() {
                Some(first_id) => {
                    warn!(
                        channel_id = %request.channel.id,
                        message_id = %request.message.id,
                        parts = progress.parts(),
                        error = %err,
                        "Partial delivery, not retrying"
                    );
                    Ok(Delivered {
                        provider_id: first_id.to_string(),
                        note: Some(format!(
                            "Partially delivered: {} part(s) sent before {err}",
                            progress.parts()
                        )),
                    })
                }
                None => Err(err),
            },
        }
    }
}

// ── Shared helpers ──────────────────────────────────────────────────

/// A required non-empty string from a channel's `config`.
pub(crate) fn config_str<'a>(
    config: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, DispatchError> {
    match config.get(key) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Ok(s.trim()),
        Some(serde_json::Value::String(_)) => Err(DispatchError::ConfigInvalid(format!(
            "config.{key} is empty"
        ))),
        Some(other) => Err(DispatchError::ConfigInvalid(format!(
            "config.{key} must be a string, got {other}"
        ))),
        None => Err(DispatchError::ConfigInvalid(format!(
            "config.{key} is required"
        ))),
    }
}

/// Classify a transport-level reqwest failure.
///
/// Anything that kept the provider from answering (connect, DNS, timeout)
/// counts as a timeout; a request that could not be built is a config error.
pub(crate) fn transport_error(e: reqwest::Error) -> DispatchError {
    if e.is_builder() {
        return DispatchError::ConfigInvalid(format!("invalid request: {e}"));
    }
    if let Some(status) = e.status() {
        return DispatchError::from_status(status.as_u16(), e.to_string());
    }
    DispatchError::Timeout(format!("no response from provider: {e}"))
}

/// Turn a non-2xx response into a rejection, using the body as the reason.
pub(crate) async fn rejection(resp: reqwest::Response) -> DispatchError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let reason = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            ["description", "message", "error"]
                .iter()
                .find_map(|k| v.get(*k).and_then(|d| d.as_str()).map(String::from))
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                status.canonical_reason().unwrap_or("unknown").to_string()
            } else {
                body.chars().take(200).collect()
            }
        });
    DispatchError::from_status(status.as_u16(), reason)
}
