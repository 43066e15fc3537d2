//! SMS sender: Twilio-compatible outbound gateway.
//!
//! `POST {base_url}/Accounts/{sid}/Messages.json` with form fields
//! `To`, `From`, `Body` and basic auth. The gateway's `sid` is the
//! provider message id.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;

use crate::channels::{
    ChannelSender, DispatchRequest, SendProgress, config_str, rejection, transport_error,
};
use crate::config::SmsGatewayConfig;
use crate::error::DispatchError;
use crate::pipeline::types::ChannelType;

/// Gateway statuses that mean the message will never arrive.
const UNDELIVERED_STATUSES: &[&str] = &["failed", "undelivered", "canceled"];

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    sid: Option<String>,
    status: Option<String>,
    error_code: Option<serde_json::Value>,
    error_message: Option<String>,
}

pub struct SmsSender {
    client: reqwest::Client,
    config: SmsGatewayConfig,
}

impl SmsSender {
    pub fn new(client: reqwest::Client, config: SmsGatewayConfig) -> Self {
        Self { client, config }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl ChannelSender for SmsSender {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Sms
    }

    async fn send(
        &self,
        request: &DispatchRequest<'_>,
        _progress: &SendProgress,
    ) -> Result<String, DispatchError> {
        let to = config_str(&request.channel.config, "phone_number")?;
        if !is_plausible_number(to) {
            return Err(DispatchError::ConfigInvalid(format!(
                "config.phone_number '{to}' is not a phone number"
            )));
        }

        let form = [
            ("To", to),
            ("From", self.config.from_number.as_str()),
            ("Body", request.text),
        ];

        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }

        let status = resp.status().as_u16();
        let body: GatewayResponse = resp.json().await.map_err(|e| {
            DispatchError::ProviderRejected {
                status,
                reason: format!("unreadable gateway response: {e}"),
                permanent: false,
            }
        })?;

        if let Some(ref state) = body.status {
            if UNDELIVERED_STATUSES.contains(&state.as_str()) {
                let code = body
                    .error_code
                    .as_ref()
                    .map(|c| format!(" (code {c})"))
                    .unwrap_or_default();
                return Err(DispatchError::ProviderRejected {
                    status,
                    reason: format!(
                        "gateway reported {state}{code}: {}",
                        body.error_message.as_deref().unwrap_or("no detail")
                    ),
                    permanent: true,
                });
            }
        }

        body.sid.filter(|s| !s.is_empty()).ok_or_else(|| {
            DispatchError::ProviderRejected {
                status,
                reason: "gateway response missing sid".into(),
                permanent: false,
            }
        })
    }
}

/// E.164-ish: optional leading `+`, then 5 to 15 digits.
fn is_plausible_number(s: &str) -> bool {
    let digits = s.strip_prefix('+').unwrap_or(s);
    (5..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}
