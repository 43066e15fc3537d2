//! Email sender: SMTP via lettre.
//!
//! lettre's `SmtpTransport` is blocking, so each send runs on the blocking
//! pool. The generated Message-ID doubles as the provider message id.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use uuid::Uuid;

use crate::channels::{ChannelSender, DispatchRequest, SendProgress, config_str};
use crate::config::SmtpConfig;
use crate::error::DispatchError;
use crate::pipeline::types::ChannelType;

pub struct EmailSender {
    config: SmtpConfig,
    timeout: Duration,
}

impl EmailSender {
    pub fn new(config: SmtpConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }

    /// Build the outgoing message and its Message-ID.
    fn build_message(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(Message, String), DispatchError> {
        let from: Mailbox = self.config.from_address.parse().map_err(|e| {
            DispatchError::ConfigInvalid(format!(
                "invalid from address '{}': {e}",
                self.config.from_address
            ))
        })?;
        let to: Mailbox = to
            .parse()
            .map_err(|e| DispatchError::ConfigInvalid(format!("invalid config.email '{to}': {e}")))?;

        let domain = self
            .config
            .from_address
            .rsplit_once('@')
            .map(|(_, d)| d)
            .unwrap_or("sms-relay.local");
        let message_id = format!("<{}@{domain}>", Uuid::new_v4());

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| DispatchError::ConfigInvalid(format!("failed to build email: {e}")))?;

        Ok((email, message_id))
    }

    fn transport(&self) -> Result<SmtpTransport, DispatchError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );
        Ok(SmtpTransport::relay(&self.config.host)
            .map_err(|e| DispatchError::ConfigInvalid(format!("SMTP relay error: {e}")))?
            .port(self.config.port)
            .credentials(creds)
            .timeout(Some(self.timeout))
            .build())
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    async fn send(
        &self,
        request: &DispatchRequest<'_>,
        _progress: &SendProgress,
    ) -> Result<String, DispatchError> {
        let to = config_str(&request.channel.config, "email")?;
        let subject = subject_for(request);
        let (email, message_id) = self.build_message(to, &subject, request.text)?;
        let transport = self.transport()?;

        let result = tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| DispatchError::Timeout(format!("SMTP task aborted: {e}")))?;

        match result {
            Ok(_) => {
                tracing::debug!(to, message_id = %message_id, "Email accepted by relay");
                Ok(message_id)
            }
            Err(e) => Err(classify_smtp_error(&e)),
        }
    }
}

/// `action_config.subject`, else a default naming the sender.
fn subject_for(request: &DispatchRequest<'_>) -> String {
    request
        .action_config
        .get("subject")
        .and_then(|s| s.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("SMS from {}", request.message.from_number))
}

fn classify_smtp_error(e: &lettre::transport::smtp::Error) -> DispatchError {
    let status = e
        .status()
        .and_then(|code| code.to_string().parse::<u16>().ok())
        .unwrap_or(0);
    if e.is_permanent() {
        DispatchError::ProviderRejected {
            status,
            reason: e.to_string(),
            permanent: true,
        }
    } else if e.is_transient() {
        DispatchError::ProviderRejected {
            status,
            reason: e.to_string(),
            permanent: false,
        }
    } else {
        DispatchError::Timeout(format!("SMTP relay did not respond: {e}"))
    }
}
