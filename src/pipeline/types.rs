//! Shared types for the forwarding pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Inbound message ─────────────────────────────────────────────────

/// An SMS (or any text) captured by an endpoint and accepted for forwarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: String,
    /// The SIM/gateway endpoint that reported the message.
    pub endpoint_id: String,
    pub from_number: String,
    pub to_number: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    /// Whatever extra fields the gateway sent (signal, voltage, ...).
    pub raw_payload: serde_json::Value,
    /// Set once every attempt for this message is terminal.
    pub processed: bool,
}

/// Payload accepted by ingestion.
#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    pub endpoint_id: String,
    pub from_number: String,
    pub to_number: String,
    pub body: String,
    #[serde(default = "empty_object")]
    pub raw_payload: serde_json::Value,
}

// ── Rules ───────────────────────────────────────────────────────────

/// Ordered predicate + forwarding binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRule {
    pub id: String,
    pub name: String,
    pub is_enabled: bool,
    /// Lower value is evaluated first.
    pub priority: i64,
    /// Predicate object, e.g. `{"contains": "ALERT"}`. `{}` matches everything.
    pub filters: serde_json::Value,
    /// Halt evaluation of lower-priority rules once this rule matches.
    pub stop_processing: bool,
}

/// Create/update body for a rule.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleInput {
    pub name: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "empty_object")]
    pub filters: serde_json::Value,
    #[serde(default)]
    pub stop_processing: bool,
}

impl RuleInput {
    pub fn into_rule(self, id: String) -> ForwardRule {
        ForwardRule {
            id,
            name: self.name,
            is_enabled: self.is_enabled,
            priority: self.priority,
            filters: self.filters,
            stop_processing: self.stop_processing,
        }
    }
}

// ── Channels ────────────────────────────────────────────────────────

/// Kind of destination a channel delivers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Sms,
    Telegram,
    Webhook,
    Email,
}

impl ChannelType {
    /// The string tag stored in the DB `type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Telegram => "telegram",
            Self::Webhook => "webhook",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(Self::Sms),
            "telegram" => Ok(Self::Telegram),
            "webhook" => Ok(Self::Webhook),
            "email" => Ok(Self::Email),
            other => Err(format!("unknown channel type '{other}'")),
        }
    }
}

/// An external system capable of receiving a rendered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationChannel {
    pub id: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub name: String,
    pub is_enabled: bool,
    /// Type-specific settings: `chat_id`, `url`, `email`, `phone_number`.
    pub config: serde_json::Value,
}

/// Create/update body for a channel.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInput {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

impl ChannelInput {
    pub fn into_channel(self, id: String) -> DestinationChannel {
        DestinationChannel {
            id,
            channel_type: self.channel_type,
            name: self.name,
            is_enabled: self.is_enabled,
            config: self.config,
        }
    }
}

// ── Rule → channel bindings ─────────────────────────────────────────

/// Many-to-many join between a rule and a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDestination {
    pub id: String,
    pub rule_id: String,
    pub channel_id: String,
    pub is_enabled: bool,
    /// Replaces the message body for this pairing when non-empty.
    pub override_text_template: Option<String>,
    /// Channel-call tuning (e.g. `{"mute": true}`).
    pub action_config: serde_json::Value,
}

/// Create/update body for a rule destination.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleDestinationInput {
    pub rule_id: String,
    pub channel_id: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub override_text_template: Option<String>,
    #[serde(default = "empty_object")]
    pub action_config: serde_json::Value,
}

impl RuleDestinationInput {
    pub fn into_destination(self, id: String) -> RuleDestination {
        RuleDestination {
            id,
            rule_id: self.rule_id,
            channel_id: self.channel_id,
            is_enabled: self.is_enabled,
            override_text_template: self.override_text_template,
            action_config: self.action_config,
        }
    }
}

// ── Delivery attempts ───────────────────────────────────────────────

/// Lifecycle state of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown delivery status '{other}'")),
        }
    }
}

/// One (message, rule, channel) dispatch lifecycle, including retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: String,
    pub message_id: String,
    pub rule_id: String,
    pub channel_id: String,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// When a dispatch is next owed; `None` once terminal.
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub lease_owner: Option<String>,
    #[serde(skip)]
    pub lease_until: Option<DateTime<Utc>>,
    /// Bumped on every claim; guards against double claims.
    #[serde(skip)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Terminal attempts are never dispatched again.
    pub fn is_terminal(&self) -> bool {
        self.next_attempt_at.is_none()
    }
}

/// Delivery attempt joined with names for the history view.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    #[serde(flatten)]
    pub attempt: DeliveryAttempt,
    pub channel_name: Option<String>,
    pub rule_name: Option<String>,
    pub message_content: Option<String>,
}

// ── Endpoints ───────────────────────────────────────────────────────

/// A SIM/gateway device that posts inbound SMS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEndpoint {
    pub id: String,
    pub name: String,
    pub phone_number: String,
    pub imei: Option<String>,
    pub api_token: String,
    pub is_active: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Create/update body for an endpoint. A token is generated when omitted.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointInput {
    pub name: String,
    pub phone_number: String,
    #[serde(default)]
    pub imei: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

// ── Queries ─────────────────────────────────────────────────────────

/// Filters for the delivery history view.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeliveryQuery {
    pub message_id: Option<String>,
    pub rule_id: Option<String>,
    pub channel_id: Option<String>,
    pub status: Option<DeliveryStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Filters for the message inbox view.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageQuery {
    pub endpoint_id: Option<String>,
    pub processed: Option<bool>,
    pub limit: Option<usize>,
}

/// Messages received in one hour.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TrafficBucket {
    pub time: DateTime<Utc>,
    pub sms_count: u64,
}

/// Headline counts for the dashboard.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DashboardSummary {
    pub messages_total: u64,
    pub messages_unprocessed: u64,
    pub deliveries_sent: u64,
    pub deliveries_failed: u64,
    pub deliveries_pending: u64,
    pub retries_scheduled: u64,
}

fn default_true() -> bool {
    true
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}
