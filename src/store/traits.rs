//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::delivery::tracker::AttemptUpdate;
use crate::error::DatabaseError;
use crate::pipeline::types::{
    DashboardSummary, DeliveryAttempt, DeliveryQuery, DeliveryRecord, DestinationChannel,
    ForwardRule, IncomingMessage, MessageQuery, RuleDestination, SimEndpoint, TrafficBucket,
};

/// Backend-agnostic database trait covering routing config, messages and deliveries.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &IncomingMessage) -> Result<(), DatabaseError>;

    async fn get_message(&self, id: &str) -> Result<Option<IncomingMessage>, DatabaseError>;

    /// Messages matching `query`, most recent first.
    async fn list_messages(&self, query: &MessageQuery)
    -> Result<Vec<IncomingMessage>, DatabaseError>;

    /// Record that every attempt for the message has been opened.
    async fn mark_routed(&self, message_id: &str, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    async fn is_routed(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Unprocessed messages received before `received_before` that nothing
    /// will settle on its own: routing never finished, or no attempt still
    /// owes a dispatch. Oldest first.
    async fn list_stalled_messages(
        &self,
        received_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<IncomingMessage>, DatabaseError>;

    /// Set `processed` once the message is routed and no attempt for it
    /// still owes a dispatch. Returns whether the message is now processed.
    async fn mark_processed_if_settled(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Message counts per hour since `since` (hours without traffic omitted).
    async fn traffic_by_hour(&self, since: DateTime<Utc>)
    -> Result<Vec<TrafficBucket>, DatabaseError>;

    async fn dashboard_summary(&self) -> Result<DashboardSummary, DatabaseError>;

    // ── Rules ───────────────────────────────────────────────────────

    async fn create_rule(&self, rule: &ForwardRule) -> Result<(), DatabaseError>;

    async fn get_rule(&self, id: &str) -> Result<Option<ForwardRule>, DatabaseError>;

    /// All non-deleted rules, ordered by `(priority, id)`.
    async fn list_rules(&self) -> Result<Vec<ForwardRule>, DatabaseError>;

    /// Returns false if the rule does not exist.
    async fn update_rule(&self, rule: &ForwardRule) -> Result<bool, DatabaseError>;

    /// Soft-delete the rule and drop its destinations.
    async fn delete_rule(&self, id: &str) -> Result<bool, DatabaseError>;

    // ── Channels ────────────────────────────────────────────────────

    async fn create_channel(&self, channel: &DestinationChannel) -> Result<(), DatabaseError>;

    async fn get_channel(&self, id: &str) -> Result<Option<DestinationChannel>, DatabaseError>;

    async fn list_channels(&self) -> Result<Vec<DestinationChannel>, DatabaseError>;

    async fn update_channel(&self, channel: &DestinationChannel) -> Result<bool, DatabaseError>;

    /// Soft-delete the channel and drop its destinations.
    async fn delete_channel(&self, id: &str) -> Result<bool, DatabaseError>;

    // ── Rule destinations ───────────────────────────────────────────

    async fn create_rule_destination(&self, dest: &RuleDestination) -> Result<(), DatabaseError>;

    async fn get_rule_destination(&self, id: &str)
    -> Result<Option<RuleDestination>, DatabaseError>;

    /// Destinations in insertion order, optionally for one rule.
    async fn list_rule_destinations(
        &self,
        rule_id: Option<&str>,
    ) -> Result<Vec<RuleDestination>, DatabaseError>;

    async fn update_rule_destination(&self, dest: &RuleDestination) -> Result<bool, DatabaseError>;

    async fn delete_rule_destination(&self, id: &str) -> Result<bool, DatabaseError>;

    // ── Endpoints ───────────────────────────────────────────────────

    async fn create_endpoint(&self, endpoint: &SimEndpoint) -> Result<(), DatabaseError>;

    async fn get_endpoint(&self, id: &str) -> Result<Option<SimEndpoint>, DatabaseError>;

    /// The endpoint that owns an API token.
    async fn get_endpoint_by_token(&self, token: &str) -> Result<Option<SimEndpoint>, DatabaseError>;

    async fn list_endpoints(&self) -> Result<Vec<SimEndpoint>, DatabaseError>;

    async fn update_endpoint(&self, endpoint: &SimEndpoint) -> Result<bool, DatabaseError>;

    async fn delete_endpoint(&self, id: &str) -> Result<bool, DatabaseError>;

    async fn touch_endpoint(&self, id: &str, seen_at: DateTime<Utc>) -> Result<(), DatabaseError>;

    // ── Delivery attempts ───────────────────────────────────────────

    /// Insert a new attempt. Returns false (and writes nothing) when an
    /// attempt for the same (message, rule, channel) already exists.
    async fn insert_attempt(&self, attempt: &DeliveryAttempt) -> Result<bool, DatabaseError>;

    async fn get_attempt(&self, id: &str) -> Result<Option<DeliveryAttempt>, DatabaseError>;

    async fn list_attempts_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<DeliveryAttempt>, DatabaseError>;

    /// History view rows, newest activity first.
    async fn list_deliveries(
        &self,
        query: &DeliveryQuery,
    ) -> Result<Vec<DeliveryRecord>, DatabaseError>;

    /// Lease up to `limit` attempts that are due at `now` and not leased by
    /// anyone else. Each claim bumps `version`; a claim lost to a concurrent
    /// worker is skipped.
    async fn claim_due_attempts(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>, DatabaseError>;

    /// Persist a dispatch outcome and release the lease. Only applies while
    /// `owner` still holds the lease; returns false otherwise.
    async fn record_attempt_outcome(
        &self,
        update: &AttemptUpdate,
        owner: &str,
    ) -> Result<bool, DatabaseError>;
}
