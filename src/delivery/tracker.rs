//! Delivery tracker: per-attempt state machine and retry scheduling.
//!
//! The transition itself is a pure function (`apply_outcome`); the tracker
//! wraps it with persistence. An attempt owes a dispatch while
//! `next_attempt_at` is set; clearing it makes the attempt terminal.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::error::{DatabaseError, DispatchError};
use crate::pipeline::types::{DeliveryAttempt, DeliveryStatus};
use crate::store::Database;

/// A dispatch the provider accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub provider_id: String,
    /// Set when only part of a multi-part send went out.
    pub note: Option<String>,
}

impl From<String> for Delivered {
    fn from(provider_id: String) -> Self {
        Self {
            provider_id,
            note: None,
        }
    }
}

impl From<&str> for Delivered {
    fn from(provider_id: &str) -> Self {
        Self::from(provider_id.to_string())
    }
}

/// Result of one dispatch: what the provider accepted, or why it failed.
pub type DispatchOutcome = Result<Delivered, DispatchError>;

/// The fields an outcome rewrites on an attempt row.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptUpdate {
    pub id: String,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub last_attempt_at: DateTime<Utc>,
    pub retry_count: u32,
    /// `Some` schedules a retry; `None` makes the attempt terminal.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Version the writer claimed the attempt at.
    pub version: i64,
}

impl AttemptUpdate {
    pub fn is_terminal(&self) -> bool {
        self.next_attempt_at.is_none()
    }
}

/// Compute the next state of `attempt` after a dispatch finished at `now`.
pub fn apply_outcome(
    attempt: &DeliveryAttempt,
    outcome: &DispatchOutcome,
    now: DateTime<Utc>,
    policy: &DeliveryConfig,
) -> AttemptUpdate {
    let mut update = AttemptUpdate {
        id: attempt.id.clone(),
        status: DeliveryStatus::Failed,
        provider_message_id: attempt.provider_message_id.clone(),
        // Earlier failure detail survives a later success.
        error: attempt.error.clone(),
        last_attempt_at: now,
        retry_count: attempt.retry_count,
        next_attempt_at: None,
        version: attempt.version,
    };

    match outcome {
        Ok(delivered) => {
            update.status = DeliveryStatus::Sent;
            update.provider_message_id = Some(delivered.provider_id.clone());
            if let Some(note) = &delivered.note {
                update.error = Some(note.clone());
            }
        }
        Err(err) if !err.is_transient() => {
            update.error = Some(err.to_string());
        }
        Err(err) if attempt.retry_count >= policy.max_retries => {
            update.error = Some(format!(
                "RetryExhausted after {} retries: {err}",
                attempt.retry_count
            ));
        }
        Err(err) => {
            let delay = policy.backoff(attempt.retry_count);
            let delay = chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
            update.error = Some(err.to_string());
            update.retry_count = attempt.retry_count + 1;
            update.next_attempt_at = Some(now + delay);
        }
    }

    update
}

/// Persists attempt creation and outcomes.
pub struct DeliveryTracker {
    store: Arc<dyn Database>,
    policy: DeliveryConfig,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn Database>, policy: DeliveryConfig) -> Self {
        Self { store, policy }
    }

    /// Create the attempt for a triple, leased to `owner` and due now.
    ///
    /// Returns `None` when the triple already has an attempt; the existing
    /// row is left to whoever owns it (or to the retry worker).
    pub async fn open_attempt(
        &self,
        message_id: &str,
        rule_id: &str,
        channel_id: &str,
        owner: &str,
    ) -> Result<Option<DeliveryAttempt>, DatabaseError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.policy.lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let attempt = DeliveryAttempt {
            id: Uuid::new_v4().to_string(),
            message_id: message_id.to_string(),
            rule_id: rule_id.to_string(),
            channel_id: channel_id.to_string(),
            status: DeliveryStatus::Pending,
            provider_message_id: None,
            error: None,
            last_attempt_at: None,
            retry_count: 0,
            next_attempt_at: Some(now),
            lease_owner: Some(owner.to_string()),
            lease_until: Some(now + lease),
            version: 0,
            created_at: now,
        };

        if self.store.insert_attempt(&attempt).await? {
            Ok(Some(attempt))
        } else {
            Ok(None)
        }
    }

    /// Apply and persist an outcome. Returns `None` if the lease was lost
    /// before the write (another worker now owns the attempt).
    pub async fn record_outcome(
        &self,
        attempt: &DeliveryAttempt,
        outcome: &DispatchOutcome,
        owner: &str,
    ) -> Result<Option<AttemptUpdate>, DatabaseError> {
        let update = apply_outcome(attempt, outcome, Utc::now(), &self.policy);

        if !self.store.record_attempt_outcome(&update, owner).await? {
            return Ok(None);
        }

        match (&update.status, &update.next_attempt_at) {
            (DeliveryStatus::Sent, _) => info!(
                attempt_id = %attempt.id,
                channel_id = %attempt.channel_id,
                provider_id = update.provider_message_id.as_deref().unwrap_or_default(),
                "Delivery sent"
            ),
            (_, Some(next)) => warn!(
                attempt_id = %attempt.id,
                channel_id = %attempt.channel_id,
                retry_count = update.retry_count,
                next_attempt_at = %next,
                error = update.error.as_deref().unwrap_or_default(),
                "Delivery failed, retry scheduled"
            ),
            (_, None) => warn!(
                attempt_id = %attempt.id,
                channel_id = %attempt.channel_id,
                retry_count = update.retry_count,
                error = update.error.as_deref().unwrap_or_default(),
                "Delivery failed permanently"
            ),
        }

        Ok(Some(update))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn policy() -> DeliveryConfig {
        DeliveryConfig {
            max_retries: 3,
            retry_base: Duration::from_secs(30),
            retry_cap: Duration::from_secs(3600),
            ..DeliveryConfig::default()
        }
    }

    fn pending() -> DeliveryAttempt {
        let now = Utc::now();
        DeliveryAttempt {
            id: "da-1".into(),
            message_id: "m1".into(),
            rule_id: "r1".into(),
            channel_id: "c1".into(),
            status: DeliveryStatus::Pending,
            provider_message_id: None,
            error: None,
            last_attempt_at: None,
            retry_count: 0,
            next_attempt_at: Some(now),
            lease_owner: Some("w".into()),
            lease_until: None,
            version: 0,
            created_at: now,
        }
    }

    /// Fold an update back into the attempt, as the store would.
    fn persist(attempt: &mut DeliveryAttempt, update: &AttemptUpdate) {
        attempt.status = update.status;
        attempt.provider_message_id = update.provider_message_id.clone();
        attempt.error = update.error.clone();
        attempt.last_attempt_at = Some(update.last_attempt_at);
        attempt.retry_count = update.retry_count;
        attempt.next_attempt_at = update.next_attempt_at;
    }

    #[test]
    fn success_is_terminal_sent() {
        let now = Utc::now();
        let update = apply_outcome(&pending(), &Ok("tg_msg_123".into()), now, &policy());
        assert_eq!(update.status, DeliveryStatus::Sent);
        assert_eq!(update.provider_message_id.as_deref(), Some("tg_msg_123"));
        assert_eq!(update.retry_count, 0);
        assert!(update.is_terminal());
        assert_eq!(update.last_attempt_at, now);
    }

    #[test]
    fn timeout_schedules_retry_at_base() {
        let now = Utc::now();
        let outcome = Err(DispatchError::elapsed(Duration::from_secs(5)));
        let update = apply_outcome(&pending(), &outcome, now, &policy());
        assert_eq!(update.status, DeliveryStatus::Failed);
        assert_eq!(update.retry_count, 1);
        assert_eq!(update.next_attempt_at, Some(now + chrono::Duration::seconds(30)));
        assert_eq!(update.error.as_deref(), Some("Timeout: 5000ms exceeded"));
    }

    #[test]
    fn backoff_grows_with_retry_count() {
        let now = Utc::now();
        let mut attempt = pending();
        attempt.retry_count = 2;
        let outcome = Err(DispatchError::from_status(503, "Service Unavailable"));
        let update = apply_outcome(&attempt, &outcome, now, &policy());
        assert_eq!(update.retry_count, 3);
        assert_eq!(update.next_attempt_at, Some(now + chrono::Duration::seconds(120)));
    }

    #[test]
    fn failure_then_success_keeps_error() {
        let mut attempt = pending();
        let timeout = Err(DispatchError::elapsed(Duration::from_secs(5)));
        let update = apply_outcome(&attempt, &timeout, Utc::now(), &policy());
        persist(&mut attempt, &update);

        let update = apply_outcome(&attempt, &Ok("tg_msg_9".into()), Utc::now(), &policy());
        persist(&mut attempt, &update);

        assert_eq!(attempt.status, DeliveryStatus::Sent);
        assert_eq!(attempt.retry_count, 1);
        assert_eq!(attempt.error.as_deref(), Some("Timeout: 5000ms exceeded"));
        assert!(attempt.is_terminal());
    }

    #[test]
    fn partial_delivery_is_sent_with_note() {
        let delivered = Delivered {
            provider_id: "101".into(),
            note: Some("Partially delivered: 1 part(s) sent before Timeout: 5000ms exceeded".into()),
        };
        let update = apply_outcome(&pending(), &Ok(delivered), Utc::now(), &policy());
        assert_eq!(update.status, DeliveryStatus::Sent);
        assert_eq!(update.provider_message_id.as_deref(), Some("101"));
        assert!(update.error.as_ref().unwrap().starts_with("Partially delivered: 1 part(s)"));
        assert!(update.is_terminal());
    }

    #[test]
    fn config_invalid_is_terminal_immediately() {
        let outcome = Err(DispatchError::ConfigInvalid("missing chat_id".into()));
        let update = apply_outcome(&pending(), &outcome, Utc::now(), &policy());
        assert_eq!(update.status, DeliveryStatus::Failed);
        assert_eq!(update.retry_count, 0);
        assert!(update.is_terminal());
        assert_eq!(
            update.error.as_deref(),
            Some("Invalid configuration: missing chat_id")
        );
    }

    #[test]
    fn permanent_rejection_is_terminal() {
        let outcome = Err(DispatchError::from_status(400, "Bad Request: chat not found"));
        let update = apply_outcome(&pending(), &outcome, Utc::now(), &policy());
        assert!(update.is_terminal());
        assert_eq!(update.retry_count, 0);
    }

    #[test]
    fn exhausted_retries_are_terminal() {
        let mut attempt = pending();
        attempt.retry_count = 3;
        let outcome = Err(DispatchError::Timeout("5000ms exceeded".into()));
        let update = apply_outcome(&attempt, &outcome, Utc::now(), &policy());
        assert!(update.is_terminal());
        assert_eq!(update.retry_count, 3);
        let error = update.error.unwrap();
        assert!(error.starts_with("RetryExhausted after 3 retries"));
        assert!(error.contains("5000ms"));
    }

    #[test]
    fn error_is_overwritten_by_latest_failure() {
        let mut attempt = pending();
        let first = Err(DispatchError::from_status(502, "Bad Gateway"));
        let update = apply_outcome(&attempt, &first, Utc::now(), &policy());
        persist(&mut attempt, &update);

        let second = Err(DispatchError::elapsed(Duration::from_secs(5)));
        let update = apply_outcome(&attempt, &second, Utc::now(), &policy());
        assert_eq!(update.error.as_deref(), Some("Timeout: 5000ms exceeded"));
        assert_eq!(update.retry_count, 2);
    }

    #[tokio::test]
    async fn tracker_opens_once_per_triple() {
        let store: Arc<dyn Database> =
            Arc::new(crate::store::LibSqlBackend::new_memory().await.unwrap());
        let message = crate::pipeline::types::IncomingMessage {
            id: "m1".into(),
            endpoint_id: "sim-1".into(),
            from_number: "+1".into(),
            to_number: "+2".into(),
            body: "hi".into(),
            received_at: Utc::now(),
            raw_payload: serde_json::json!({}),
            processed: false,
        };
        store.insert_message(&message).await.unwrap();

        let tracker = DeliveryTracker::new(store.clone(), policy());
        let first = tracker.open_attempt("m1", "r1", "c1", "w1").await.unwrap();
        assert!(first.is_some());
        assert!(tracker.open_attempt("m1", "r1", "c1", "w2").await.unwrap().is_none());

        let attempt = first.unwrap();
        let update = tracker
            .record_outcome(&attempt, &Ok("tg_msg_1".into()), "w1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.status, DeliveryStatus::Sent);

        // The lease was released by the write; a second write is dropped.
        assert!(
            tracker
                .record_outcome(&attempt, &Ok("tg_msg_1".into()), "w1")
                .await
                .unwrap()
                .is_none()
        );
    }
}
