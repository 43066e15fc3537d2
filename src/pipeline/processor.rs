//! Forwarding pipeline: ingestion through recorded delivery outcomes.
//!
//! Flow for one message:
//! 1. `accept()` validates, checks the endpoint and persists the message
//! 2. `process()` selects rules, resolves destinations, opens one attempt
//!    per (message, rule, channel) and dispatches them concurrently
//! 3. each outcome goes through the tracker; failures that can be retried
//!    stay queued in `delivery_attempts` for the retry worker
//!
//! Dispatch failures never surface to the ingestion caller.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::{DispatchRequest, Dispatcher};
use crate::delivery::tracker::{AttemptUpdate, DeliveryTracker, DispatchOutcome};
use crate::error::{DispatchError, PipelineError};
use crate::pipeline::cache::RoutingCache;
use crate::pipeline::resolver::ResolvedDestination;
use crate::pipeline::types::{DeliveryAttempt, DeliveryStatus, IncomingMessage, NewMessage};
use crate::store::Database;

/// What one `process()` run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub matched_rules: usize,
    /// Attempts opened by this run (existing triples are not reopened).
    pub attempts: usize,
    pub sent: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Whether the message is now marked processed.
    pub processed: bool,
}

impl ProcessSummary {
    fn count(&mut self, update: &AttemptUpdate) {
        match (update.status, update.next_attempt_at) {
            (DeliveryStatus::Sent, _) => self.sent += 1,
            (_, Some(_)) => self.retrying += 1,
            (_, None) => self.failed += 1,
        }
    }
}

pub struct Pipeline {
    store: Arc<dyn Database>,
    cache: Arc<RoutingCache>,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<DeliveryTracker>,
    /// Lease owner for attempts this process opens.
    owner: String,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Database>,
        cache: Arc<RoutingCache>,
        dispatcher: Arc<Dispatcher>,
        tracker: Arc<DeliveryTracker>,
    ) -> Self {
        Self {
            store,
            cache,
            dispatcher,
            tracker,
            owner: format!("pipeline-{}", Uuid::new_v4()),
        }
    }

    pub fn cache(&self) -> &Arc<RoutingCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    /// Accept a message and process it in the background.
    ///
    /// Returns once the message is stored; routing and delivery happen on
    /// a spawned task.
    pub async fn ingest(
        self: &Arc<Self>,
        api_key: &str,
        new: NewMessage,
    ) -> Result<IncomingMessage, PipelineError> {
        let message = self.accept(api_key, new).await?;

        let pipeline = Arc::clone(self);
        let spawned = message.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.process(&spawned).await {
                error!(message_id = %spawned.id, error = %e, "Message processing failed");
            }
        });

        Ok(message)
    }

    /// Validate and persist an inbound message.
    ///
    /// `api_key` must be the token of the endpoint named in the message,
    /// and that endpoint must be active.
    pub async fn accept(
        &self,
        api_key: &str,
        new: NewMessage,
    ) -> Result<IncomingMessage, PipelineError> {
        let raw_payload = validate(&new)?;
        let endpoint_id = new.endpoint_id.trim().to_string();
        let now = Utc::now();

        let key = api_key.trim();
        let owner = if key.is_empty() {
            None
        } else {
            self.store.get_endpoint_by_token(key).await?
        };
        let Some(endpoint) = owner.filter(|e| e.id == endpoint_id) else {
            warn!(endpoint_id = %endpoint_id, "Rejected message with invalid API key");
            return Err(PipelineError::Unauthorized(endpoint_id));
        };
        if !endpoint.is_active {
            warn!(endpoint_id = %endpoint.id, "Rejected message from inactive endpoint");
            return Err(PipelineError::EndpointInactive(endpoint.id));
        }
        self.store.touch_endpoint(&endpoint.id, now).await?;

        let message = IncomingMessage {
            id: Uuid::new_v4().to_string(),
            endpoint_id,
            from_number: new.from_number.trim().to_string(),
            to_number: new.to_number.trim().to_string(),
            body: new.body,
            received_at: now,
            raw_payload,
            processed: false,
        };
        self.store.insert_message(&message).await?;

        info!(
            message_id = %message.id,
            endpoint_id = %message.endpoint_id,
            from = %message.from_number,
            "Message ingested"
        );
        Ok(message)
    }

    /// Route a stored message and dispatch to every resolved destination.
    ///
    /// A message whose routing already finished is only settled; its
    /// attempts are driven by the retry worker.
    pub async fn process(&self, message: &IncomingMessage) -> Result<ProcessSummary, PipelineError> {
        if self.store.is_routed(&message.id).await? {
            let processed = self.store.mark_processed_if_settled(&message.id).await?;
            debug!(message_id = %message.id, processed, "Message already routed");
            return Ok(ProcessSummary {
                processed,
                ..ProcessSummary::default()
            });
        }

        let snapshot = self.cache.snapshot().await?;
        let rules = snapshot.matcher.select_rules(message);

        let mut summary = ProcessSummary {
            matched_rules: rules.len(),
            ..ProcessSummary::default()
        };

        let mut jobs: Vec<(ResolvedDestination, DeliveryAttempt)> = Vec::new();
        for rule in &rules {
            for destination in snapshot.resolver.resolve_destinations(rule) {
                let opened = self
                    .tracker
                    .open_attempt(&message.id, &rule.id, &destination.channel.id, &self.owner)
                    .await?;
                match opened {
                    Some(attempt) => jobs.push((destination, attempt)),
                    None => debug!(
                        message_id = %message.id,
                        rule_id = %rule.id,
                        channel_id = %destination.channel.id,
                        "Attempt already exists, leaving it to its owner"
                    ),
                }
            }
        }
        self.store.mark_routed(&message.id, Utc::now()).await?;
        summary.attempts = jobs.len();

        let updates = join_all(
            jobs.iter()
                .map(|(destination, attempt)| self.deliver(message, destination, attempt, &self.owner)),
        )
        .await;
        for update in updates.iter().flatten() {
            summary.count(update);
        }

        summary.processed = self.store.mark_processed_if_settled(&message.id).await?;

        info!(
            message_id = %message.id,
            matched_rules = summary.matched_rules,
            attempts = summary.attempts,
            sent = summary.sent,
            retrying = summary.retrying,
            failed = summary.failed,
            processed = summary.processed,
            "Message processed"
        );
        Ok(summary)
    }

    /// Dispatch an attempt claimed by `owner` again.
    ///
    /// The binding is looked up in the current routing snapshot; if the
    /// rule, destination or channel is gone or disabled the attempt fails
    /// for good instead of being sent to a stale destination.
    pub async fn redeliver(
        &self,
        attempt: &DeliveryAttempt,
        owner: &str,
    ) -> Result<Option<AttemptUpdate>, PipelineError> {
        let Some(message) = self.store.get_message(&attempt.message_id).await? else {
            let outcome: DispatchOutcome = Err(DispatchError::ConfigInvalid(format!(
                "message {} no longer exists",
                attempt.message_id
            )));
            return Ok(self.tracker.record_outcome(attempt, &outcome, owner).await?);
        };

        let snapshot = self.cache.snapshot().await?;
        let rule_active = snapshot.matcher.rules().iter().any(|r| r.id == attempt.rule_id);
        let binding = snapshot
            .resolver
            .resolve_binding(&attempt.rule_id, &attempt.channel_id)
            .filter(|_| rule_active);

        let update = match binding {
            Some(destination) => self.deliver(&message, &destination, attempt, owner).await,
            None => {
                let outcome: DispatchOutcome = Err(DispatchError::ConfigInvalid(
                    "rule, destination or channel is no longer active".into(),
                ));
                self.tracker.record_outcome(attempt, &outcome, owner).await?
            }
        };

        self.store.mark_processed_if_settled(&message.id).await?;
        Ok(update)
    }

    /// Re-run every stalled message at startup.
    pub async fn recover_unprocessed(&self) -> Result<usize, PipelineError> {
        self.resume_stalled(Utc::now(), usize::MAX).await
    }

    /// Finish messages received before `received_before` whose pipeline run
    /// stopped short: routing is completed for the ones that never got all
    /// their attempts, and settled ones are marked processed. Attempts that
    /// already exist are left for the retry worker.
    pub async fn resume_stalled(
        &self,
        received_before: chrono::DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, PipelineError> {
        let stalled = self.store.list_stalled_messages(received_before, limit).await?;
        if stalled.is_empty() {
            return Ok(0);
        }
        info!(count = stalled.len(), "Resuming stalled messages");

        for message in &stalled {
            if let Err(e) = self.process(message).await {
                error!(message_id = %message.id, error = %e, "Resuming message failed");
            }
        }
        Ok(stalled.len())
    }

    /// Render, dispatch and record one attempt. Storage errors while
    /// recording are logged; the lease then expires and the row is retried.
    async fn deliver(
        &self,
        message: &IncomingMessage,
        destination: &ResolvedDestination,
        attempt: &DeliveryAttempt,
        owner: &str,
    ) -> Option<AttemptUpdate> {
        let outcome = match destination.render(message) {
            Ok(text) => {
                let request = DispatchRequest {
                    channel: &destination.channel,
                    text: &text,
                    action_config: &destination.action_config,
                    message,
                    rule_id: &attempt.rule_id,
                };
                self.dispatcher.dispatch(&request).await
            }
            Err(e) => Err(e),
        };

        if let Err(ref e) = outcome {
            debug!(attempt_id = %attempt.id, kind = e.kind(), error = %e, "Dispatch failed");
        }

        match self.tracker.record_outcome(attempt, &outcome, owner).await {
            Ok(Some(update)) => Some(update),
            Ok(None) => {
                warn!(attempt_id = %attempt.id, "Lease lost before outcome was recorded");
                None
            }
            Err(e) => {
                error!(attempt_id = %attempt.id, error = %e, "Failed to record delivery outcome");
                None
            }
        }
    }
}

/// Required fields present; returns the normalised raw payload.
fn validate(new: &NewMessage) -> Result<serde_json::Value, PipelineError> {
    if new.endpoint_id.trim().is_empty() {
        return Err(PipelineError::InvalidMessage("endpoint_id is required".into()));
    }
    if new.from_number.trim().is_empty() {
        return Err(PipelineError::InvalidMessage("from_number is required".into()));
    }
    match &new.raw_payload {
        serde_json::Value::Object(_) => Ok(new.raw_payload.clone()),
        serde_json::Value::Null => Ok(serde_json::Value::Object(serde_json::Map::new())),
        _ => Err(PipelineError::InvalidMessage(
            "raw_payload must be a JSON object".into(),
        )),
    }
}
