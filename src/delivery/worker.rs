//! Retry worker.
//!
//! Polls `delivery_attempts` for rows whose `next_attempt_at` has passed,
//! leases a batch and re-dispatches it. Several workers (or processes) may
//! poll the same table; the lease and version check keep each attempt with
//! a single owner.
//!
//! Each poll also picks up messages whose pipeline run stopped short and
//! that are older than one lease.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::processor::Pipeline;
use crate::store::Database;

pub struct RetryWorker {
    store: Arc<dyn Database>,
    pipeline: Arc<Pipeline>,
    config: DeliveryConfig,
    owner: String,
}

impl RetryWorker {
    pub fn new(store: Arc<dyn Database>, pipeline: Arc<Pipeline>, config: DeliveryConfig) -> Self {
        Self {
            store,
            pipeline,
            config,
            owner: format!("retry-{}", Uuid::new_v4()),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Claim and re-dispatch one batch of due attempts. Returns how many
    /// were claimed.
    pub async fn run_once(&self) -> Result<usize, DatabaseError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.config.lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let claimed = self
            .store
            .claim_due_attempts(&self.owner, now, now + lease, self.config.batch_size)
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        debug!(owner = %self.owner, count = claimed.len(), "Claimed due attempts");

        let results = join_all(
            claimed
                .iter()
                .map(|attempt| self.pipeline.redeliver(attempt, &self.owner)),
        )
        .await;

        for (attempt, result) in claimed.iter().zip(results) {
            if let Err(e) = result {
                error!(attempt_id = %attempt.id, error = %e, "Retry dispatch failed");
            }
        }

        Ok(claimed.len())
    }

    /// Finish one batch of stalled messages. Returns how many were found.
    pub async fn resume_stalled(&self) -> Result<usize, PipelineError> {
        let lease = chrono::Duration::from_std(self.config.lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.pipeline
            .resume_stalled(Utc::now() - lease, self.config.batch_size)
            .await
    }
}

/// Spawn the polling loop. Runs until the task is aborted.
pub fn spawn_retry_worker(
    worker: Arc<RetryWorker>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(owner = %worker.owner(), "Retry worker started, polling every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = worker.run_once().await {
                error!("Retry poll failed: {e}");
            }
            if let Err(e) = worker.resume_stalled().await {
                error!("Stalled message sweep failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelSender, DispatchRequest, Dispatcher, SendProgress};
    use crate::delivery::tracker::DeliveryTracker;
    use crate::error::DispatchError;
    use crate::pipeline::cache::RoutingCache;
    use crate::pipeline::types::{
        ChannelInput, ChannelType, DeliveryStatus, NewMessage, RuleDestinationInput, RuleInput,
        SimEndpoint,
    };
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls with a timeout, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChannelSender for Flaky {
        fn channel_type(&self) -> ChannelType {
            ChannelType::Webhook
        }

        async fn send(
            &self,
            _request: &DispatchRequest<'_>,
            _progress: &SendProgress,
        ) -> Result<String, DispatchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(DispatchError::Timeout("5000ms exceeded".into()))
            } else {
                Ok(format!("wh_{n}"))
            }
        }
    }

    const SIM_KEY: &str = "sim-1-key";

    /// Zero backoff so retries are due immediately.
    fn config() -> DeliveryConfig {
        DeliveryConfig {
            max_retries: 2,
            retry_base: Duration::ZERO,
            retry_cap: Duration::ZERO,
            ..DeliveryConfig::default()
        }
    }

    /// Zero lease: every message counts as stalled and every lease as expired.
    fn sweep_config() -> DeliveryConfig {
        DeliveryConfig {
            lease: Duration::ZERO,
            ..config()
        }
    }

    async fn setup(failures: usize) -> (Arc<dyn Database>, Arc<Pipeline>, Arc<Flaky>) {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.init_schema().await.unwrap();
        let store: Arc<dyn Database> = Arc::new(db);
        store
            .create_endpoint(&SimEndpoint {
                id: "sim-1".into(),
                name: "Warehouse SIM".into(),
                phone_number: "+989120001122".into(),
                imei: None,
                api_token: SIM_KEY.into(),
                is_active: true,
                last_seen_at: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let rule = RuleInput {
            name: "all".into(),
            is_enabled: true,
            priority: 0,
            filters: json!({}),
            stop_processing: false,
        }
        .into_rule("r1".into());
        store.create_rule(&rule).await.unwrap();
        let channel = ChannelInput {
            channel_type: ChannelType::Webhook,
            name: "hook".into(),
            is_enabled: true,
            config: json!({"url": "http://example.invalid/hook"}),
        }
        .into_channel("c1".into());
        store.create_channel(&channel).await.unwrap();
        let binding = RuleDestinationInput {
            rule_id: "r1".into(),
            channel_id: "c1".into(),
            is_enabled: true,
            override_text_template: None,
            action_config: json!({}),
        }
        .into_destination("rd1".into());
        store.create_rule_destination(&binding).await.unwrap();

        let flaky = Arc::new(Flaky {
            failures,
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(Duration::from_secs(2)).with_sender(flaky.clone());
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            Arc::new(RoutingCache::new(store.clone())),
            Arc::new(dispatcher),
            Arc::new(DeliveryTracker::new(store.clone(), config())),
        ));
        (store, pipeline, flaky)
    }

    fn message() -> NewMessage {
        NewMessage {
            endpoint_id: "sim-1".into(),
            from_number: "+989121234567".into(),
            to_number: "+989120001122".into(),
            body: "ALERT".into(),
            raw_payload: json!({}),
        }
    }

    #[tokio::test]
    async fn retries_until_sent() {
        let (store, pipeline, flaky) = setup(1).await;
        let msg = pipeline.accept(SIM_KEY, message()).await.unwrap();
        pipeline.process(&msg).await.unwrap();

        let worker = RetryWorker::new(store.clone(), pipeline, config());
        assert_eq!(worker.run_once().await.unwrap(), 1);
        // Nothing left to claim.
        assert_eq!(worker.run_once().await.unwrap(), 0);

        let attempts = store.list_attempts_for_message(&msg.id).await.unwrap();
        assert_eq!(attempts[0].status, DeliveryStatus::Sent);
        assert_eq!(attempts[0].retry_count, 1);
        assert_eq!(attempts[0].provider_message_id.as_deref(), Some("wh_1"));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
        assert!(store.get_message(&msg.id).await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (store, pipeline, flaky) = setup(usize::MAX).await;
        let msg = pipeline.accept(SIM_KEY, message()).await.unwrap();
        pipeline.process(&msg).await.unwrap();

        let worker = RetryWorker::new(store.clone(), pipeline, config());
        assert_eq!(worker.run_once().await.unwrap(), 1);
        assert_eq!(worker.run_once().await.unwrap(), 1);
        assert_eq!(worker.run_once().await.unwrap(), 0);

        let attempt = &store.list_attempts_for_message(&msg.id).await.unwrap()[0];
        assert_eq!(attempt.status, DeliveryStatus::Failed);
        assert_eq!(attempt.retry_count, 2);
        assert!(attempt.next_attempt_at.is_none());
        assert!(attempt.error.as_deref().unwrap().starts_with("RetryExhausted after 2 retries"));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert!(store.get_message(&msg.id).await.unwrap().unwrap().processed);
    }

    #[tokio::test]
    async fn unprocessed_message_is_resumed_by_the_sweep() {
        let (store, pipeline, flaky) = setup(0).await;
        // Accepted, but its pipeline run never happened.
        let msg = pipeline.accept(SIM_KEY, message()).await.unwrap();

        let worker = RetryWorker::new(store.clone(), pipeline, sweep_config());
        assert_eq!(worker.resume_stalled().await.unwrap(), 1);

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
        assert!(store.get_message(&msg.id).await.unwrap().unwrap().processed);
        assert_eq!(worker.resume_stalled().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn interrupted_routing_is_not_settled_by_a_retry() {
        let (store, pipeline, flaky) = setup(0).await;
        let msg = pipeline.accept(SIM_KEY, message()).await.unwrap();

        // The run opened its attempt, then stopped before routing finished.
        let tracker = DeliveryTracker::new(store.clone(), sweep_config());
        tracker.open_attempt(&msg.id, "r1", "c1", "crashed").await.unwrap().unwrap();

        let worker = RetryWorker::new(store.clone(), pipeline, sweep_config());
        assert_eq!(worker.run_once().await.unwrap(), 1);
        let attempts = store.list_attempts_for_message(&msg.id).await.unwrap();
        assert_eq!(attempts[0].status, DeliveryStatus::Sent);
        assert!(!store.get_message(&msg.id).await.unwrap().unwrap().processed);

        assert_eq!(worker.resume_stalled().await.unwrap(), 1);
        assert!(store.get_message(&msg.id).await.unwrap().unwrap().processed);
        // The existing attempt was not dispatched again.
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.list_attempts_for_message(&msg.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_ignores_recent_messages() {
        let (store, pipeline, flaky) = setup(0).await;
        pipeline.accept(SIM_KEY, message()).await.unwrap();

        let worker = RetryWorker::new(store, pipeline, config());
        assert_eq!(worker.resume_stalled().await.unwrap(), 0);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn leased_attempts_are_not_claimed_twice() {
        let (store, pipeline, _) = setup(1).await;
        let msg = pipeline.accept(SIM_KEY, message()).await.unwrap();
        pipeline.process(&msg).await.unwrap();

        // Another worker holds the lease.
        let now = Utc::now();
        let held = store
            .claim_due_attempts("other", now, now + chrono::Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(held.len(), 1);

        let worker = RetryWorker::new(store, pipeline, config());
        assert_eq!(worker.run_once().await.unwrap(), 0);
    }
}
