//! Routing cache: a read-mostly snapshot of rules, channels and bindings.
//!
//! The store stays the source of truth. The snapshot is rebuilt lazily on
//! the first read after `invalidate()`, which every management write calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::DatabaseError;
use crate::pipeline::matcher::RuleMatcher;
use crate::pipeline::resolver::DestinationResolver;
use crate::store::Database;

/// Everything routing needs, built from one read of the store.
pub struct RoutingSnapshot {
    pub matcher: RuleMatcher,
    pub resolver: DestinationResolver,
}

pub struct RoutingCache {
    store: Arc<dyn Database>,
    snapshot: RwLock<Option<Arc<RoutingSnapshot>>>,
    /// Bumped by `invalidate`; a load that raced an invalidation is not kept.
    generation: AtomicU64,
}

impl RoutingCache {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Current snapshot, loading it from the store on a miss.
    pub async fn snapshot(&self) -> Result<Arc<RoutingSnapshot>, DatabaseError> {
        if let Some(snapshot) = self.snapshot.read().await.as_ref() {
            return Ok(Arc::clone(snapshot));
        }

        let generation = self.generation.load(Ordering::Acquire);
        let loaded = Arc::new(self.load().await?);

        let mut slot = self.snapshot.write().await;
        if self.generation.load(Ordering::Acquire) == generation {
            *slot = Some(Arc::clone(&loaded));
        }
        Ok(loaded)
    }

    /// Drop the snapshot; the next read reloads it.
    pub async fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        *self.snapshot.write().await = None;
        debug!("Routing cache invalidated");
    }

    async fn load(&self) -> Result<RoutingSnapshot, DatabaseError> {
        let rules = self.store.list_rules().await?;
        let channels = self.store.list_channels().await?;
        let destinations = self.store.list_rule_destinations(None).await?;

        debug!(
            rules = rules.len(),
            channels = channels.len(),
            destinations = destinations.len(),
            "Routing cache refreshed"
        );

        Ok(RoutingSnapshot {
            matcher: RuleMatcher::new(rules),
            resolver: DestinationResolver::new(channels, destinations),
        })
    }
}
