//! Hybrid orchestrator routing records across cache, vector and durable tiers.

mod read;
mod write;

use crate::backend::{BackendAdapter, CategoryCounts, ScanFilter};
use crate::embed::Embedder;
use crate::error::{BackendError, MemoryError};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::model::{MemoryRecord, RecordUpdate};
use crate::routing::RoutingPolicy;
use crate::tasks::{BackgroundQueue, RecordLocks};
use chrono::Utc;
use log::{debug, info, warn};
use mnemos_rs_protocol::{BackendHealth, TierKind};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Embedding dimension used when the builder is not told otherwise.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;
/// Detached background jobs allowed before callers run them inline.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Adapters by tier. Cache and vector are optional.
#[derive(Clone)]
pub(crate) struct Tiers {
    pub(crate) cache: Option<Arc<dyn BackendAdapter>>,
    pub(crate) vector: Option<Arc<dyn BackendAdapter>>,
    pub(crate) durable: Arc<dyn BackendAdapter>,
}

impl Tiers {
    pub(crate) fn get(&self, tier: TierKind) -> Option<&Arc<dyn BackendAdapter>> {
        match tier {
            TierKind::Cache => self.cache.as_ref(),
            TierKind::Vector => self.vector.as_ref(),
            TierKind::Durable => Some(&self.durable),
        }
    }

    /// Adapter for `tier` if it exists and the snapshot routes to it.
    pub(crate) fn active(
        &self,
        tier: TierKind,
        snapshot: &HealthSnapshot,
    ) -> Option<&Arc<dyn BackendAdapter>> {
        if snapshot.is_active(tier) {
            self.get(tier)
        } else {
            None
        }
    }

    fn initial_health(&self) -> HealthSnapshot {
        let mut snapshot = HealthSnapshot::default();
        for tier in TierKind::ALL {
            if self.get(tier).is_none() {
                snapshot.set(tier, BackendHealth::Unavailable);
            }
        }
        snapshot
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Point-in-time view of the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub health: HealthSnapshot,
    /// Durable record counts; `None` while the durable tier is unavailable.
    pub counts: Option<CategoryCounts>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Hits over lookups, 0 before the first lookup.
    pub cache_hit_rate: f64,
    pub background_in_flight: usize,
}

/// Multi-tier memory store.
///
/// Construct one with [`HybridStore::builder`] and share it as
/// `Arc<HybridStore>`; there is no global instance.
pub struct HybridStore {
    tiers: Tiers,
    routing: RwLock<Arc<RoutingPolicy>>,
    health: HealthMonitor,
    queue: BackgroundQueue,
    locks: Arc<RecordLocks>,
    embedder: Option<Arc<dyn Embedder>>,
    dimension: usize,
    default_timeout: Option<Duration>,
    counters: CacheCounters,
}

/// Builder for [`HybridStore`].
pub struct HybridStoreBuilder {
    durable: Arc<dyn BackendAdapter>,
    cache: Option<Arc<dyn BackendAdapter>>,
    vector: Option<Arc<dyn BackendAdapter>>,
    routing: RoutingPolicy,
    embedder: Option<Arc<dyn Embedder>>,
    dimension: usize,
    default_timeout: Option<Duration>,
    queue_capacity: usize,
}

impl HybridStoreBuilder {
    pub fn cache(mut self, cache: Arc<dyn BackendAdapter>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn vector(mut self, vector: Arc<dyn BackendAdapter>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn routing(mut self, routing: RoutingPolicy) -> Self {
        self.routing = routing;
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn embedding_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    /// Deadline applied by `store`, `recall` and `search`.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<HybridStore, MemoryError> {
        self.routing.validate()?;
        for (tier, adapter) in [(TierKind::Cache, &self.cache), (TierKind::Vector, &self.vector)] {
            if let Some(adapter) = adapter {
                if adapter.tier() != tier {
                    warn!(
                        "adapter registered for another tier (adapter={}, expected={tier}, actual={})",
                        adapter.name(),
                        adapter.tier()
                    );
                }
            }
        }
        let tiers = Tiers {
            cache: self.cache,
            vector: self.vector,
            durable: self.durable,
        };
        let health = HealthMonitor::new(tiers.initial_health());
        info!(
            "hybrid store ready (durable={}, cache={}, vector={}, dimension={})",
            tiers.durable.name(),
            tiers.cache.as_ref().map_or("none", |cache| cache.name()),
            tiers.vector.as_ref().map_or("none", |vector| vector.name()),
            self.dimension
        );
        Ok(HybridStore {
            tiers,
            routing: RwLock::new(Arc::new(self.routing)),
            health,
            queue: BackgroundQueue::new(self.queue_capacity),
            locks: Arc::new(RecordLocks::new()),
            embedder: self.embedder,
            dimension: self.dimension,
            default_timeout: self.default_timeout,
            counters: CacheCounters::default(),
        })
    }
}

impl HybridStore {
    /// Start building a store around its durable tier.
    pub fn builder(durable: Arc<dyn BackendAdapter>) -> HybridStoreBuilder {
        HybridStoreBuilder {
            durable,
            cache: None,
            vector: None,
            routing: RoutingPolicy::default(),
            embedder: None,
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            default_timeout: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Current routing table.
    pub fn routing(&self) -> Arc<RoutingPolicy> {
        Arc::clone(&self.routing.read())
    }

    /// Swap in a new routing table; in-flight calls keep the old one.
    pub fn reload_routing(&self, routing: RoutingPolicy) -> Result<(), MemoryError> {
        routing.validate()?;
        *self.routing.write() = Arc::new(routing);
        info!("routing table reloaded");
        Ok(())
    }

    pub fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Follow health changes as they are published.
    pub fn subscribe_health(&self) -> watch::Receiver<HealthSnapshot> {
        self.health.subscribe()
    }

    /// Wait for queued background work (repopulation, counters) to finish.
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    pub(crate) fn durable(&self) -> &Arc<dyn BackendAdapter> {
        &self.tiers.durable
    }

    pub(crate) fn locks(&self) -> &RecordLocks {
        &self.locks
    }

    /// Fail fast unless the durable tier is routable.
    pub(crate) fn require_durable(&self, snapshot: &HealthSnapshot) -> Result<(), MemoryError> {
        if snapshot.is_active(TierKind::Durable) {
            Ok(())
        } else {
            Err(MemoryError::BackendUnavailable {
                tier: TierKind::Durable,
                reason: "durable tier is unavailable".to_string(),
            })
        }
    }

    /// Translate a durable failure, taking the tier out of routing if needed.
    pub(crate) fn durable_error(&self, err: BackendError) -> MemoryError {
        if matches!(err, BackendError::Unavailable(_)) {
            self.health
                .mark_unavailable(TierKind::Durable, &err.to_string());
        }
        MemoryError::unavailable(TierKind::Durable, &err)
    }

    /// Probe every tier and publish a fresh snapshot.
    ///
    /// A volatile tier coming back from `Unavailable` is cleared so it cannot
    /// serve records forgotten while it was away; a returning vector tier is
    /// then refilled from the durable tier. A tier taken out of routing while
    /// the probe runs counts as returning.
    pub async fn check_health(&self) -> HealthSnapshot {
        let before_probe = self.health.marks();
        let previous = self.health.snapshot();
        let mut next = HealthSnapshot::default();
        for tier in TierKind::ALL {
            let health = match self.tiers.get(tier) {
                Some(adapter) => adapter.health().await,
                None => BackendHealth::Unavailable,
            };
            next.set(tier, health);
        }

        let mut baseline = before_probe;
        let settled = self.health.marks();
        let mut backfill_vector = false;
        for tier in [TierKind::Cache, TierKind::Vector] {
            let returning =
                !previous.is_active(tier) || settled.get(tier) != before_probe.get(tier);
            if !returning || !next.is_active(tier) {
                continue;
            }
            let Some(adapter) = self.tiers.get(tier) else {
                continue;
            };
            match adapter.clear().await {
                Ok(()) => {
                    info!("cleared rejoining tier (tier={tier})");
                    baseline.advance(tier, &settled);
                    backfill_vector |= tier == TierKind::Vector;
                }
                Err(err) => {
                    warn!("failed to clear rejoining tier (tier={tier}, err={err})");
                    next.set(tier, BackendHealth::Unavailable);
                }
            }
        }
        let next = self.health.publish_probe(next, &baseline);

        let vector_ready = next.is_active(TierKind::Vector) && next.is_active(TierKind::Durable);
        if backfill_vector && vector_ready {
            self.backfill_vector().await;
        }
        next
    }

    /// Probe tier health every `interval` until the returned task is aborted.
    pub fn spawn_health_checks(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = self.check_health().await;
                debug!(
                    "health check (cache={}, vector={}, durable={})",
                    snapshot.cache, snapshot.vector, snapshot.durable
                );
            }
        })
    }

    async fn backfill_vector(&self) {
        let Some(vector) = self.tiers.vector.as_ref() else {
            return;
        };
        let categories = self.routing().indexed_categories();
        if categories.is_empty() {
            return;
        }
        let filter = ScanFilter {
            categories: Some(categories),
            ..ScanFilter::default()
        };
        let records = match self.tiers.durable.scan(&filter).await {
            Ok(records) => records,
            Err(err) => {
                warn!("vector backfill skipped (err={err})");
                return;
            }
        };
        let mut restored = 0usize;
        for record in records {
            let id = record.id;
            let _guard = self.locks.lock(id).await;
            match vector.put(record, None).await {
                Ok(()) => restored += 1,
                Err(err) => {
                    warn!("vector backfill stopped (id={id}, err={err})");
                    self.health.mark_unavailable(TierKind::Vector, &err.to_string());
                    return;
                }
            }
        }
        info!("vector tier backfilled (records={restored})");
    }

    /// Clear the owner link on every record attributed to `persona`.
    ///
    /// Records are never deleted. Returns the number of records detached.
    pub async fn detach_owner(&self, persona: &str) -> Result<usize, MemoryError> {
        let snapshot = self.health.snapshot();
        self.require_durable(&snapshot)?;
        let owned = self
            .tiers
            .durable
            .scan(&ScanFilter::owner(persona))
            .await
            .map_err(|err| self.durable_error(err))?;

        let mut detached = 0usize;
        for record in owned {
            let _guard = self.locks.lock(record.id).await;
            let update = RecordUpdate::ClearOwner { at: Utc::now() };
            if self.update_everywhere(record.id, &update).await?.is_some() {
                detached += 1;
            }
        }
        info!("detached owner from memory records (owner={persona}, records={detached})");
        Ok(detached)
    }

    /// Health, durable counts and cache effectiveness.
    pub async fn stats(&self) -> StoreStats {
        let health = self.health.snapshot();
        let counts = if health.is_active(TierKind::Durable) {
            match self.tiers.durable.category_counts().await {
                Ok(counts) => Some(counts),
                Err(err) => {
                    debug!("durable counts unavailable (err={err})");
                    None
                }
            }
        } else {
            None
        };
        let cache_hits = self.counters.hits.load(Ordering::Relaxed);
        let cache_misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = cache_hits + cache_misses;
        let cache_hit_rate = if lookups == 0 {
            0.0
        } else {
            cache_hits as f64 / lookups as f64
        };
        StoreStats {
            health,
            counts,
            cache_hits,
            cache_misses,
            cache_hit_rate,
            background_in_flight: self.queue.in_flight(),
        }
    }

    /// Records attributed to a persona, from the durable tier.
    pub async fn records_owned_by(&self, persona: &str) -> Result<Vec<MemoryRecord>, MemoryError> {
        let snapshot = self.health.snapshot();
        self.require_durable(&snapshot)?;
        self.tiers
            .durable
            .scan(&ScanFilter::owner(persona))
            .await
            .map_err(|err| self.durable_error(err))
    }
}

#[cfg(test)]
mod tests;
