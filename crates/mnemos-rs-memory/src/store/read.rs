//! Read paths: cache-first recall and similarity search.

use super::{HybridStore, Tiers};
use super::write::tier_ttl;
use crate::backend::ScanFilter;
use crate::error::{BackendError, MemoryError};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::model::{MemoryRecord, RecordUpdate, ScoredRecord, validate_embedding};
use crate::search::{SearchRequest, brute_force};
use chrono::Utc;
use log::{debug, info, warn};
use mnemos_rs_protocol::{MemoryCategory, RecordId, TierKind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

impl HybridStore {
    /// Fetch a record by id, cache first.
    pub async fn recall(&self, id: RecordId) -> Result<MemoryRecord, MemoryError> {
        match self.default_timeout {
            Some(limit) => self.recall_within(id, limit).await,
            None => self.recall_now(id).await,
        }
    }

    /// `recall` with an explicit deadline.
    pub async fn recall_within(
        &self,
        id: RecordId,
        limit: Duration,
    ) -> Result<MemoryRecord, MemoryError> {
        tokio::time::timeout(limit, self.recall_now(id))
            .await
            .map_err(|_| MemoryError::Timeout(limit))?
    }

    async fn recall_now(&self, id: RecordId) -> Result<MemoryRecord, MemoryError> {
        let snapshot = self.health.snapshot();
        if let Some(cache) = self.tiers.active(TierKind::Cache, &snapshot) {
            match cache.get(id).await {
                Ok(Some(record)) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("cache hit (id={id})");
                    self.queue_access(id, None).await;
                    return Ok(record);
                }
                Ok(None) => {}
                Err(err @ BackendError::Corrupt { .. }) => {
                    warn!("corrupt cache entry ignored (id={id}, err={err})");
                    if let Err(err) = cache.delete(id).await {
                        debug!("failed to drop corrupt cache entry (id={id}, err={err})");
                    }
                }
                Err(err) => {
                    warn!("cache read failed, falling through (id={id}, err={err})");
                    self.health
                        .mark_unavailable(TierKind::Cache, &err.to_string());
                }
            }
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }

        if let Err(err) = self.require_durable(&snapshot) {
            return self.recall_from_primary(id, &snapshot).await.ok_or(err);
        }
        let record = match self.tiers.durable.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!("memory record not found (id={id})");
                return Err(MemoryError::NotFound(id));
            }
            Err(err @ BackendError::Corrupt { .. }) => {
                warn!("corrupt durable record treated as missing (id={id}, err={err})");
                return Err(MemoryError::NotFound(id));
            }
            Err(err) => {
                let err = self.durable_error(err);
                return self.recall_from_primary(id, &snapshot).await.ok_or(err);
            }
        };

        let route = self.routing().route(record.category).clone();
        let repopulate = route.writes_to(TierKind::Cache) && snapshot.is_active(TierKind::Cache);
        let ttl = if repopulate {
            Some(tier_ttl(TierKind::Cache, &route))
        } else {
            None
        };
        self.queue_access(id, ttl).await;
        Ok(record)
    }

    /// Serve a read from the vector tier while the durable tier is out of
    /// routing, for records whose category reads from it first.
    ///
    /// Access counters are not touched: they only move on the durable tier.
    async fn recall_from_primary(
        &self,
        id: RecordId,
        snapshot: &HealthSnapshot,
    ) -> Option<MemoryRecord> {
        let vector = self.tiers.active(TierKind::Vector, snapshot)?;
        let routing = self.routing();
        match vector.get(id).await {
            Ok(Some(record)) if routing.route(record.category).primary == TierKind::Vector => {
                info!("served from primary tier while durable is down (id={id}, tier=vector)");
                Some(record)
            }
            Ok(_) => None,
            Err(err) => {
                warn!("primary tier read failed (id={id}, tier=vector, err={err})");
                mark_if_unavailable(&self.health, TierKind::Vector, &err);
                None
            }
        }
    }

    /// Count a recall in the background, under the record lock so a
    /// concurrent forget cannot be undone by a late cache refill.
    ///
    /// With `repopulate` set, the cache is refilled from the updated durable
    /// copy using that TTL; otherwise the cached copy is updated in place.
    async fn queue_access(&self, id: RecordId, repopulate: Option<Option<Duration>>) {
        let tiers = self.tiers.clone();
        let health = self.health.clone();
        let locks = Arc::clone(&self.locks);
        let at = Utc::now();
        self.queue
            .submit("record_access", async move {
                let _guard = locks.lock(id).await;
                let update = RecordUpdate::Access { at };
                let updated = match tiers.durable.update(id, &update).await {
                    Ok(updated) => updated,
                    Err(err) => {
                        warn!("failed to count access (id={id}, err={err})");
                        mark_if_unavailable(&health, TierKind::Durable, &err);
                        return;
                    }
                };
                let snapshot = health.snapshot();
                if let Some(cache) = tiers.active(TierKind::Cache, &snapshot) {
                    let result = match (repopulate, updated.clone()) {
                        (Some(ttl), Some(record)) => cache.put(record, ttl).await,
                        (Some(_), None) => Ok(()),
                        (None, _) => cache.update(id, &update).await.map(|_| ()),
                    };
                    if let Err(err) = result {
                        warn!("cache refresh failed (id={id}, err={err})");
                        mark_if_unavailable(&health, TierKind::Cache, &err);
                    }
                }
                mirror_update(&tiers, &health, TierKind::Vector, id, &update).await;
            })
            .await;
    }

    /// Rank records by similarity to the query embedding.
    pub async fn search(&self, request: SearchRequest) -> Result<Vec<ScoredRecord>, MemoryError> {
        match self.default_timeout {
            Some(limit) => self.search_within(request, limit).await,
            None => self.search_now(request).await,
        }
    }

    /// `search` with an explicit deadline.
    pub async fn search_within(
        &self,
        request: SearchRequest,
        limit: Duration,
    ) -> Result<Vec<ScoredRecord>, MemoryError> {
        tokio::time::timeout(limit, self.search_now(request))
            .await
            .map_err(|_| MemoryError::Timeout(limit))?
    }

    async fn search_now(&self, request: SearchRequest) -> Result<Vec<ScoredRecord>, MemoryError> {
        validate_embedding(&request.embedding, self.dimension)?;
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let snapshot = self.health.snapshot();
        let categories = match request.category {
            Some(category) => vec![category],
            None => MemoryCategory::ALL.to_vec(),
        };
        let query = request.to_query();

        let mut delegated = None;
        if self.routing().fully_indexed(&categories) {
            if let Some(vector) = self.tiers.active(TierKind::Vector, &snapshot) {
                match vector.similarity_search(&query).await {
                    Ok(results) => delegated = Some(results),
                    Err(err) => {
                        warn!("vector search failed, scanning durable tier (err={err})");
                        mark_if_unavailable(&self.health, TierKind::Vector, &err);
                    }
                }
            }
        }

        let results = match delegated {
            Some(results) => results,
            None => {
                self.require_durable(&snapshot)?;
                let filter = ScanFilter {
                    categories: Some(categories),
                    ..ScanFilter::default()
                }
                .embedded();
                let records = self
                    .tiers
                    .durable
                    .scan(&filter)
                    .await
                    .map_err(|err| self.durable_error(err))?;
                debug!("brute-force search (candidates={})", records.len());
                brute_force(records, &query)
            }
        };

        let ids: Vec<RecordId> = results.iter().map(|scored| scored.record.id).collect();
        if !ids.is_empty() {
            self.queue_recalls(ids).await;
        }
        Ok(results)
    }

    async fn queue_recalls(&self, ids: Vec<RecordId>) {
        let tiers = self.tiers.clone();
        let health = self.health.clone();
        let locks = Arc::clone(&self.locks);
        let at = Utc::now();
        self.queue
            .submit("record_recall", async move {
                let update = RecordUpdate::Recall { at };
                for id in ids {
                    let _guard = locks.lock(id).await;
                    match tiers.durable.update(id, &update).await {
                        Ok(Some(_)) => {}
                        Ok(None) => continue,
                        Err(err) => {
                            warn!("failed to count recall (id={id}, err={err})");
                            mark_if_unavailable(&health, TierKind::Durable, &err);
                            return;
                        }
                    }
                    mirror_update(&tiers, &health, TierKind::Cache, id, &update).await;
                    mirror_update(&tiers, &health, TierKind::Vector, id, &update).await;
                }
            })
            .await;
    }
}

async fn mirror_update(
    tiers: &Tiers,
    health: &HealthMonitor,
    tier: TierKind,
    id: RecordId,
    update: &RecordUpdate,
) {
    let snapshot = health.snapshot();
    let Some(adapter) = tiers.active(tier, &snapshot) else {
        return;
    };
    if let Err(err) = adapter.update(id, update).await {
        warn!("mirrored update failed (id={id}, tier={tier}, err={err})");
        mark_if_unavailable(health, tier, &err);
    }
}

fn mark_if_unavailable(health: &HealthMonitor, tier: TierKind, err: &BackendError) {
    if matches!(err, BackendError::Unavailable(_)) {
        health.mark_unavailable(tier, &err.to_string());
    }
}
