//! Write paths: store, forget and tier-wide updates.

use super::HybridStore;
use crate::error::{BackendError, MemoryError, ValidationError};
use crate::model::{MemoryRecord, RecordUpdate, StoreRequest, validate_embedding};
use crate::routing::Route;
use chrono::Utc;
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use mnemos_rs_protocol::{RecordId, TierKind};
use std::time::Duration;
use uuid::Uuid;

type TierOutcome<T> = (TierKind, Result<T, BackendError>);

impl HybridStore {
    /// Validate and persist a record, returning its id.
    ///
    /// Succeeds once the durable tier has the record; cache and vector
    /// failures only take those tiers out of routing.
    pub async fn store(&self, request: StoreRequest) -> Result<RecordId, MemoryError> {
        match self.default_timeout {
            Some(limit) => self.store_within(request, limit).await,
            None => self.store_now(request).await,
        }
    }

    /// `store` with an explicit deadline. Tier writes already started keep
    /// running after a timeout.
    pub async fn store_within(
        &self,
        request: StoreRequest,
        limit: Duration,
    ) -> Result<RecordId, MemoryError> {
        tokio::time::timeout(limit, self.store_now(request))
            .await
            .map_err(|_| MemoryError::Timeout(limit))?
    }

    async fn store_now(&self, mut request: StoreRequest) -> Result<RecordId, MemoryError> {
        request.validate(self.dimension)?;
        if request.embedding.is_none() {
            if let Some(embedder) = &self.embedder {
                let embedding = embedder.embed(&request.content).await?;
                validate_embedding(&embedding, self.dimension)?;
                request.embedding = Some(embedding);
            }
        }

        let snapshot = self.health.snapshot();
        self.require_durable(&snapshot)?;

        let explicit_id = request.id.is_some();
        let id = *request.id.get_or_insert_with(Uuid::new_v4);
        let _guard = self.locks.lock(id).await;

        let mut record = request.into_record(Utc::now());
        let previous = if explicit_id {
            self.existing_version(&mut record).await?
        } else {
            None
        };

        let category = record.category;
        self.put_record(record, previous).await?;
        info!("stored memory record (id={id}, category={category})");
        Ok(id)
    }

    /// Carry history over from an earlier version stored under the same id.
    async fn existing_version(
        &self,
        record: &mut MemoryRecord,
    ) -> Result<Option<MemoryRecord>, MemoryError> {
        let existing = match self.tiers.durable.get(record.id).await {
            Ok(existing) => existing,
            Err(BackendError::Corrupt { reason, .. }) => {
                warn!("overwriting corrupt durable record (id={}, reason={reason})", record.id);
                None
            }
            Err(err) => return Err(self.durable_error(err)),
        };
        let Some(existing) = existing else {
            return Ok(None);
        };
        if existing.category != record.category {
            return Err(ValidationError::CategoryChanged {
                id: record.id,
                existing: existing.category,
                requested: record.category,
            }
            .into());
        }
        record.created_at = existing.created_at;
        record.accessed_at = existing.accessed_at;
        record.access_count = existing.access_count;
        record.recall_count = existing.recall_count;
        record.consolidated_into = existing.consolidated_into;
        Ok(Some(existing))
    }

    /// Fan a record out to the active tiers of its route.
    ///
    /// Callers hold the record lock. If the durable write fails, writes that
    /// landed elsewhere are rolled back to `previous` (or deleted).
    pub(crate) async fn put_record(
        &self,
        record: MemoryRecord,
        previous: Option<MemoryRecord>,
    ) -> Result<(), MemoryError> {
        let snapshot = self.health.snapshot();
        self.require_durable(&snapshot)?;
        let route = self.routing().route(record.category).clone();
        let id = record.id;

        let handles = route
            .write
            .iter()
            .filter_map(|tier| {
                let adapter = self.tiers.active(*tier, &snapshot)?;
                let adapter = adapter.clone();
                let record = record.clone();
                let ttl = tier_ttl(*tier, &route);
                let tier = *tier;
                Some(async move {
                    let outcome = tokio::spawn(async move { adapter.put(record, ttl).await }).await;
                    (tier, flatten_join(outcome))
                })
            })
            .collect::<Vec<_>>();
        let outcomes: Vec<TierOutcome<()>> = join_all(handles).await;

        let durable_failure = outcomes.iter().find_map(|(tier, result)| match result {
            Err(err) if *tier == TierKind::Durable => Some(err.clone()),
            _ => None,
        });
        let Some(err) = durable_failure else {
            for (tier, result) in &outcomes {
                if let Err(err) = result {
                    warn!("degraded write (id={id}, tier={tier}, err={err})");
                    self.health.mark_unavailable(*tier, &err.to_string());
                }
            }
            return Ok(());
        };

        error!("durable write failed (id={id}, err={err})");
        let landed: Vec<TierKind> = outcomes
            .iter()
            .filter(|(tier, result)| *tier != TierKind::Durable && result.is_ok())
            .map(|(tier, _)| *tier)
            .collect();
        self.roll_back(id, &landed, previous, &route).await;
        Err(self.durable_error(err))
    }

    /// Undo non-durable writes after a failed durable write.
    async fn roll_back(
        &self,
        id: RecordId,
        tiers: &[TierKind],
        previous: Option<MemoryRecord>,
        route: &Route,
    ) {
        for tier in tiers {
            let Some(adapter) = self.tiers.get(*tier) else {
                continue;
            };
            let result = match &previous {
                Some(previous) => adapter.put(previous.clone(), tier_ttl(*tier, route)).await,
                None => adapter.delete(id).await.map(|_| ()),
            };
            if let Err(err) = result {
                warn!("rollback failed (id={id}, tier={tier}, err={err})");
                self.health.mark_unavailable(*tier, &err.to_string());
            }
        }
    }

    /// Delete a record from every tier.
    pub async fn forget(&self, id: RecordId) -> Result<(), MemoryError> {
        let _guard = self.locks.lock(id).await;
        self.delete_everywhere(id).await
    }

    /// Delete from every active tier; the caller holds the record lock.
    pub(crate) async fn delete_everywhere(&self, id: RecordId) -> Result<(), MemoryError> {
        let snapshot = self.health.snapshot();
        self.require_durable(&snapshot)?;

        let deletes = TierKind::ALL
            .into_iter()
            .filter_map(|tier| {
                let adapter = self.tiers.active(tier, &snapshot)?.clone();
                Some(async move {
                    let outcome = tokio::spawn(async move { adapter.delete(id).await }).await;
                    (tier, flatten_join(outcome))
                })
            })
            .collect::<Vec<_>>();
        let outcomes: Vec<TierOutcome<bool>> = join_all(deletes).await;

        let mut existed = false;
        let mut durable_failure = None;
        for (tier, result) in outcomes {
            match result {
                Ok(found) => existed |= found,
                Err(err) if tier == TierKind::Durable => durable_failure = Some(err),
                Err(err) => {
                    warn!("forget skipped tier (id={id}, tier={tier}, err={err})");
                    self.health.mark_unavailable(tier, &err.to_string());
                }
            }
        }
        if let Some(err) = durable_failure {
            return Err(self.durable_error(err));
        }
        if !existed {
            debug!("forget found nothing (id={id})");
            return Err(MemoryError::NotFound(id));
        }
        info!("forgot memory record (id={id})");
        Ok(())
    }

    /// Apply an update on the durable tier, then mirror it to the others.
    ///
    /// Returns the durable copy after the update, or `None` if the durable
    /// tier does not hold the record.
    pub(crate) async fn update_everywhere(
        &self,
        id: RecordId,
        update: &RecordUpdate,
    ) -> Result<Option<MemoryRecord>, MemoryError> {
        let snapshot = self.health.snapshot();
        self.require_durable(&snapshot)?;
        let updated = self
            .tiers
            .durable
            .update(id, update)
            .await
            .map_err(|err| self.durable_error(err))?;
        if updated.is_none() {
            return Ok(None);
        }
        for tier in [TierKind::Cache, TierKind::Vector] {
            let Some(adapter) = self.tiers.active(tier, &snapshot) else {
                continue;
            };
            if let Err(err) = adapter.update(id, update).await {
                warn!("mirrored update failed (id={id}, tier={tier}, err={err})");
                self.health.mark_unavailable(tier, &err.to_string());
            }
        }
        Ok(updated)
    }
}

/// TTL handed to a tier: only the cache expires entries.
pub(crate) fn tier_ttl(tier: TierKind, route: &Route) -> Option<Duration> {
    if tier == TierKind::Cache {
        route.cache_ttl
    } else {
        None
    }
}

pub(crate) fn flatten_join<T>(
    outcome: Result<Result<T, BackendError>, tokio::task::JoinError>,
) -> Result<T, BackendError> {
    outcome.unwrap_or_else(|err| Err(BackendError::Unavailable(format!("tier task failed: {err}"))))
}
