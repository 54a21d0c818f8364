//! Decay, consolidation and eviction of short-lived memory.
//!
//! Importance decays lazily (see [`MemoryRecord::effective_importance`]); a
//! sweep only consolidates heavily used working records into a long-lived
//! sibling and evicts short-lived records that have lost their value.

use crate::backend::{ScanFilter, SqliteStore};
use crate::error::{BackendError, MemoryError, ValidationError};
use crate::model::{MemoryRecord, RecordUpdate};
use crate::store::HybridStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use mnemos_rs_protocol::{MemoryCategory, RecordId, TierKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lease name used for the periodic sweep.
pub const SWEEP_LEASE_NAME: &str = "lifecycle-sweep";
/// Tag prefix linking a consolidated sibling back to its source.
pub const CONSOLIDATED_FROM_TAG: &str = "consolidated-from";

/// Thresholds driving the sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecyclePolicy {
    /// Access count a working record must exceed to be consolidated.
    pub consolidation_threshold: u64,
    /// Category of siblings created by sweeps.
    pub consolidation_target: MemoryCategory,
    /// Importance floor for consolidated siblings.
    pub consolidated_min_importance: f32,
    /// Effective importance below which short-lived records are evicted.
    pub eviction_floor: f32,
    /// Validity of the sweep lease.
    pub lease_ttl: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            consolidation_threshold: 5,
            consolidation_target: MemoryCategory::Semantic,
            consolidated_min_importance: 0.6,
            eviction_floor: 0.05,
            lease_ttl: Duration::from_secs(10 * 60),
        }
    }
}

#[async_trait]
/// Mutual exclusion for sweeps across processes.
pub trait SweepLease: Send + Sync {
    /// Take or renew the lease. `false` means another holder owns it.
    async fn try_acquire(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, BackendError>;

    async fn release(&self, holder: &str) -> Result<(), BackendError>;
}

#[async_trait]
impl SweepLease for SqliteStore {
    async fn try_acquire(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        self.try_acquire_lease(SWEEP_LEASE_NAME, holder, now, ttl)
            .await
    }

    async fn release(&self, holder: &str) -> Result<(), BackendError> {
        self.release_lease(SWEEP_LEASE_NAME, holder).await
    }
}

/// Lease held in process memory, for stores without a shared durable tier.
#[derive(Debug, Default)]
pub struct InProcessLease {
    current: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl InProcessLease {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SweepLease for InProcessLease {
    async fn try_acquire(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|err| BackendError::Unavailable(format!("invalid lease ttl: {err}")))?;
        let mut current = self.current.lock();
        let free = match current.as_ref() {
            Some((owner, expires_at)) => owner == holder || *expires_at <= now,
            None => true,
        };
        if free {
            *current = Some((holder.to_string(), now + ttl));
        }
        Ok(free)
    }

    async fn release(&self, holder: &str) -> Result<(), BackendError> {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|(owner, _)| owner == holder) {
            *current = None;
        }
        Ok(())
    }
}

/// Source and sibling of one consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Consolidation {
    pub source: RecordId,
    pub sibling: RecordId,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// Short-lived records examined.
    pub scanned: usize,
    pub consolidated: Vec<Consolidation>,
    pub evicted: Vec<RecordId>,
    /// Another sweep held the lease; nothing was done.
    pub skipped: bool,
    /// Records whose action failed and will be retried next sweep.
    pub failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Consolidate,
    Evict,
}

/// Clears the in-process sweep flag when a sweep ends.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs sweeps against a hybrid store.
pub struct LifecycleManager {
    store: Arc<HybridStore>,
    policy: LifecyclePolicy,
    lease: Arc<dyn SweepLease>,
    holder: String,
    running: AtomicBool,
}

impl LifecycleManager {
    pub fn new(store: Arc<HybridStore>, policy: LifecyclePolicy, lease: Arc<dyn SweepLease>) -> Self {
        Self {
            store,
            policy,
            lease,
            holder: Uuid::new_v4().to_string(),
            running: AtomicBool::new(false),
        }
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Sweep using the wall clock.
    pub async fn sweep(&self) -> Result<SweepReport, MemoryError> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, MemoryError> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("sweep already running in process");
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        }
        let _running = Running(&self.running);

        let acquired = self
            .lease
            .try_acquire(&self.holder, now, self.policy.lease_ttl)
            .await
            .map_err(|err| MemoryError::unavailable(TierKind::Durable, &err))?;
        if !acquired {
            info!("sweep skipped, lease held elsewhere (holder={})", self.holder);
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        }

        let result = self.run_sweep(now).await;
        if let Err(err) = self.lease.release(&self.holder).await {
            warn!("failed to release sweep lease (holder={}, err={err})", self.holder);
        }
        let report = result?;
        info!(
            "sweep finished (scanned={}, consolidated={}, evicted={}, failures={})",
            report.scanned,
            report.consolidated.len(),
            report.evicted.len(),
            report.failures
        );
        Ok(report)
    }

    async fn run_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, MemoryError> {
        let snapshot = self.store.health();
        self.store.require_durable(&snapshot)?;
        let filter = ScanFilter {
            categories: Some(vec![MemoryCategory::Working, MemoryCategory::Episodic]),
            ..ScanFilter::default()
        };
        let records = self
            .store
            .durable()
            .scan(&filter)
            .await
            .map_err(|err| self.store.durable_error(err))?;

        let mut report = SweepReport {
            scanned: records.len(),
            ..SweepReport::default()
        };
        for record in records {
            let Some(action) = self.plan(&record, now) else {
                continue;
            };
            let outcome = match action {
                Action::Consolidate => self
                    .consolidate_planned(record.id, now)
                    .await
                    .map(|sibling| {
                        if let Some(sibling) = sibling {
                            report.consolidated.push(Consolidation {
                                source: record.id,
                                sibling,
                            });
                        }
                    }),
                Action::Evict => self.evict_planned(record.id, now).await.map(|evicted| {
                    if evicted {
                        report.evicted.push(record.id);
                    }
                }),
            };
            if let Err(err) = outcome {
                warn!("sweep action failed (id={}, action={action:?}, err={err})", record.id);
                report.failures += 1;
            }
        }
        Ok(report)
    }

    /// Decide what a sweep should do with a record at `now`.
    fn plan(&self, record: &MemoryRecord, now: DateTime<Utc>) -> Option<Action> {
        if !record.category.is_short_lived() {
            return None;
        }
        let routing = self.store.routing();
        let ttl = routing.route(record.category).cache_ttl;
        if record.category == MemoryCategory::Working {
            if !record.is_consolidated()
                && record.access_count > self.policy.consolidation_threshold
                && within_window(record, ttl, now)
            {
                return Some(Action::Consolidate);
            }
            if record.is_consolidated() && ttl.is_some() && !within_window(record, ttl, now) {
                return Some(Action::Evict);
            }
        }
        if record.effective_importance(now) < self.policy.eviction_floor {
            return Some(Action::Evict);
        }
        None
    }

    async fn consolidate_planned(
        &self,
        id: RecordId,
        now: DateTime<Utc>,
    ) -> Result<Option<RecordId>, MemoryError> {
        let _guard = self.store.locks().lock(id).await;
        let Some(current) = self.current(id).await? else {
            return Ok(None);
        };
        if self.plan(&current, now) != Some(Action::Consolidate) {
            return Ok(None);
        }
        let target = self.policy.consolidation_target;
        self.write_sibling(current, target, now).await.map(Some)
    }

    async fn evict_planned(&self, id: RecordId, now: DateTime<Utc>) -> Result<bool, MemoryError> {
        let _guard = self.store.locks().lock(id).await;
        let Some(current) = self.current(id).await? else {
            return Ok(false);
        };
        if self.plan(&current, now) != Some(Action::Evict) {
            return Ok(false);
        }
        match self.store.delete_everywhere(id).await {
            Ok(()) => {
                debug!(
                    "evicted memory record (id={id}, category={}, effective_importance={})",
                    current.category,
                    current.effective_importance(now)
                );
                Ok(true)
            }
            Err(MemoryError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Consolidate a working record into `target` now, regardless of usage.
    ///
    /// Returns the sibling id; consolidating twice returns the first sibling.
    pub async fn consolidate(
        &self,
        id: RecordId,
        target: MemoryCategory,
    ) -> Result<RecordId, MemoryError> {
        if target.is_short_lived() {
            return Err(ValidationError::InvalidConsolidationTarget(target).into());
        }
        let _guard = self.store.locks().lock(id).await;
        let current = self.current(id).await?.ok_or(MemoryError::NotFound(id))?;
        if current.category != MemoryCategory::Working {
            return Err(ValidationError::NotConsolidatable {
                id,
                category: current.category,
            }
            .into());
        }
        if let Some(sibling) = current.consolidated_into {
            return Ok(sibling);
        }
        self.write_sibling(current, target, Utc::now()).await
    }

    /// Durable copy of a record; corrupt rows count as missing.
    async fn current(&self, id: RecordId) -> Result<Option<MemoryRecord>, MemoryError> {
        match self.store.durable().get(id).await {
            Ok(record) => Ok(record),
            Err(BackendError::Corrupt { reason, .. }) => {
                warn!("corrupt record skipped by lifecycle (id={id}, reason={reason})");
                Ok(None)
            }
            Err(err) => Err(self.store.durable_error(err)),
        }
    }

    /// Create the long-lived sibling and mark the source. Caller holds the
    /// source lock.
    async fn write_sibling(
        &self,
        source: MemoryRecord,
        target: MemoryCategory,
        now: DateTime<Utc>,
    ) -> Result<RecordId, MemoryError> {
        let sibling = consolidated_sibling(&source, target, self.policy.consolidated_min_importance, now);
        let sibling_id = sibling.id;
        {
            let _sibling_guard = self.store.locks().lock(sibling_id).await;
            self.store.put_record(sibling, None).await?;
        }
        self.store
            .update_everywhere(
                source.id,
                &RecordUpdate::Consolidated {
                    into: sibling_id,
                    at: now,
                },
            )
            .await?;
        info!(
            "consolidated memory record (source={}, sibling={sibling_id}, target={target})",
            source.id
        );
        Ok(sibling_id)
    }

    /// Run sweeps every `interval` until the returned task is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep().await {
                    warn!("periodic sweep failed (err={err})");
                }
            }
        })
    }
}

/// Whether `now` falls inside the record's TTL window. No TTL means no limit.
fn within_window(record: &MemoryRecord, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
    let Some(ttl) = ttl else {
        return true;
    };
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => now < record.created_at + ttl,
        Err(_) => true,
    }
}

/// Build the long-lived copy of a working record.
/// Id of the consolidated copy of `source`.
///
/// Derived from the source id, so a consolidation retried after a failed
/// mark overwrites the copy it already wrote.
pub fn sibling_id(source: RecordId) -> RecordId {
    Uuid::new_v5(&source, b"consolidated")
}

fn consolidated_sibling(
    source: &MemoryRecord,
    target: MemoryCategory,
    min_importance: f32,
    now: DateTime<Utc>,
) -> MemoryRecord {
    let mut tags = source.tags.clone();
    tags.insert(format!("{CONSOLIDATED_FROM_TAG}:{}", source.id));
    MemoryRecord {
        id: sibling_id(source.id),
        content: source.content.clone(),
        embedding: source.embedding.clone(),
        importance: source.importance.max(min_importance),
        decay_rate: source.decay_rate,
        owner: source.owner.clone(),
        tags,
        category: target,
        created_at: now,
        accessed_at: now,
        updated_at: now,
        access_count: 0,
        recall_count: 0,
        consolidated_into: None,
    }
}
