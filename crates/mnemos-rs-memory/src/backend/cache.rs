//! Volatile cache tier: TTL-bearing, capacity-bounded, JSON-encoded values.

use super::{BackendAdapter, ScanFilter};
use crate::error::BackendError;
use crate::model::{MemoryRecord, RecordUpdate};
use async_trait::async_trait;
use log::{debug, warn};
use mnemos_rs_protocol::{BackendHealth, RecordId, TierKind};
use moka::Expiry;
use moka::notification::RemovalCause;
use moka::ops::compute::Op;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// In-process key-value cache.
///
/// Values are kept as serialized bytes, the way an external cache server
/// holds them, so decoding can fail and is reported as `Corrupt`. Capacity
/// and per-entry expiry are enforced by `moka`.
pub struct InMemoryCache {
    entries: Cache<RecordId, CachedValue>,
}

#[derive(Clone)]
struct CachedValue {
    bytes: Arc<[u8]>,
    expiration: Expiration,
}

#[derive(Clone, Copy)]
enum Expiration {
    /// Start a new lifetime on write.
    Fresh(Option<Duration>),
    /// In-place rewrite; the entry keeps its current deadline.
    Keep,
}

struct RouteExpiry;

impl Expiry<RecordId, CachedValue> for RouteExpiry {
    fn expire_after_create(
        &self,
        _id: &RecordId,
        value: &CachedValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        match value.expiration {
            Expiration::Fresh(ttl) => ttl,
            Expiration::Keep => None,
        }
    }

    fn expire_after_update(
        &self,
        _id: &RecordId,
        value: &CachedValue,
        _updated_at: Instant,
        duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        match value.expiration {
            Expiration::Fresh(ttl) => ttl,
            Expiration::Keep => duration_until_expiry,
        }
    }
}

impl std::fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("capacity", &self.entries.policy().max_capacity())
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl InMemoryCache {
    /// Create a cache that holds at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity.max(1) as u64)
            .expire_after(RouteExpiry)
            .eviction_listener(|id, _value, cause| {
                if cause == RemovalCause::Size {
                    debug!("cache evicted entry over capacity (id={id})");
                }
            })
            .build();
        Self { entries }
    }

    /// Store already-encoded bytes under an id.
    ///
    /// Mirrors a value written by another client of a shared cache.
    pub fn put_raw(&self, id: RecordId, bytes: Vec<u8>, ttl: Option<Duration>) {
        self.entries.insert(
            id,
            CachedValue {
                bytes: bytes.into(),
                expiration: Expiration::Fresh(ttl),
            },
        );
    }

    /// Number of live entries after pending evictions are applied.
    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn encode(record: &MemoryRecord) -> Result<Vec<u8>, BackendError> {
    serde_json::to_vec(record).map_err(|err| BackendError::corrupt(Some(record.id), err))
}

fn decode(id: RecordId, bytes: &[u8]) -> Result<MemoryRecord, BackendError> {
    serde_json::from_slice(bytes).map_err(|err| BackendError::corrupt(Some(id), err))
}

#[async_trait]
impl BackendAdapter for InMemoryCache {
    fn tier(&self) -> TierKind {
        TierKind::Cache
    }

    async fn put(&self, record: MemoryRecord, ttl: Option<Duration>) -> Result<(), BackendError> {
        let bytes = encode(&record)?;
        self.put_raw(record.id, bytes, ttl);
        Ok(())
    }

    async fn get(&self, id: RecordId) -> Result<Option<MemoryRecord>, BackendError> {
        match self.entries.get(&id) {
            Some(value) => decode(id, &value.bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: RecordId) -> Result<bool, BackendError> {
        Ok(self.entries.remove(&id).is_some())
    }

    async fn update(
        &self,
        id: RecordId,
        update: &RecordUpdate,
    ) -> Result<Option<MemoryRecord>, BackendError> {
        let mut outcome = Ok(None);
        self.entries.entry(id).and_compute_with(|existing| {
            let Some(existing) = existing else {
                return Op::Nop;
            };
            let rewritten = decode(id, &existing.value().bytes).and_then(|mut record| {
                update.apply(&mut record);
                encode(&record).map(|bytes| (record, bytes))
            });
            match rewritten {
                Ok((record, bytes)) => {
                    outcome = Ok(Some(record));
                    Op::Put(CachedValue {
                        bytes: bytes.into(),
                        expiration: Expiration::Keep,
                    })
                }
                Err(err) => {
                    outcome = Err(err);
                    Op::Nop
                }
            }
        });
        outcome
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<MemoryRecord>, BackendError> {
        let mut records = Vec::new();
        for (id, value) in self.entries.iter() {
            match decode(*id, &value.bytes) {
                Ok(record) if filter.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(err) => warn!("skipping corrupt cache entry (id={id}, err={err})"),
            }
        }
        Ok(records)
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.entries.invalidate_all();
        Ok(())
    }

    async fn health(&self) -> BackendHealth {
        BackendHealth::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StoreRequest;
    use chrono::Utc;
    use mnemos_rs_protocol::MemoryCategory;
    use pretty_assertions::assert_eq;

    fn record(content: &str) -> MemoryRecord {
        StoreRequest::new(content, MemoryCategory::Working).into_record(Utc::now())
    }

    #[tokio::test]
    async fn put_get_delete() {
        let cache = InMemoryCache::new(4);
        let record = record("hello");
        cache.put(record.clone(), None).await.expect("put");
        assert_eq!(cache.get(record.id).await.expect("get"), Some(record.clone()));
        assert!(cache.delete(record.id).await.expect("delete"));
        assert!(!cache.delete(record.id).await.expect("delete again"));
        assert_eq!(cache.get(record.id).await.expect("get"), None);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryCache::new(4);
        let short = record("short lived");
        let pinned = record("no ttl");
        cache
            .put(short.clone(), Some(Duration::from_millis(50)))
            .await
            .expect("put");
        cache.put(pinned.clone(), None).await.expect("put");
        assert!(cache.get(short.id).await.expect("get").is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get(short.id).await.expect("get").is_none());
        assert!(cache.get(pinned.id).await.expect("get").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn in_place_update_keeps_the_deadline() {
        let cache = InMemoryCache::new(4);
        let record = record("counted then expired");
        cache
            .put(record.clone(), Some(Duration::from_millis(100)))
            .await
            .expect("put");
        tokio::time::sleep(Duration::from_millis(60)).await;
        cache
            .update(record.id, &RecordUpdate::Access { at: Utc::now() })
            .await
            .expect("update")
            .expect("present");

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(cache.get(record.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let cache = InMemoryCache::new(2);
        for n in 0..10 {
            cache.put(record(&format!("entry {n}")), None).await.expect("put");
        }
        assert!(cache.len() <= 2);
    }

    #[tokio::test]
    async fn undecodable_value_is_corrupt() {
        let cache = InMemoryCache::new(2);
        let id = uuid::Uuid::new_v4();
        cache.put_raw(id, b"{not json".to_vec(), None);
        let err = cache.get(id).await.unwrap_err();
        assert!(matches!(err, BackendError::Corrupt { id: Some(found), .. } if found == id));
    }

    #[tokio::test]
    async fn update_mutates_in_place() {
        let cache = InMemoryCache::new(2);
        let record = record("counted");
        cache.put(record.clone(), None).await.expect("put");
        let updated = cache
            .update(record.id, &RecordUpdate::Access { at: Utc::now() })
            .await
            .expect("update")
            .expect("present");
        assert_eq!(updated.access_count, 1);
        let stored = cache.get(record.id).await.expect("get").expect("present");
        assert_eq!(stored.access_count, 1);
        let missing = cache
            .update(uuid::Uuid::new_v4(), &RecordUpdate::Access { at: Utc::now() })
            .await
            .expect("update");
        assert!(missing.is_none());
    }
}
