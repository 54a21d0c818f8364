use async_trait::async_trait;
use mnemos_rs_memory::{
    BackendAdapter, BackendError, CategoryCounts, MemoryRecord, RecordUpdate, ScanFilter,
    ScoredRecord, SimilarityQuery,
};
use mnemos_rs_protocol::{BackendHealth, RecordId, TierKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    down: bool,
    fail_puts: bool,
    fail_updates: bool,
    delay: Option<Duration>,
    health_delay: Option<Duration>,
}

/// Adapter wrapper that injects outages, write failures and latency.
///
/// While `down`, every call fails with `BackendError::Unavailable` and
/// `health` reports `Unavailable`.
pub struct FaultyBackend {
    inner: Arc<dyn BackendAdapter>,
    faults: Mutex<Faults>,
    puts: AtomicUsize,
}

impl FaultyBackend {
    pub fn new(inner: Arc<dyn BackendAdapter>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.faults.lock().down = down;
    }

    /// Fail `put` only; reads keep working.
    pub fn fail_puts(&self, fail: bool) {
        self.faults.lock().fail_puts = fail;
    }

    /// Fail `update` only.
    pub fn fail_updates(&self, fail: bool) {
        self.faults.lock().fail_updates = fail;
    }

    /// Sleep before every call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.faults.lock().delay = delay;
    }

    /// Sleep before answering `health`.
    pub fn set_health_delay(&self, delay: Option<Duration>) {
        self.faults.lock().health_delay = delay;
    }

    /// Successful `put` calls so far.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &Arc<dyn BackendAdapter> {
        &self.inner
    }

    async fn enter(&self) -> Result<Faults, BackendError> {
        let faults = *self.faults.lock();
        if let Some(delay) = faults.delay {
            tokio::time::sleep(delay).await;
        }
        if faults.down {
            return Err(BackendError::Unavailable(format!(
                "{} tier is down",
                self.inner.tier()
            )));
        }
        Ok(faults)
    }
}

#[async_trait]
impl BackendAdapter for FaultyBackend {
    fn tier(&self) -> TierKind {
        self.inner.tier()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, record: MemoryRecord, ttl: Option<Duration>) -> Result<(), BackendError> {
        let faults = self.enter().await?;
        if faults.fail_puts {
            return Err(BackendError::Unavailable("injected write failure".to_string()));
        }
        self.inner.put(record, ttl).await?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, id: RecordId) -> Result<Option<MemoryRecord>, BackendError> {
        self.enter().await?;
        self.inner.get(id).await
    }

    async fn delete(&self, id: RecordId) -> Result<bool, BackendError> {
        self.enter().await?;
        self.inner.delete(id).await
    }

    async fn update(
        &self,
        id: RecordId,
        update: &RecordUpdate,
    ) -> Result<Option<MemoryRecord>, BackendError> {
        let faults = self.enter().await?;
        if faults.fail_updates {
            return Err(BackendError::Unavailable("injected update failure".to_string()));
        }
        self.inner.update(id, update).await
    }

    async fn similarity_search(
        &self,
        query: &SimilarityQuery,
    ) -> Result<Vec<ScoredRecord>, BackendError> {
        self.enter().await?;
        self.inner.similarity_search(query).await
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<MemoryRecord>, BackendError> {
        self.enter().await?;
        self.inner.scan(filter).await
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.enter().await?;
        self.inner.clear().await
    }

    async fn category_counts(&self) -> Result<CategoryCounts, BackendError> {
        self.enter().await?;
        self.inner.category_counts().await
    }

    async fn health(&self) -> BackendHealth {
        let delay = self.faults.lock().health_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.faults.lock().down {
            BackendHealth::Unavailable
        } else {
            self.inner.health().await
        }
    }
}
