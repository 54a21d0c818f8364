//! In-process vector tier answering exact cosine-similarity queries.

use super::{BackendAdapter, ScanFilter, SimilarityQuery};
use crate::error::BackendError;
use crate::model::{MemoryRecord, RecordUpdate, ScoredRecord};
use crate::search::{dot, normalize, rank};
use async_trait::async_trait;
use mnemos_rs_protocol::{BackendHealth, RecordId, TierKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Flat (exhaustive) similarity index.
///
/// Embeddings are normalised on insert so a query costs one dot product per
/// record. Records without a usable embedding are kept but never ranked.
#[derive(Debug, Default)]
pub struct FlatVectorIndex {
    entries: RwLock<HashMap<RecordId, IndexedRecord>>,
}

#[derive(Debug)]
struct IndexedRecord {
    record: MemoryRecord,
    unit: Option<Vec<f32>>,
}

impl IndexedRecord {
    fn new(record: MemoryRecord) -> Self {
        let unit = record.embedding.as_deref().and_then(normalize);
        Self { record, unit }
    }
}

impl FlatVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl BackendAdapter for FlatVectorIndex {
    fn tier(&self) -> TierKind {
        TierKind::Vector
    }

    async fn put(&self, record: MemoryRecord, _ttl: Option<Duration>) -> Result<(), BackendError> {
        self.entries
            .write()
            .insert(record.id, IndexedRecord::new(record));
        Ok(())
    }

    async fn get(&self, id: RecordId) -> Result<Option<MemoryRecord>, BackendError> {
        Ok(self
            .entries
            .read()
            .get(&id)
            .map(|entry| entry.record.clone()))
    }

    async fn delete(&self, id: RecordId) -> Result<bool, BackendError> {
        Ok(self.entries.write().remove(&id).is_some())
    }

    async fn update(
        &self,
        id: RecordId,
        update: &RecordUpdate,
    ) -> Result<Option<MemoryRecord>, BackendError> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&id) else {
            return Ok(None);
        };
        update.apply(&mut entry.record);
        Ok(Some(entry.record.clone()))
    }

    async fn similarity_search(
        &self,
        query: &SimilarityQuery,
    ) -> Result<Vec<ScoredRecord>, BackendError> {
        let Some(target) = normalize(&query.embedding) else {
            return Ok(Vec::new());
        };
        let entries = self.entries.read();
        let candidates = entries
            .values()
            .filter(|entry| {
                query
                    .category
                    .is_none_or(|category| entry.record.category == category)
            })
            .filter_map(|entry| {
                let unit = entry.unit.as_ref()?;
                Some(ScoredRecord {
                    record: entry.record.clone(),
                    similarity: dot(unit, &target),
                })
            })
            .collect();
        Ok(rank(candidates, query.min_similarity, query.limit))
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<MemoryRecord>, BackendError> {
        Ok(self
            .entries
            .read()
            .values()
            .filter(|entry| filter.matches(&entry.record))
            .map(|entry| entry.record.clone())
            .collect())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.entries.write().clear();
        Ok(())
    }

    async fn health(&self) -> BackendHealth {
        BackendHealth::Healthy
    }
}
