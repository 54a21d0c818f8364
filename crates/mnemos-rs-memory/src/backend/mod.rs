//! Backend adapter interface and the built-in tiers.

mod cache;
mod sqlite;
mod vector;

pub use cache::InMemoryCache;
pub use sqlite::SqliteStore;
pub use vector::FlatVectorIndex;

use crate::error::BackendError;
use crate::model::{MemoryRecord, RecordUpdate, ScoredRecord};
use async_trait::async_trait;
use mnemos_rs_protocol::{BackendHealth, MemoryCategory, PersonaId, RecordId, TierKind};
use std::collections::BTreeMap;
use std::time::Duration;

/// Record counts keyed by category.
pub type CategoryCounts = BTreeMap<MemoryCategory, u64>;

#[async_trait]
/// Uniform interface over one storage tier.
///
/// Adapters report transient failures as `BackendError::Unavailable` and
/// undecodable values as `BackendError::Corrupt`; the orchestrator decides
/// how each is surfaced.
pub trait BackendAdapter: Send + Sync {
    /// Which tier this adapter plays.
    fn tier(&self) -> TierKind;

    /// Human-readable adapter name for logs.
    fn name(&self) -> &str {
        self.tier().as_str()
    }

    /// Insert or replace a record. `ttl` is honoured by caching tiers only.
    async fn put(&self, record: MemoryRecord, ttl: Option<Duration>) -> Result<(), BackendError>;

    async fn get(&self, id: RecordId) -> Result<Option<MemoryRecord>, BackendError>;

    /// Remove a record, reporting whether it existed.
    async fn delete(&self, id: RecordId) -> Result<bool, BackendError>;

    /// Apply an in-place mutation atomically, returning the updated record.
    ///
    /// Returns `Ok(None)` when the tier does not hold the record.
    async fn update(
        &self,
        id: RecordId,
        update: &RecordUpdate,
    ) -> Result<Option<MemoryRecord>, BackendError>;

    /// Rank stored records by cosine similarity to the query.
    async fn similarity_search(
        &self,
        _query: &SimilarityQuery,
    ) -> Result<Vec<ScoredRecord>, BackendError> {
        Err(BackendError::Unsupported("similarity_search"))
    }

    /// Snapshot the records matching a filter.
    async fn scan(&self, _filter: &ScanFilter) -> Result<Vec<MemoryRecord>, BackendError> {
        Err(BackendError::Unsupported("scan"))
    }

    /// Drop every record held by the tier.
    async fn clear(&self) -> Result<(), BackendError>;

    /// Count records per category.
    async fn category_counts(&self) -> Result<CategoryCounts, BackendError> {
        let records = self.scan(&ScanFilter::default()).await?;
        let mut counts = CategoryCounts::new();
        for record in records {
            *counts.entry(record.category).or_default() += 1;
        }
        Ok(counts)
    }

    async fn health(&self) -> BackendHealth;
}

/// Similarity query handed to a vector-capable tier.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityQuery {
    pub embedding: Vec<f32>,
    pub limit: usize,
    /// Only similarities strictly above this value are returned.
    pub min_similarity: f32,
    pub category: Option<MemoryCategory>,
}

/// Filter for `scan`. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanFilter {
    pub categories: Option<Vec<MemoryCategory>>,
    pub owner: Option<PersonaId>,
    /// Only records carrying an embedding.
    pub with_embedding: bool,
}

impl ScanFilter {
    pub fn category(category: MemoryCategory) -> Self {
        Self {
            categories: Some(vec![category]),
            ..Self::default()
        }
    }

    pub fn owner(owner: impl Into<PersonaId>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Self::default()
        }
    }

    /// Restrict the scan to records with embeddings.
    pub fn embedded(mut self) -> Self {
        self.with_embedding = true;
        self
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(categories) = &self.categories {
            if !categories.contains(&record.category) {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if record.owner.as_ref() != Some(owner) {
                return false;
            }
        }
        !self.with_embedding || record.has_embedding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StoreRequest;
    use chrono::Utc;

    #[test]
    fn scan_filter_combines_conditions() {
        let record = StoreRequest::new("fact", MemoryCategory::Semantic)
            .with_owner("ada")
            .into_record(Utc::now());

        assert!(ScanFilter::default().matches(&record));
        assert!(ScanFilter::category(MemoryCategory::Semantic).matches(&record));
        assert!(!ScanFilter::category(MemoryCategory::Working).matches(&record));
        assert!(ScanFilter::owner("ada").matches(&record));
        assert!(!ScanFilter::owner("grace").matches(&record));
        assert!(!ScanFilter::owner("ada").embedded().matches(&record));
    }
}
