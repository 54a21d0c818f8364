//! Similarity scoring and ranking shared by every search path.

use crate::backend::SimilarityQuery;
use crate::model::{MemoryRecord, ScoredRecord};
use mnemos_rs_protocol::MemoryCategory;
use std::cmp::Ordering;

/// Results returned when the caller gives no limit.
pub const DEFAULT_SEARCH_LIMIT: usize = 10;
/// Similarity threshold used when the caller gives none.
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.0;

/// Similarity search request.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub embedding: Vec<f32>,
    pub limit: usize,
    /// Results must score strictly above this.
    pub min_similarity: f32,
    pub category: Option<MemoryCategory>,
}

impl SearchRequest {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            limit: DEFAULT_SEARCH_LIMIT,
            min_similarity: DEFAULT_MIN_SIMILARITY,
            category: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_min_similarity(mut self, min_similarity: f32) -> Self {
        self.min_similarity = min_similarity;
        self
    }

    pub fn with_category(mut self, category: MemoryCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub(crate) fn to_query(&self) -> SimilarityQuery {
        SimilarityQuery {
            embedding: self.embedding.clone(),
            limit: self.limit,
            min_similarity: self.min_similarity,
            category: self.category,
        }
    }
}

/// Scale a vector to unit length. `None` for zero or non-finite norms.
pub fn normalize(vector: &[f32]) -> Option<Vec<f32>> {
    let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    Some(vector.iter().map(|value| value / norm).collect())
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Cosine similarity, i.e. `1 - cosine_distance`. Zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    match (normalize(a), normalize(b)) {
        (Some(a), Some(b)) => dot(&a, &b),
        _ => 0.0,
    }
}

/// Filter by threshold, order by similarity then recency, truncate.
pub fn rank(mut candidates: Vec<ScoredRecord>, min_similarity: f32, limit: usize) -> Vec<ScoredRecord> {
    candidates.retain(|candidate| candidate.similarity > min_similarity);
    candidates.sort_by(compare_scored);
    candidates.truncate(limit);
    candidates
}

fn compare_scored(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| b.record.created_at.cmp(&a.record.created_at))
        .then_with(|| a.record.id.cmp(&b.record.id))
}

/// Score every record against the query in process. O(n).
pub fn brute_force(records: Vec<MemoryRecord>, query: &SimilarityQuery) -> Vec<ScoredRecord> {
    let Some(target) = normalize(&query.embedding) else {
        return Vec::new();
    };
    let candidates = records
        .into_iter()
        .filter(|record| query.category.is_none_or(|category| record.category == category))
        .filter_map(|record| {
            let unit = normalize(record.embedding.as_deref()?)?;
            let similarity = dot(&unit, &target);
            Some(ScoredRecord { record, similarity })
        })
        .collect();
    rank(candidates, query.min_similarity, query.limit)
}
