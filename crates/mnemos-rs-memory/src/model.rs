//! Memory record model shared by every tier.

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use mnemos_rs_protocol::{MemoryCategory, PersonaId, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Importance assigned when the caller does not supply one.
pub const DEFAULT_IMPORTANCE: f32 = 0.5;
/// Decay rate (per day) assigned when the caller does not supply one.
pub const DEFAULT_DECAY_RATE: f32 = 0.1;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Persisted memory record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    /// Record identifier.
    pub id: RecordId,
    /// Record content; never empty.
    pub content: String,
    /// Optional embedding with the deployment dimension.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Base importance in `[0, 1]`.
    pub importance: f32,
    /// Exponential decay rate per day in `[0, 1]`.
    pub decay_rate: f32,
    /// Persona the record is attributed to; informational only.
    #[serde(default)]
    pub owner: Option<PersonaId>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Category fixed at creation.
    pub category: MemoryCategory,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of direct recalls by id.
    #[serde(default)]
    pub access_count: u64,
    /// Number of times returned by similarity search.
    #[serde(default)]
    pub recall_count: u64,
    /// Sibling created when this record was consolidated.
    #[serde(default)]
    pub consolidated_into: Option<RecordId>,
}

impl MemoryRecord {
    /// Content length in characters.
    pub fn content_length(&self) -> usize {
        self.content.chars().count()
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }

    pub fn is_consolidated(&self) -> bool {
        self.consolidated_into.is_some()
    }

    /// Importance after exponential decay since the last access.
    ///
    /// Computed on demand; the stored `importance` is never rewritten. Times
    /// before `accessed_at` count as zero age.
    pub fn effective_importance(&self, now: DateTime<Utc>) -> f32 {
        let age_ms = (now - self.accessed_at).num_milliseconds().max(0) as f64;
        let age_days = age_ms / MILLIS_PER_DAY;
        let decayed = f64::from(self.importance) * (-f64::from(self.decay_rate) * age_days).exp();
        decayed as f32
    }
}

/// Request to create (or idempotently re-store) a memory record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRequest {
    pub id: Option<RecordId>,
    pub content: String,
    pub category: MemoryCategory,
    pub importance: Option<f32>,
    pub decay_rate: Option<f32>,
    pub embedding: Option<Vec<f32>>,
    pub owner: Option<PersonaId>,
    pub tags: BTreeSet<String>,
}

impl StoreRequest {
    /// Start a request with default importance and decay.
    pub fn new(content: impl Into<String>, category: MemoryCategory) -> Self {
        Self {
            id: None,
            content: content.into(),
            category,
            importance: None,
            decay_rate: None,
            embedding: None,
            owner: None,
            tags: BTreeSet::new(),
        }
    }

    /// Reuse a caller-chosen id; storing twice with the same id is an upsert.
    pub fn with_id(mut self, id: RecordId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_decay_rate(mut self, decay_rate: f32) -> Self {
        self.decay_rate = Some(decay_rate);
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<PersonaId>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Add tags to the request; duplicates collapse.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Check the request against the record invariants.
    pub fn validate(&self, dimension: usize) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        if let Some(importance) = self.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err(ValidationError::ImportanceOutOfRange(importance));
            }
        }
        if let Some(decay_rate) = self.decay_rate {
            if !(0.0..=1.0).contains(&decay_rate) {
                return Err(ValidationError::DecayRateOutOfRange(decay_rate));
            }
        }
        if let Some(embedding) = &self.embedding {
            validate_embedding(embedding, dimension)?;
        }
        Ok(())
    }

    /// Build the record this request describes, stamped at `now`.
    pub fn into_record(self, now: DateTime<Utc>) -> MemoryRecord {
        MemoryRecord {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            content: self.content,
            embedding: self.embedding,
            importance: self.importance.unwrap_or(DEFAULT_IMPORTANCE),
            decay_rate: self.decay_rate.unwrap_or(DEFAULT_DECAY_RATE),
            owner: self.owner,
            tags: self.tags,
            category: self.category,
            created_at: now,
            accessed_at: now,
            updated_at: now,
            access_count: 0,
            recall_count: 0,
            consolidated_into: None,
        }
    }
}

/// Check that an embedding has the deployment dimension and finite values.
pub fn validate_embedding(embedding: &[f32], dimension: usize) -> Result<(), ValidationError> {
    if embedding.len() != dimension {
        return Err(ValidationError::EmbeddingDimension {
            expected: dimension,
            actual: embedding.len(),
        });
    }
    if embedding.iter().any(|value| !value.is_finite()) {
        return Err(ValidationError::NonFiniteEmbedding);
    }
    Ok(())
}

/// Atomic in-place mutation applied by a tier.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordUpdate {
    /// Direct recall: bump `access_count`, refresh `accessed_at`.
    Access { at: DateTime<Utc> },
    /// Returned by search: bump `recall_count`, refresh `accessed_at`.
    Recall { at: DateTime<Utc> },
    /// Mark the record as consolidated into a sibling.
    Consolidated { into: RecordId, at: DateTime<Utc> },
    /// Drop the owner back-link.
    ClearOwner { at: DateTime<Utc> },
}

impl RecordUpdate {
    /// Apply the mutation to an in-memory copy of a record.
    pub fn apply(&self, record: &mut MemoryRecord) {
        match self {
            RecordUpdate::Access { at } => {
                record.access_count = record.access_count.saturating_add(1);
                record.accessed_at = *at;
            }
            RecordUpdate::Recall { at } => {
                record.recall_count = record.recall_count.saturating_add(1);
                record.accessed_at = *at;
            }
            RecordUpdate::Consolidated { into, at } => {
                record.consolidated_into = Some(*into);
                record.updated_at = *at;
            }
            RecordUpdate::ClearOwner { at } => {
                record.owner = None;
                record.updated_at = *at;
            }
        }
    }
}

/// A record paired with its similarity to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub similarity: f32,
}
