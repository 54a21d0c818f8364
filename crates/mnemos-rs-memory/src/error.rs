//! Error types for memory operations.

use mnemos_rs_protocol::{MemoryCategory, RecordId, TierKind};
use std::time::Duration;

/// Errors returned by the hybrid store to its callers.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Bad input; rejected before any backend is touched.
    #[error("invalid memory record: {0}")]
    Validation(#[from] ValidationError),
    /// A tier needed for the operation is down.
    #[error("{tier} tier unavailable: {reason}")]
    BackendUnavailable { tier: TierKind, reason: String },
    /// No record with this id exists (or its stored value was unreadable).
    #[error("memory record not found: {0}")]
    NotFound(RecordId),
    /// The caller-supplied deadline elapsed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The configured embedder failed.
    #[error("embedding error: {0}")]
    Embedding(String),
}

impl MemoryError {
    /// Build an unavailable error for a tier from a backend failure.
    pub(crate) fn unavailable(tier: TierKind, err: &BackendError) -> Self {
        MemoryError::BackendUnavailable {
            tier,
            reason: err.to_string(),
        }
    }
}

/// Input validation failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Content is empty or whitespace.
    #[error("content must not be empty")]
    EmptyContent,
    /// Importance outside `[0, 1]`.
    #[error("importance {0} is outside [0, 1]")]
    ImportanceOutOfRange(f32),
    /// Decay rate outside `[0, 1]`.
    #[error("decay rate {0} is outside [0, 1]")]
    DecayRateOutOfRange(f32),
    /// Embedding length differs from the deployment dimension.
    #[error("embedding has {actual} dimensions, expected {expected}")]
    EmbeddingDimension { expected: usize, actual: usize },
    /// Embedding contains NaN or infinity.
    #[error("embedding contains a non-finite component")]
    NonFiniteEmbedding,
    /// A record id was reused with a different category.
    #[error("record {id} already exists as {existing}, cannot store it as {requested}")]
    CategoryChanged {
        id: RecordId,
        existing: MemoryCategory,
        requested: MemoryCategory,
    },
    /// Consolidation can only target long-lived categories.
    #[error("cannot consolidate into {0}")]
    InvalidConsolidationTarget(MemoryCategory),
    /// Only working memory is consolidated.
    #[error("record {id} is {category}, only working memory is consolidated")]
    NotConsolidatable {
        id: RecordId,
        category: MemoryCategory,
    },
    /// A routing table row breaks a routing rule.
    #[error("invalid route for {category}: {reason}")]
    InvalidRoute {
        category: MemoryCategory,
        reason: &'static str,
    },
}

/// Errors returned by backend adapters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Transient infrastructure failure; callers treat it as absence.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// A stored value could not be decoded.
    #[error("corrupt value{}: {reason}", id.map(|id| format!(" for {id}")).unwrap_or_default())]
    Corrupt {
        id: Option<RecordId>,
        reason: String,
    },
    /// The adapter does not implement this capability.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl BackendError {
    pub(crate) fn corrupt(id: Option<RecordId>, reason: impl std::fmt::Display) -> Self {
        BackendError::Corrupt {
            id,
            reason: reason.to_string(),
        }
    }
}
