//! Tiered memory storage for Mnemos: record model, backend adapters,
//! routing, the hybrid orchestrator, similarity search and lifecycle sweeps.

pub mod backend;
pub mod embed;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod model;
pub mod routing;
pub mod search;
pub mod store;
pub mod tasks;

/// Backend adapter interface and built-in tiers.
pub use backend::{
    BackendAdapter, CategoryCounts, FlatVectorIndex, InMemoryCache, ScanFilter, SimilarityQuery,
    SqliteStore,
};
/// Pluggable embedding function.
pub use embed::Embedder;
/// Error types.
pub use error::{BackendError, MemoryError, ValidationError};
/// Tier health snapshots.
pub use health::{HealthMonitor, HealthSnapshot, MarkCounts};
/// Lifecycle sweeps.
pub use lifecycle::{
    Consolidation, InProcessLease, LifecycleManager, LifecyclePolicy, SweepLease, SweepReport,
};
/// Memory record model.
pub use model::{MemoryRecord, RecordUpdate, ScoredRecord, StoreRequest};
/// Category routing.
pub use routing::{Route, RoutingPolicy};
/// Similarity search request and scoring.
pub use search::{SearchRequest, cosine_similarity};
/// Hybrid orchestrator.
pub use store::{HybridStore, HybridStoreBuilder, StoreStats};
