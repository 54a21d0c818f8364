use crate::FaultyBackend;
use mnemos_rs_memory::{
    FlatVectorIndex, HybridStore, HybridStoreBuilder, InMemoryCache, SqliteStore, StoreRequest,
};
use mnemos_rs_protocol::MemoryCategory;
use std::sync::Arc;

/// Embedding width used by the harness.
pub const TEST_DIMENSION: usize = 3;

/// A store over real tiers, each wrapped in a [`FaultyBackend`].
pub struct Harness {
    pub store: Arc<HybridStore>,
    pub cache: Arc<FaultyBackend>,
    pub vector: Arc<FaultyBackend>,
    pub durable: Arc<FaultyBackend>,
    pub raw_cache: Arc<InMemoryCache>,
    pub sqlite: Arc<SqliteStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    /// Build with extra builder settings, e.g. a timeout or routing table.
    pub fn with(configure: impl FnOnce(HybridStoreBuilder) -> HybridStoreBuilder) -> Self {
        let sqlite = Arc::new(SqliteStore::open_in_memory().expect("sqlite"));
        Self::over(sqlite, configure)
    }

    /// Build around an existing durable store.
    pub fn over(
        sqlite: Arc<SqliteStore>,
        configure: impl FnOnce(HybridStoreBuilder) -> HybridStoreBuilder,
    ) -> Self {
        let raw_cache = Arc::new(InMemoryCache::new(128));
        let cache = Arc::new(FaultyBackend::new(raw_cache.clone()));
        let vector = Arc::new(FaultyBackend::new(Arc::new(FlatVectorIndex::new())));
        let durable = Arc::new(FaultyBackend::new(sqlite.clone()));
        let builder = HybridStore::builder(durable.clone())
            .cache(cache.clone())
            .vector(vector.clone())
            .embedding_dimension(TEST_DIMENSION);
        let store = configure(builder).build().expect("store");
        Self {
            store: Arc::new(store),
            cache,
            vector,
            durable,
            raw_cache,
            sqlite,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Request with a fixed embedding of [`TEST_DIMENSION`] width.
pub fn request(content: &str, category: MemoryCategory, embedding: [f32; 3]) -> StoreRequest {
    StoreRequest::new(content, category).with_embedding(embedding.to_vec())
}
