use super::*;
use crate::backend::{FlatVectorIndex, InMemoryCache, SqliteStore};
use crate::error::ValidationError;
use crate::model::{ScoredRecord, StoreRequest};
use crate::routing::Route;
use crate::search::SearchRequest;
use async_trait::async_trait;
use mnemos_rs_protocol::{MemoryCategory, RecordId};
use pretty_assertions::assert_eq;

struct Fixture {
    store: HybridStore,
    cache: Arc<InMemoryCache>,
    vector: Arc<FlatVectorIndex>,
    durable: Arc<SqliteStore>,
}

fn fixture() -> Fixture {
    let cache = Arc::new(InMemoryCache::new(64));
    let vector = Arc::new(FlatVectorIndex::new());
    let durable = Arc::new(SqliteStore::open_in_memory().expect("sqlite"));
    let store = HybridStore::builder(durable.clone())
        .cache(cache.clone())
        .vector(vector.clone())
        .embedding_dimension(3)
        .build()
        .expect("store");
    Fixture {
        store,
        cache,
        vector,
        durable,
    }
}

async fn store_text(store: &HybridStore, content: &str, category: MemoryCategory) -> RecordId {
    store
        .store(StoreRequest::new(content, category).with_embedding(vec![1.0, 0.0, 0.0]))
        .await
        .expect("store")
}

#[tokio::test]
async fn write_fans_out_to_route_tiers() {
    let fx = fixture();
    let working = store_text(&fx.store, "scratch", MemoryCategory::Working).await;
    let fact = store_text(&fx.store, "fact", MemoryCategory::Semantic).await;

    assert!(fx.cache.get(working).await.expect("cache").is_some());
    assert!(fx.vector.get(working).await.expect("vector").is_some());
    assert!(fx.durable.get(working).await.expect("durable").is_some());

    assert!(fx.cache.get(fact).await.expect("cache").is_none());
    assert!(fx.vector.get(fact).await.expect("vector").is_some());
    assert!(fx.durable.get(fact).await.expect("durable").is_some());
}

#[tokio::test]
async fn recall_returns_stored_content() {
    let fx = fixture();
    let id = store_text(&fx.store, "the launch code is 42", MemoryCategory::Episodic).await;
    let record = fx.store.recall(id).await.expect("recall");
    assert_eq!(record.content, "the launch code is 42");
    assert_eq!(record.category, MemoryCategory::Episodic);
}

#[tokio::test]
async fn consecutive_recalls_differ_only_in_access_fields() {
    let fx = fixture();
    let id = store_text(&fx.store, "stable", MemoryCategory::Semantic).await;

    let first = fx.store.recall(id).await.expect("first");
    fx.store.flush().await;
    let second = fx.store.recall(id).await.expect("second");
    fx.store.flush().await;

    assert_eq!(second.access_count, first.access_count + 1);
    let normalize = |mut record: MemoryRecord| {
        record.access_count = 0;
        record.accessed_at = record.created_at;
        record
    };
    assert_eq!(normalize(first), normalize(second));
}

#[tokio::test]
async fn miss_repopulates_cache_with_counter() {
    let fx = fixture();
    let id = store_text(&fx.store, "warm me", MemoryCategory::Working).await;
    fx.cache.clear().await.expect("clear");

    fx.store.recall(id).await.expect("recall");
    fx.store.flush().await;

    let cached = fx.cache.get(id).await.expect("cache").expect("repopulated");
    assert_eq!(cached.access_count, 1);
    let stats = fx.store.stats().await;
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 0);
}

#[tokio::test]
async fn semantic_records_are_never_cached_on_read() {
    let fx = fixture();
    let id = store_text(&fx.store, "fact", MemoryCategory::Semantic).await;
    fx.store.recall(id).await.expect("recall");
    fx.store.flush().await;
    assert!(fx.cache.get(id).await.expect("cache").is_none());
}

#[tokio::test]
async fn recall_unknown_id_is_not_found() {
    let fx = fixture();
    let id = uuid::Uuid::new_v4();
    let err = fx.store.recall(id).await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound(found) if found == id));
}

#[tokio::test]
async fn forget_removes_from_every_tier() {
    let fx = fixture();
    let id = store_text(&fx.store, "secret", MemoryCategory::Working).await;
    fx.store.forget(id).await.expect("forget");

    assert!(fx.cache.get(id).await.expect("cache").is_none());
    assert!(fx.vector.get(id).await.expect("vector").is_none());
    assert!(fx.durable.get(id).await.expect("durable").is_none());
    assert!(matches!(
        fx.store.recall(id).await,
        Err(MemoryError::NotFound(_))
    ));
    let results = fx
        .store
        .search(SearchRequest::new(vec![1.0, 0.0, 0.0]))
        .await
        .expect("search");
    assert!(results.is_empty());
    assert!(matches!(
        fx.store.forget(id).await,
        Err(MemoryError::NotFound(_))
    ));
}

#[tokio::test]
async fn restore_with_same_id_keeps_history() {
    let fx = fixture();
    let id = store_text(&fx.store, "v1", MemoryCategory::Episodic).await;
    fx.store.recall(id).await.expect("recall");
    fx.store.flush().await;
    let before = fx.durable.get(id).await.expect("get").expect("present");

    fx.store
        .store(StoreRequest::new("v2", MemoryCategory::Episodic).with_id(id))
        .await
        .expect("restore");
    let after = fx.durable.get(id).await.expect("get").expect("present");
    assert_eq!(after.content, "v2");
    assert_eq!(after.created_at, before.created_at);
    assert_eq!(after.access_count, 1);
}

#[tokio::test]
async fn restore_cannot_change_category() {
    let fx = fixture();
    let id = store_text(&fx.store, "v1", MemoryCategory::Working).await;
    let err = fx
        .store
        .store(StoreRequest::new("v2", MemoryCategory::Semantic).with_id(id))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MemoryError::Validation(ValidationError::CategoryChanged { .. })
    ));
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_storage() {
    let fx = fixture();
    let err = fx
        .store
        .store(StoreRequest::new("", MemoryCategory::Working))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MemoryError::Validation(ValidationError::EmptyContent)
    ));
    let err = fx
        .store
        .store(StoreRequest::new("x", MemoryCategory::Working).with_embedding(vec![1.0]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MemoryError::Validation(ValidationError::EmbeddingDimension { .. })
    ));
    assert_eq!(fx.store.stats().await.counts, Some(CategoryCounts::new()));
}

#[tokio::test]
async fn vector_and_scan_paths_rank_identically() {
    let fx = fixture();
    for (content, embedding) in [
        ("A", vec![1.0, 0.0, 0.0]),
        ("B", vec![0.9, 0.1, 0.0]),
        ("C", vec![0.0, 1.0, 0.0]),
        ("D", vec![0.7, 0.7, 0.0]),
    ] {
        fx.store
            .store(StoreRequest::new(content, MemoryCategory::Semantic).with_embedding(embedding))
            .await
            .expect("store");
    }
    let request = SearchRequest::new(vec![1.0, 0.0, 0.0]).with_min_similarity(0.5);
    let delegated = fx.store.search(request.clone()).await.expect("vector");

    let scan_only = RoutingPolicy::default()
        .with_route(
            MemoryCategory::Working,
            Route::new(
                TierKind::Cache,
                [TierKind::Cache, TierKind::Durable],
                Some(Duration::from_secs(3600)),
            ),
        )
        .expect("route");
    fx.store.reload_routing(scan_only).expect("reload");
    let scanned = fx.store.search(request).await.expect("scan");

    let names = |results: &[ScoredRecord]| -> Vec<String> {
        results
            .iter()
            .map(|scored| scored.record.content.clone())
            .collect()
    };
    assert_eq!(names(&delegated), vec!["A", "B", "D"]);
    assert_eq!(names(&delegated), names(&scanned));
}

#[tokio::test]
async fn search_counts_recalls() {
    let fx = fixture();
    let id = store_text(&fx.store, "found", MemoryCategory::Procedural).await;
    let results = fx
        .store
        .search(SearchRequest::new(vec![1.0, 0.0, 0.0]).with_category(MemoryCategory::Procedural))
        .await
        .expect("search");
    assert_eq!(results.len(), 1);
    fx.store.flush().await;
    let record = fx.durable.get(id).await.expect("get").expect("present");
    assert_eq!(record.recall_count, 1);
    assert_eq!(record.access_count, 0);
}

#[tokio::test]
async fn detach_owner_clears_links_without_deleting() {
    let fx = fixture();
    for content in ["one", "two"] {
        fx.store
            .store(StoreRequest::new(content, MemoryCategory::Working).with_owner("ada"))
            .await
            .expect("store");
    }
    fx.store
        .store(StoreRequest::new("three", MemoryCategory::Working).with_owner("grace"))
        .await
        .expect("store");

    assert_eq!(fx.store.detach_owner("ada").await.expect("detach"), 2);
    assert!(fx.store.records_owned_by("ada").await.expect("scan").is_empty());
    assert_eq!(fx.store.records_owned_by("grace").await.expect("scan").len(), 1);
    assert_eq!(
        fx.store.stats().await.counts.and_then(|counts| counts.get(&MemoryCategory::Working).copied()),
        Some(3)
    );
}

#[tokio::test]
async fn invalid_routes_never_reach_the_store() {
    let fx = fixture();
    let broken = RoutingPolicy::default().with_route(
        MemoryCategory::Semantic,
        Route::new(TierKind::Vector, [TierKind::Vector], None),
    );
    assert!(broken.is_err());
    assert_eq!(*fx.store.routing(), RoutingPolicy::default());
}

struct FixedEmbedder;

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        Ok(vec![text.len() as f32, 1.0, 0.0])
    }
}

#[tokio::test]
async fn embedder_fills_missing_embeddings() {
    let durable = Arc::new(SqliteStore::open_in_memory().expect("sqlite"));
    let store = HybridStore::builder(durable.clone())
        .embedder(Arc::new(FixedEmbedder))
        .embedding_dimension(3)
        .build()
        .expect("store");
    let id = store
        .store(StoreRequest::new("abcd", MemoryCategory::Semantic))
        .await
        .expect("store");
    let record = durable.get(id).await.expect("get").expect("present");
    assert_eq!(record.embedding, Some(vec![4.0, 1.0, 0.0]));
}

#[tokio::test]
async fn stats_report_hit_rate() {
    let fx = fixture();
    let id = store_text(&fx.store, "hot", MemoryCategory::Working).await;
    fx.store.recall(id).await.expect("hit");
    fx.store.recall(id).await.expect("hit");
    fx.store.flush().await;
    let stats = fx.store.stats().await;
    assert_eq!(stats.cache_hits, 2);
    assert_eq!(stats.cache_hit_rate, 1.0);
    assert_eq!(stats.background_in_flight, 0);
    assert!(stats.health.is_active(TierKind::Cache));
}

#[tokio::test]
async fn cacheless_store_counts_no_lookups() {
    let durable = Arc::new(SqliteStore::open_in_memory().expect("sqlite"));
    let store = HybridStore::builder(durable)
        .embedding_dimension(3)
        .build()
        .expect("store");
    let id = store_text(&store, "durable only", MemoryCategory::Working).await;
    store.recall(id).await.expect("recall");
    store.flush().await;
    let stats = store.stats().await;
    assert_eq!(stats.cache_hits, 0);
    assert_eq!(stats.cache_misses, 0);
    assert_eq!(stats.cache_hit_rate, 0.0);
}

#[tokio::test]
async fn cache_miss_is_counted_once() {
    let fx = fixture();
    let id = store_text(&fx.store, "fact", MemoryCategory::Semantic).await;
    fx.store.recall(id).await.expect("miss");
    fx.store.flush().await;
    let stats = fx.store.stats().await;
    assert_eq!(stats.cache_hits, 0);
    assert_eq!(stats.cache_misses, 1);
}
