//! Tier outages, rollbacks, timeouts and recovery.

use mnemos_rs_memory::{BackendAdapter, MemoryError, SearchRequest, StoreRequest};
use mnemos_rs_protocol::{BackendHealth, MemoryCategory, TierKind};
use mnemos_rs_test_utils::{Harness, request};
use pretty_assertions::assert_eq;
use std::time::Duration;
use uuid::Uuid;

/// A cache outage only removes the cache from routing.
#[tokio::test]
async fn cache_outage_keeps_reads_and_writes_working() {
    let h = Harness::new();
    h.cache.set_down(true);

    let id = h
        .store
        .store(request("still saved", MemoryCategory::Working, [1.0, 0.0, 0.0]))
        .await
        .expect("store");
    assert_eq!(h.store.health().cache, BackendHealth::Unavailable);
    assert_eq!(h.durable.puts(), 1);

    let record = h.store.recall(id).await.expect("recall from durable");
    assert_eq!(record.content, "still saved");
}

/// Without the durable tier, writes fail but cached records still serve.
///
/// A working record that fell out of the cache has nowhere else to come from.
#[tokio::test]
async fn durable_outage_fails_writes_and_uncached_reads() {
    let h = Harness::new();
    let cached = h
        .store
        .store(request("cached", MemoryCategory::Working, [1.0, 0.0, 0.0]))
        .await
        .expect("store cached");
    let uncached = h
        .store
        .store(request("uncached", MemoryCategory::Working, [0.0, 1.0, 0.0]))
        .await
        .expect("store uncached");
    h.raw_cache.delete(uncached).await.expect("evict");

    h.durable.set_down(true);
    let failed = Uuid::new_v4();
    let err = h
        .store
        .store(request("lost", MemoryCategory::Working, [1.0, 0.0, 0.0]).with_id(failed))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MemoryError::BackendUnavailable {
            tier: TierKind::Durable,
            ..
        }
    ));
    assert_eq!(h.store.health().durable, BackendHealth::Unavailable);
    assert!(h.raw_cache.get(failed).await.expect("cache").is_none());
    assert!(h.vector.inner().get(failed).await.expect("vector").is_none());

    let record = h.store.recall(cached).await.expect("cache hit");
    assert_eq!(record.content, "cached");
    assert!(matches!(
        h.store.recall(uncached).await,
        Err(MemoryError::BackendUnavailable {
            tier: TierKind::Durable,
            ..
        })
    ));
    assert!(matches!(
        h.store.forget(cached).await,
        Err(MemoryError::BackendUnavailable { .. })
    ));
    h.store.flush().await;
}

/// Semantic records read from the vector tier first, so a durable outage
/// leaves them readable.
#[tokio::test]
async fn vector_primary_serves_reads_during_durable_outage() {
    let h = Harness::new();
    let fact = h
        .store
        .store(request("water boils at 100C", MemoryCategory::Semantic, [1.0, 0.0, 0.0]))
        .await
        .expect("store fact");
    let scratch = h
        .store
        .store(request("scratch", MemoryCategory::Working, [0.0, 1.0, 0.0]))
        .await
        .expect("store scratch");
    h.raw_cache.delete(scratch).await.expect("evict");
    h.store.flush().await;

    h.durable.set_down(true);
    let record = h.store.recall(fact).await.expect("served by vector tier");
    assert_eq!(record.content, "water boils at 100C");
    assert!(matches!(
        h.store.recall(scratch).await,
        Err(MemoryError::BackendUnavailable {
            tier: TierKind::Durable,
            ..
        })
    ));
    assert!(matches!(
        h.store.recall(Uuid::new_v4()).await,
        Err(MemoryError::BackendUnavailable { .. })
    ));
    assert_eq!(h.store.health().vector, BackendHealth::Healthy);
    h.store.flush().await;
}

/// A failed overwrite puts the previous version back in the other tiers.
#[tokio::test]
async fn failed_overwrite_restores_previous_version() {
    let h = Harness::new();
    let id = h
        .store
        .store(request("v1", MemoryCategory::Working, [1.0, 0.0, 0.0]))
        .await
        .expect("store v1");

    h.durable.fail_puts(true);
    let err = h
        .store
        .store(request("v2", MemoryCategory::Working, [0.0, 1.0, 0.0]).with_id(id))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::BackendUnavailable { .. }));

    let cached = h.raw_cache.get(id).await.expect("cache").expect("present");
    assert_eq!(cached.content, "v1");
    let indexed = h.vector.inner().get(id).await.expect("vector").expect("present");
    assert_eq!(indexed.content, "v1");
    let durable = h.sqlite.get(id).await.expect("sqlite").expect("present");
    assert_eq!(durable.content, "v1");
}

/// Operations give up with `Timeout` once their deadline passes.
#[tokio::test]
async fn slow_durable_tier_times_out() {
    let h = Harness::with(|builder| builder.operation_timeout(Duration::from_millis(50)));
    let id = h
        .store
        .store(request("fact", MemoryCategory::Semantic, [1.0, 0.0, 0.0]))
        .await
        .expect("store");

    h.durable.set_delay(Some(Duration::from_millis(500)));
    let err = h.store.recall(id).await.unwrap_err();
    assert!(matches!(err, MemoryError::Timeout(limit) if limit == Duration::from_millis(50)));

    let err = h
        .store
        .store_within(
            request("late", MemoryCategory::Semantic, [0.0, 1.0, 0.0]),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Timeout(_)));

    h.durable.set_delay(None);
    let record = h
        .store
        .recall_within(id, Duration::from_secs(5))
        .await
        .expect("recall");
    assert_eq!(record.content, "fact");
}

/// A cache that missed a forget while down is emptied before it rejoins.
#[tokio::test]
async fn rejoining_cache_is_cleared() {
    let h = Harness::new();
    let id = h
        .store
        .store(request("secret", MemoryCategory::Working, [1.0, 0.0, 0.0]))
        .await
        .expect("store");

    h.cache.set_down(true);
    let snapshot = h.store.check_health().await;
    assert_eq!(snapshot.cache, BackendHealth::Unavailable);
    h.store.forget(id).await.expect("forget");
    assert!(h.raw_cache.get(id).await.expect("raw").is_some());

    h.cache.set_down(false);
    let snapshot = h.store.check_health().await;
    assert_eq!(snapshot.cache, BackendHealth::Healthy);
    assert!(h.raw_cache.is_empty());
    assert!(matches!(
        h.store.recall(id).await,
        Err(MemoryError::NotFound(_))
    ));
}

/// A returning vector tier is refilled from the durable tier.
#[tokio::test]
async fn rejoining_vector_is_backfilled() {
    let h = Harness::new();
    h.vector.set_down(true);
    h.store.check_health().await;

    let id = h
        .store
        .store(request("indexed later", MemoryCategory::Semantic, [1.0, 0.0, 0.0]))
        .await
        .expect("store");
    assert!(h.vector.inner().get(id).await.expect("vector").is_none());

    h.vector.set_down(false);
    h.store.check_health().await;
    let indexed = h.vector.inner().get(id).await.expect("vector");
    assert_eq!(indexed.map(|record| record.content), Some("indexed later".to_string()));
}

/// A tier that fails while a health check is in flight is cleared and refilled
/// instead of being readmitted with a hole in it.
#[tokio::test]
async fn vector_failure_during_health_check_is_repaired() {
    let h = Harness::new();
    h.durable.set_health_delay(Some(Duration::from_millis(200)));
    let check = tokio::spawn({
        let store = h.store.clone();
        async move { store.check_health().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.vector.fail_puts(true);
    let id = h
        .store
        .store(request("written mid-check", MemoryCategory::Semantic, [1.0, 0.0, 0.0]))
        .await
        .expect("store");
    assert_eq!(h.store.health().vector, BackendHealth::Unavailable);
    assert!(h.vector.inner().get(id).await.expect("vector").is_none());
    h.vector.fail_puts(false);

    let snapshot = check.await.expect("health check task");
    assert_eq!(snapshot.vector, BackendHealth::Healthy);
    assert!(h.vector.inner().get(id).await.expect("vector").is_some());

    let results = h
        .store
        .search(SearchRequest::new(vec![1.0, 0.0, 0.0]))
        .await
        .expect("search");
    let ids: Vec<_> = results.iter().map(|scored| scored.record.id).collect();
    assert_eq!(ids, vec![id]);
    h.store.flush().await;
}

/// Subscribers see every published health transition.
#[tokio::test]
async fn health_transitions_are_published() {
    let h = Harness::new();
    let mut updates = h.store.subscribe_health();
    assert!(!updates.has_changed().expect("sender alive"));

    h.vector.set_down(true);
    h.store.check_health().await;
    assert!(updates.has_changed().expect("sender alive"));
    assert_eq!(updates.borrow_and_update().vector, BackendHealth::Unavailable);

    let stats = h.store.stats().await;
    assert!(!stats.health.is_active(TierKind::Vector));
    assert!(stats.counts.is_some());
}

/// Undecodable cache entries are dropped and the durable copy served.
#[tokio::test]
async fn corrupt_cache_entry_falls_through_to_durable() {
    let h = Harness::new();
    let id = h
        .store
        .store(request("intact", MemoryCategory::Working, [1.0, 0.0, 0.0]))
        .await
        .expect("store");
    h.raw_cache.put_raw(id, b"{not json".to_vec(), None);

    let record = h.store.recall(id).await.expect("recall");
    assert_eq!(record.content, "intact");
    h.store.flush().await;

    let cached = h.raw_cache.get(id).await.expect("repopulated");
    assert_eq!(cached.map(|record| record.access_count), Some(1));
    assert_eq!(h.store.health().cache, BackendHealth::Healthy);
}

/// Writes fail fast while the durable tier is out of routing.
#[tokio::test]
async fn store_without_durable_tier_fails_fast() {
    let h = Harness::new();
    h.durable.set_down(true);
    h.store.check_health().await;

    let err = h
        .store
        .store(StoreRequest::new("nowhere", MemoryCategory::Episodic))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MemoryError::BackendUnavailable {
            tier: TierKind::Durable,
            ..
        }
    ));
    assert_eq!(h.durable.puts(), 0);
    assert_eq!(h.cache.puts(), 0);
}
