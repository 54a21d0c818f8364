//! Durable storage across restarts, corruption and concurrent callers.

use mnemos_rs_memory::{BackendAdapter, MemoryError, SearchRequest, SqliteStore};
use mnemos_rs_protocol::MemoryCategory;
use mnemos_rs_test_utils::{Harness, request};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn open(path: &std::path::Path) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(path, Duration::from_secs(5)).expect("open sqlite"))
}

/// Records written by one store are readable after a restart.
#[tokio::test]
async fn records_survive_restart() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("memory.db");

    let id = {
        let h = Harness::over(open(&path), |builder| builder);
        let id = h
            .store
            .store(
                request("remember the milk", MemoryCategory::Episodic, [1.0, 0.0, 0.0])
                    .with_owner("ada")
                    .with_tags(["errand"]),
            )
            .await
            .expect("store");
        h.store.flush().await;
        id
    };

    let h = Harness::over(open(&path), |builder| builder);
    let record = h.store.recall(id).await.expect("recall after restart");
    assert_eq!(record.content, "remember the milk");
    assert_eq!(record.owner.as_deref(), Some("ada"));
    assert!(record.tags.contains("errand"));
    assert_eq!(h.store.stats().await.cache_misses, 1);
}

/// A row that no longer decodes reads as missing and drops out of search.
#[tokio::test]
async fn corrupt_rows_read_as_missing() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("memory.db");
    let h = Harness::over(open(&path), |builder| builder);
    let broken = h
        .store
        .store(request("broken", MemoryCategory::Semantic, [1.0, 0.0, 0.0]))
        .await
        .expect("store broken");
    let intact = h
        .store
        .store(request("intact", MemoryCategory::Semantic, [1.0, 0.0, 0.0]))
        .await
        .expect("store intact");

    let conn = rusqlite::Connection::open(&path).expect("raw connection");
    conn.busy_timeout(Duration::from_secs(5)).expect("busy timeout");
    conn.execute(
        "UPDATE memories SET embedding = x'00' WHERE id = ?1",
        [broken.to_string()],
    )
    .expect("corrupt row");
    drop(conn);

    assert!(matches!(
        h.store.recall(broken).await,
        Err(MemoryError::NotFound(id)) if id == broken
    ));

    h.vector.set_down(true);
    let results = h
        .store
        .search(SearchRequest::new(vec![1.0, 0.0, 0.0]))
        .await
        .expect("search");
    let ids: Vec<_> = results.iter().map(|scored| scored.record.id).collect();
    assert_eq!(ids, vec![intact]);
}

/// Concurrent recalls never lose an access count increment.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_recalls_count_every_access() {
    let h = Harness::new();
    let id = h
        .store
        .store(request("popular", MemoryCategory::Semantic, [1.0, 0.0, 0.0]))
        .await
        .expect("store");

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = h.store.clone();
        handles.push(tokio::spawn(async move { store.recall(id).await }));
    }
    for handle in handles {
        handle.await.expect("join").expect("recall");
    }
    h.store.flush().await;

    let record = h.sqlite.get(id).await.expect("get").expect("present");
    assert_eq!(record.access_count, 20);
}

/// Concurrent writers each land their own record.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stores_all_land() {
    let h = Harness::new();
    let mut handles = Vec::new();
    for index in 0..16 {
        let store = h.store.clone();
        handles.push(tokio::spawn(async move {
            store
                .store(request(
                    &format!("note {index}"),
                    MemoryCategory::Working,
                    [1.0, index as f32, 0.0],
                ))
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("store");
    }

    let counts = h.store.stats().await.counts.expect("counts");
    assert_eq!(counts.get(&MemoryCategory::Working), Some(&16));
    assert_eq!(h.raw_cache.len(), 16);
}
