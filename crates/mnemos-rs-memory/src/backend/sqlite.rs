//! Durable tier backed by SQLite.

use super::{BackendAdapter, CategoryCounts, ScanFilter, SimilarityQuery};
use crate::error::BackendError;
use crate::model::{MemoryRecord, RecordUpdate, ScoredRecord};
use crate::search::brute_force;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{info, warn};
use mnemos_rs_protocol::{BackendHealth, MemoryCategory, RecordId, TierKind};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY NOT NULL,
    content TEXT NOT NULL CHECK (length(trim(content)) > 0),
    embedding BLOB,
    importance REAL NOT NULL CHECK (importance >= 0.0 AND importance <= 1.0),
    decay_rate REAL NOT NULL CHECK (decay_rate >= 0.0 AND decay_rate <= 1.0),
    owner TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    category TEXT NOT NULL CHECK (category IN ('working', 'episodic', 'semantic', 'procedural')),
    created_at TEXT NOT NULL,
    accessed_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0 CHECK (access_count >= 0),
    recall_count INTEGER NOT NULL DEFAULT 0 CHECK (recall_count >= 0),
    consolidated_into TEXT
);
CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(category);
CREATE INDEX IF NOT EXISTS idx_memories_owner ON memories(owner);
CREATE TABLE IF NOT EXISTS sweep_leases (
    name TEXT PRIMARY KEY NOT NULL,
    holder TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
";

const COLUMNS: &str = "id, content, embedding, importance, decay_rate, owner, tags, category, \
     created_at, accessed_at, updated_at, access_count, recall_count, consolidated_into";

/// SQLite-backed source of truth.
///
/// The connection sits behind a mutex and every call runs on the blocking
/// pool, so the async runtime never waits on disk I/O.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create the database file, applying the schema.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                BackendError::Unavailable(format!(
                    "failed to create {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(&path).map_err(sql_err)?;
        conn.busy_timeout(busy_timeout).map_err(sql_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        info!("opened durable memory store (path={})", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file path, if the store is file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure against the connection on the blocking pool.
    async fn call<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, BackendError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            op(&mut conn)
        })
        .await
        .map_err(|err| BackendError::Unavailable(format!("sqlite task failed: {err}")))?
    }

    /// Take or renew a named lease until `now + ttl`.
    ///
    /// Succeeds when nobody holds the lease, the previous holder's lease has
    /// expired, or `holder` already owns it.
    pub async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|err| BackendError::Unavailable(format!("invalid lease ttl: {err}")))?;
        let name = name.to_string();
        let holder = holder.to_string();
        let expires_at = timestamp(now + ttl);
        let now = timestamp(now);
        self.call(move |conn| {
            let changed = conn
                .execute(
                    "INSERT INTO sweep_leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
                     WHERE sweep_leases.expires_at <= ?4 OR sweep_leases.holder = excluded.holder",
                    params![name, holder, expires_at, now],
                )
                .map_err(sql_err)?;
            Ok(changed == 1)
        })
        .await
    }

    /// Give up a lease if `holder` still owns it.
    pub async fn release_lease(&self, name: &str, holder: &str) -> Result<(), BackendError> {
        let name = name.to_string();
        let holder = holder.to_string();
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM sweep_leases WHERE name = ?1 AND holder = ?2",
                params![name, holder],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }
}

/// Map SQLite errors: decoding failures are corrupt data, the rest transient.
fn sql_err(err: rusqlite::Error) -> BackendError {
    match err {
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..)
        | rusqlite::Error::Utf8Error(..) => BackendError::corrupt(None, err),
        other => BackendError::Unavailable(other.to_string()),
    }
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect()
}

/// Column values as stored, before any domain decoding.
struct RawRow {
    id: String,
    content: String,
    embedding: Option<Vec<u8>>,
    importance: f64,
    decay_rate: f64,
    owner: Option<String>,
    tags: String,
    category: String,
    created_at: String,
    accessed_at: String,
    updated_at: String,
    access_count: i64,
    recall_count: i64,
    consolidated_into: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content: row.get(1)?,
            embedding: row.get(2)?,
            importance: row.get(3)?,
            decay_rate: row.get(4)?,
            owner: row.get(5)?,
            tags: row.get(6)?,
            category: row.get(7)?,
            created_at: row.get(8)?,
            accessed_at: row.get(9)?,
            updated_at: row.get(10)?,
            access_count: row.get(11)?,
            recall_count: row.get(12)?,
            consolidated_into: row.get(13)?,
        })
    }

    fn decode(self) -> Result<MemoryRecord, BackendError> {
        let id = Uuid::parse_str(&self.id).map_err(|err| BackendError::corrupt(None, err))?;
        let corrupt = |reason: String| BackendError::corrupt(Some(id), reason);

        let embedding = match self.embedding {
            Some(bytes) if bytes.len() % 4 != 0 => {
                return Err(corrupt(format!("embedding blob has {} bytes", bytes.len())));
            }
            Some(bytes) => Some(
                bytes
                    .chunks_exact(4)
                    .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect(),
            ),
            None => None,
        };
        let tags: BTreeSet<String> =
            serde_json::from_str(&self.tags).map_err(|err| corrupt(format!("tags: {err}")))?;
        let category: MemoryCategory = self
            .category
            .parse()
            .map_err(|err| corrupt(format!("{err}")))?;
        let parse_time = |field: &str, value: &str| {
            DateTime::parse_from_rfc3339(value)
                .map(|time| time.with_timezone(&Utc))
                .map_err(|err| corrupt(format!("{field}: {err}")))
        };
        let consolidated_into = self
            .consolidated_into
            .map(|value| Uuid::parse_str(&value))
            .transpose()
            .map_err(|err| corrupt(format!("consolidated_into: {err}")))?;

        Ok(MemoryRecord {
            id,
            content: self.content,
            embedding,
            importance: self.importance as f32,
            decay_rate: self.decay_rate as f32,
            owner: self.owner,
            tags,
            category,
            created_at: parse_time("created_at", &self.created_at)?,
            accessed_at: parse_time("accessed_at", &self.accessed_at)?,
            updated_at: parse_time("updated_at", &self.updated_at)?,
            access_count: u64::try_from(self.access_count)
                .map_err(|err| corrupt(format!("access_count: {err}")))?,
            recall_count: u64::try_from(self.recall_count)
                .map_err(|err| corrupt(format!("recall_count: {err}")))?,
            consolidated_into,
        })
    }
}

fn select_by_id(conn: &Connection, id: &str) -> Result<Option<MemoryRecord>, BackendError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM memories WHERE id = ?1"),
            params![id],
            RawRow::from_row,
        )
        .optional()
        .map_err(sql_err)?;
    raw.map(RawRow::decode).transpose()
}

fn select_matching(conn: &Connection, filter: &ScanFilter) -> Result<Vec<MemoryRecord>, BackendError> {
    let mut clauses = Vec::new();
    let mut values: Vec<String> = Vec::new();
    if let Some(categories) = &filter.categories {
        if categories.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; categories.len()].join(", ");
        clauses.push(format!("category IN ({placeholders})"));
        values.extend(categories.iter().map(|category| category.as_str().to_string()));
    }
    if let Some(owner) = &filter.owner {
        clauses.push("owner = ?".to_string());
        values.push(owner.clone());
    }
    if filter.with_embedding {
        clauses.push("embedding IS NOT NULL".to_string());
    }
    let mut sql = format!("SELECT {COLUMNS} FROM memories");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), RawRow::from_row)
        .map_err(sql_err)?;
    let mut records = Vec::new();
    for row in rows {
        let decoded = row.map_err(sql_err).and_then(RawRow::decode);
        match decoded {
            Ok(record) => records.push(record),
            Err(BackendError::Corrupt { id, reason }) => {
                warn!(
                    "skipping corrupt durable row (id={}, reason={reason})",
                    id.map(|id| id.to_string()).unwrap_or_default()
                );
            }
            Err(err) => return Err(err),
        }
    }
    Ok(records)
}

#[async_trait]
impl BackendAdapter for SqliteStore {
    fn tier(&self) -> TierKind {
        TierKind::Durable
    }

    fn name(&self) -> &str {
        "sqlite"
    }

    async fn put(&self, record: MemoryRecord, _ttl: Option<Duration>) -> Result<(), BackendError> {
        let tags = serde_json::to_string(&record.tags)
            .map_err(|err| BackendError::corrupt(Some(record.id), err))?;
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO memories ({COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                     ON CONFLICT(id) DO UPDATE SET
                        content = excluded.content,
                        embedding = excluded.embedding,
                        importance = excluded.importance,
                        decay_rate = excluded.decay_rate,
                        owner = excluded.owner,
                        tags = excluded.tags,
                        category = excluded.category,
                        created_at = excluded.created_at,
                        accessed_at = excluded.accessed_at,
                        updated_at = excluded.updated_at,
                        access_count = excluded.access_count,
                        recall_count = excluded.recall_count,
                        consolidated_into = excluded.consolidated_into"
                ),
                params![
                    record.id.to_string(),
                    record.content,
                    record.embedding.as_deref().map(encode_embedding),
                    f64::from(record.importance),
                    f64::from(record.decay_rate),
                    record.owner,
                    tags,
                    record.category.as_str(),
                    timestamp(record.created_at),
                    timestamp(record.accessed_at),
                    timestamp(record.updated_at),
                    i64::try_from(record.access_count).unwrap_or(i64::MAX),
                    i64::try_from(record.recall_count).unwrap_or(i64::MAX),
                    record.consolidated_into.map(|id| id.to_string()),
                ],
            )
            .map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: RecordId) -> Result<Option<MemoryRecord>, BackendError> {
        self.call(move |conn| {
            select_by_id(conn, &id.to_string()).map_err(|err| match err {
                BackendError::Corrupt { reason, .. } => BackendError::corrupt(Some(id), reason),
                other => other,
            })
        })
        .await
    }

    async fn delete(&self, id: RecordId) -> Result<bool, BackendError> {
        self.call(move |conn| {
            let removed = conn
                .execute("DELETE FROM memories WHERE id = ?1", params![id.to_string()])
                .map_err(sql_err)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn update(
        &self,
        id: RecordId,
        update: &RecordUpdate,
    ) -> Result<Option<MemoryRecord>, BackendError> {
        let update = update.clone();
        self.call(move |conn| {
            let tx = conn.transaction().map_err(sql_err)?;
            let key = id.to_string();
            let changed = match &update {
                RecordUpdate::Access { at } => tx.execute(
                    "UPDATE memories SET access_count = access_count + 1, accessed_at = ?2 WHERE id = ?1",
                    params![key, timestamp(*at)],
                ),
                RecordUpdate::Recall { at } => tx.execute(
                    "UPDATE memories SET recall_count = recall_count + 1, accessed_at = ?2 WHERE id = ?1",
                    params![key, timestamp(*at)],
                ),
                RecordUpdate::Consolidated { into, at } => tx.execute(
                    "UPDATE memories SET consolidated_into = ?2, updated_at = ?3 WHERE id = ?1",
                    params![key, into.to_string(), timestamp(*at)],
                ),
                RecordUpdate::ClearOwner { at } => tx.execute(
                    "UPDATE memories SET owner = NULL, updated_at = ?2 WHERE id = ?1",
                    params![key, timestamp(*at)],
                ),
            }
            .map_err(sql_err)?;
            if changed == 0 {
                return Ok(None);
            }
            let record = select_by_id(&tx, &key)?;
            tx.commit().map_err(sql_err)?;
            Ok(record)
        })
        .await
    }

    async fn similarity_search(
        &self,
        query: &SimilarityQuery,
    ) -> Result<Vec<ScoredRecord>, BackendError> {
        let filter = ScanFilter {
            categories: query.category.map(|category| vec![category]),
            ..ScanFilter::default()
        }
        .embedded();
        let records = self.scan(&filter).await?;
        Ok(brute_force(records, query))
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<MemoryRecord>, BackendError> {
        let filter = filter.clone();
        self.call(move |conn| select_matching(conn, &filter)).await
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.call(|conn| {
            conn.execute("DELETE FROM memories", []).map_err(sql_err)?;
            Ok(())
        })
        .await
    }

    async fn category_counts(&self) -> Result<CategoryCounts, BackendError> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare("SELECT category, COUNT(*) FROM memories GROUP BY category")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(sql_err)?;
            let mut counts = CategoryCounts::new();
            for row in rows {
                let (category, count) = row.map_err(sql_err)?;
                let category: MemoryCategory = category
                    .parse()
                    .map_err(|err| BackendError::corrupt(None, err))?;
                counts.insert(category, u64::try_from(count).unwrap_or_default());
            }
            Ok(counts)
        })
        .await
    }

    async fn health(&self) -> BackendHealth {
        let probe = self
            .call(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map_err(sql_err)
            })
            .await;
        match probe {
            Ok(_) => BackendHealth::Healthy,
            Err(err) => {
                warn!("durable health probe failed (err={err})");
                BackendHealth::Unavailable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StoreRequest;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn open(temp: &TempDir) -> SqliteStore {
        SqliteStore::open(temp.path().join("memory.db"), Duration::from_secs(1)).expect("open")
    }

    fn record(content: &str, category: MemoryCategory) -> MemoryRecord {
        StoreRequest::new(content, category)
            .with_embedding(vec![0.25, -1.5, 3.0])
            .with_owner("ada")
            .with_tags(["alpha", "beta"])
            .into_record(Utc::now())
    }

    #[tokio::test]
    async fn put_and_get_preserve_every_field() {
        let temp = TempDir::new().expect("tmp");
        let store = open(&temp);
        let mut record = record("the sky is blue", MemoryCategory::Semantic);
        record.consolidated_into = Some(Uuid::new_v4());
        record.access_count = 3;

        store.put(record.clone(), None).await.expect("put");
        let loaded = store.get(record.id).await.expect("get").expect("present");
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let temp = TempDir::new().expect("tmp");
        let record = record("persisted", MemoryCategory::Episodic);
        {
            let store = open(&temp);
            store.put(record.clone(), None).await.expect("put");
        }
        let store = open(&temp);
        assert_eq!(
            store.get(record.id).await.expect("get").map(|r| r.content),
            Some("persisted".to_string())
        );
    }

    #[tokio::test]
    async fn update_increments_atomically() {
        let store = SqliteStore::open_in_memory().expect("open");
        let record = record("counted", MemoryCategory::Working);
        store.put(record.clone(), None).await.expect("put");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(record.id, &RecordUpdate::Access { at: Utc::now() })
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("update");
        }
        let loaded = store.get(record.id).await.expect("get").expect("present");
        assert_eq!(loaded.access_count, 8);

        let missing = store
            .update(Uuid::new_v4(), &RecordUpdate::Recall { at: Utc::now() })
            .await
            .expect("update");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn scan_filters_and_counts() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .put(record("a", MemoryCategory::Working), None)
            .await
            .expect("put");
        store
            .put(record("b", MemoryCategory::Semantic), None)
            .await
            .expect("put");
        store
            .put(
                StoreRequest::new("c", MemoryCategory::Semantic).into_record(Utc::now()),
                None,
            )
            .await
            .expect("put");

        let semantic = store
            .scan(&ScanFilter::category(MemoryCategory::Semantic))
            .await
            .expect("scan");
        assert_eq!(semantic.len(), 2);
        let embedded = store
            .scan(&ScanFilter::category(MemoryCategory::Semantic).embedded())
            .await
            .expect("scan");
        assert_eq!(embedded.len(), 1);
        let owned = store.scan(&ScanFilter::owner("ada")).await.expect("scan");
        assert_eq!(owned.len(), 2);

        let counts = store.category_counts().await.expect("counts");
        assert_eq!(counts.get(&MemoryCategory::Semantic), Some(&2));
        assert_eq!(counts.get(&MemoryCategory::Working), Some(&1));
        assert_eq!(counts.get(&MemoryCategory::Episodic), None);
    }

    #[tokio::test]
    async fn malformed_row_is_corrupt() {
        let store = SqliteStore::open_in_memory().expect("open");
        let record = record("broken", MemoryCategory::Semantic);
        store.put(record.clone(), None).await.expect("put");
        {
            let conn = store.conn.lock();
            conn.execute(
                "UPDATE memories SET tags = 'not json' WHERE id = ?1",
                params![record.id.to_string()],
            )
            .expect("corrupt");
        }
        let err = store.get(record.id).await.unwrap_err();
        assert!(matches!(err, BackendError::Corrupt { id: Some(id), .. } if id == record.id));
        assert!(store.scan(&ScanFilter::default()).await.expect("scan").is_empty());
    }

    #[tokio::test]
    async fn leases_expire_and_exclude_other_holders() {
        let store = SqliteStore::open_in_memory().expect("open");
        let now = Utc::now();
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire_lease("sweep", "a", now, ttl).await.expect("a"));
        assert!(!store.try_acquire_lease("sweep", "b", now, ttl).await.expect("b"));
        assert!(store.try_acquire_lease("sweep", "a", now, ttl).await.expect("renew"));

        let later = now + chrono::Duration::seconds(61);
        assert!(store.try_acquire_lease("sweep", "b", later, ttl).await.expect("takeover"));

        store.release_lease("sweep", "b").await.expect("release");
        assert!(store.try_acquire_lease("sweep", "a", later, ttl).await.expect("again"));
    }
}
