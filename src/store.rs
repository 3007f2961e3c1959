use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context as _;
use rusqlite::{Connection, OpenFlags, params};
use serde::{Serialize, de::DeserializeOwned};

const SCHEMA_VERSION: i32 = 1;

/// Primitive size-bounded key/value API. Backends enforce a per-item byte
/// ceiling (key bytes + value bytes) and report it through `ItemTooLarge`,
/// which is what the chunking fallback in [`ChunkedStore`] keys off.
pub trait KeyValueStore: Send + Sync {
    fn put_item(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn remove_item(&self, key: &str) -> Result<(), StoreError>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    fn bytes_in_use(&self) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    ItemTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ItemTooLarge { key, size, limit } => {
                write!(
                    f,
                    "item `{key}` is {size} bytes, exceeding the {limit} byte ceiling"
                )
            }
            Self::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

fn item_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

/// sqlite-backed primitive store. One connection per blocking call; callers
/// go through [`ChunkedStore`], which moves the work onto the blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
    item_size_limit: usize,
}

impl SqliteStore {
    pub fn open(db_path: PathBuf, item_size_limit: usize) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let store = Self {
            db_path,
            item_size_limit,
        };
        store.init()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init(&self) -> anyhow::Result<()> {
        let conn = open_connection(&self.db_path)?;
        migrate(&conn)?;
        Ok(())
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        open_connection(&self.db_path).map_err(|err| StoreError::Backend(format!("{err:#}")))
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv (
                  key TEXT PRIMARY KEY,
                  value TEXT NOT NULL
                );
                "#,
            )
            .context("create sqlite kv schema")?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported kv store schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

impl KeyValueStore for SqliteStore {
    fn put_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let size = item_size(key, value);
        if size > self.item_size_limit {
            return Err(StoreError::ItemTooLarge {
                key: key.to_owned(),
                size,
                limit: self.item_size_limit,
            });
        }

        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|err| StoreError::Backend(format!("upsert `{key}`: {err}")))?;
        Ok(())
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.connect()?;
        conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .map(Some)
        .or_else(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StoreError::Backend(format!("select `{key}`: {other}"))),
        })
    }

    fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|err| StoreError::Backend(format!("delete `{key}`: {err}")))?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let pattern = format!(
            "{}%",
            prefix
                .replace('\\', r"\\")
                .replace('%', r"\%")
                .replace('_', r"\_")
        );
        let mut stmt = conn
            .prepare("SELECT key FROM kv WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key")
            .map_err(|err| StoreError::Backend(format!("prepare key scan: {err}")))?;
        let rows = stmt
            .query_map(params![pattern], |row| row.get::<_, String>(0))
            .map_err(|err| StoreError::Backend(format!("scan keys `{prefix}`: {err}")))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.map_err(|err| StoreError::Backend(format!("iterate keys: {err}")))?);
        }
        Ok(keys)
    }

    fn bytes_in_use(&self) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0) FROM kv",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|total| u64::try_from(total).unwrap_or(0))
        .map_err(|err| StoreError::Backend(format!("sum bytes in use: {err}")))
    }
}

/// In-memory primitive store with the same size ceiling semantics. Used by
/// tests and by embedders that do not want durable storage.
#[derive(Debug)]
pub struct MemoryStore {
    item_size_limit: usize,
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new(item_size_limit: usize) -> Self {
        Self {
            item_size_limit,
            items: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.items
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_owned()))
    }
}

impl KeyValueStore for MemoryStore {
    fn put_item(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let size = item_size(key, value);
        if size > self.item_size_limit {
            return Err(StoreError::ItemTooLarge {
                key: key.to_owned(),
                size,
                limit: self.item_size_limit,
            });
        }
        self.lock()?.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn get_item(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn remove_item(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .lock()?
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn bytes_in_use(&self) -> Result<u64, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .map(|(key, value)| item_size(key, value) as u64)
            .sum())
    }
}

fn index_key(key: &str) -> String {
    format!("{key}:chunks")
}

fn chunk_key(key: &str, index: usize) -> String {
    format!("{key}:chunk:{index}")
}

fn chunk_prefix(key: &str) -> String {
    format!("{key}:chunk:")
}

/// Splits `s` into slices of at most `max_bytes` bytes, never breaking a char.
/// Concatenating the slices in order reproduces `s` exactly.
fn split_chunks(s: &str, max_bytes: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < s.len() {
        let mut end = (start + max_bytes).min(s.len());
        while end > start && !s.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // max_bytes smaller than the char at `start`; emit the whole char.
            end = start + 1;
            while end < s.len() && !s.is_char_boundary(end) {
                end += 1;
            }
        }
        chunks.push(s[start..end].to_owned());
        start = end;
    }
    chunks
}

/// Large-payload persistence over a size-bounded primitive store. Values that
/// fit the backend ceiling are stored as one item; oversized values are split
/// into `{key}:chunk:{i}` slices described by a `{key}:chunks` index written
/// after all slices. Readers never need to know which representation was
/// chosen, and a torn chunked write reads back as absent rather than erroring.
#[derive(Clone)]
pub struct ChunkedStore {
    inner: Arc<dyn KeyValueStore>,
    chunk_size: usize,
}

impl ChunkedStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, chunk_size: usize) -> Self {
        Self { inner, chunk_size }
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let serialized =
            serde_json::to_string(value).with_context(|| format!("serialize value for `{key}`"))?;
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        let chunk_size = self.chunk_size;
        tokio::task::spawn_blocking(move || {
            put_blocking(inner.as_ref(), &key, &serialized, chunk_size)
        })
        .await
        .context("join chunked put task")?
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_owned();
        let serialized =
            tokio::task::spawn_blocking(move || get_blocking(inner.as_ref(), &owned_key))
                .await
                .context("join chunked get task")??;

        match serialized {
            Some(serialized) => {
                let value = serde_json::from_str(&serialized)
                    .with_context(|| format!("deserialize stored value for `{key}`"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || delete_blocking(inner.as_ref(), &key))
            .await
            .context("join chunked delete task")?
    }

    /// Logical keys under `prefix`: chunk and index items are folded back into
    /// the key they belong to.
    pub async fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let inner = Arc::clone(&self.inner);
        let prefix = prefix.to_owned();
        tokio::task::spawn_blocking(move || {
            let mut keys: Vec<String> = inner
                .keys_with_prefix(&prefix)
                .map_err(anyhow::Error::from)?
                .into_iter()
                .map(|key| logical_key(&key))
                .collect();
            keys.sort();
            keys.dedup();
            Ok(keys)
        })
        .await
        .context("join key scan task")?
    }

    pub async fn bytes_in_use(&self) -> anyhow::Result<u64> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.bytes_in_use().map_err(anyhow::Error::from))
            .await
            .context("join bytes-in-use task")?
    }
}

fn logical_key(raw: &str) -> String {
    if let Some(stripped) = raw.strip_suffix(":chunks") {
        return stripped.to_owned();
    }
    if let Some(position) = raw.rfind(":chunk:") {
        if raw[position + ":chunk:".len()..]
            .bytes()
            .all(|b| b.is_ascii_digit())
        {
            return raw[..position].to_owned();
        }
    }
    raw.to_owned()
}

fn put_blocking(
    store: &dyn KeyValueStore,
    key: &str,
    serialized: &str,
    chunk_size: usize,
) -> anyhow::Result<()> {
    match store.put_item(key, serialized) {
        Ok(()) => {
            remove_chunked_form(store, key)?;
            Ok(())
        }
        Err(StoreError::ItemTooLarge { size, limit, .. }) => {
            tracing::debug!(
                key,
                size,
                limit,
                chunk_size,
                "value exceeds item ceiling, falling back to chunked representation"
            );
            let chunks = split_chunks(serialized, chunk_size);
            for (index, chunk) in chunks.iter().enumerate() {
                store
                    .put_item(&chunk_key(key, index), chunk)
                    .with_context(|| format!("write chunk {index} of `{key}`"))?;
            }
            // The index is the source of truth for chunk count and must land
            // after every slice it describes.
            store
                .put_item(&index_key(key), &chunks.len().to_string())
                .with_context(|| format!("write chunk index for `{key}`"))?;
            remove_stale_chunks(store, key, chunks.len())?;
            store
                .remove_item(key)
                .with_context(|| format!("remove stale single item for `{key}`"))?;
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("write single item for `{key}`")),
    }
}

fn get_blocking(store: &dyn KeyValueStore, key: &str) -> anyhow::Result<Option<String>> {
    if let Some(single) = store.get_item(key)? {
        return Ok(Some(single));
    }

    let Some(index_raw) = store.get_item(&index_key(key))? else {
        return Ok(None);
    };
    let Ok(count) = index_raw.trim().parse::<usize>() else {
        tracing::warn!(key, index = %index_raw, "malformed chunk index, treating value as absent");
        return Ok(None);
    };
    if count == 0 {
        return Ok(None);
    }

    let mut joined = String::new();
    for index in 0..count {
        match store.get_item(&chunk_key(key, index))? {
            Some(chunk) => joined.push_str(&chunk),
            None => {
                // Torn write: the index promises more chunks than exist.
                tracing::debug!(key, index, count, "missing chunk, treating value as absent");
                return Ok(None);
            }
        }
    }
    Ok(Some(joined))
}

fn delete_blocking(store: &dyn KeyValueStore, key: &str) -> anyhow::Result<()> {
    store
        .remove_item(key)
        .with_context(|| format!("remove single item `{key}`"))?;
    remove_chunked_form(store, key)
}

fn remove_chunked_form(store: &dyn KeyValueStore, key: &str) -> anyhow::Result<()> {
    store
        .remove_item(&index_key(key))
        .with_context(|| format!("remove chunk index for `{key}`"))?;
    remove_stale_chunks(store, key, 0)
}

fn remove_stale_chunks(
    store: &dyn KeyValueStore,
    key: &str,
    keep_below: usize,
) -> anyhow::Result<()> {
    let prefix = chunk_prefix(key);
    for chunk in store.keys_with_prefix(&prefix)? {
        let keep = chunk[prefix.len()..]
            .parse::<usize>()
            .map(|index| index < keep_below)
            .unwrap_or(false);
        if !keep {
            store
                .remove_item(&chunk)
                .with_context(|| format!("remove stale chunk `{chunk}`"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ChunkedStore, KeyValueStore, MemoryStore, SqliteStore, StoreError, split_chunks};

    const LIMIT: usize = 256;
    const CHUNK: usize = 64;

    fn memory_chunked() -> (Arc<MemoryStore>, ChunkedStore) {
        let primitive = Arc::new(MemoryStore::new(LIMIT));
        let chunked = ChunkedStore::new(Arc::clone(&primitive) as Arc<dyn KeyValueStore>, CHUNK);
        (primitive, chunked)
    }

    fn payload_of_len(len: usize) -> String {
        "x".repeat(len)
    }

    #[tokio::test]
    async fn round_trips_across_the_chunk_boundary_grid() {
        let (_, store) = memory_chunked();
        // Serialized form adds two quote bytes, so the grid brackets the raw
        // boundary from both sides regardless of representation.
        for len in [
            0,
            1,
            CHUNK - 1,
            CHUNK,
            CHUNK + 1,
            LIMIT - 1,
            LIMIT,
            LIMIT + 1,
            10 * CHUNK,
        ] {
            let value = payload_of_len(len);
            store.put("grid", &value).await.unwrap();
            let fetched: Option<String> = store.get("grid").await.unwrap();
            assert_eq!(fetched.as_deref(), Some(value.as_str()), "len={len}");
        }
    }

    #[tokio::test]
    async fn representation_is_invisible_to_readers() {
        let (primitive, store) = memory_chunked();

        store.put("value", &payload_of_len(16)).await.unwrap();
        assert!(primitive.get_item("value").unwrap().is_some());
        assert!(primitive.get_item("value:chunks").unwrap().is_none());

        store.put("value", &payload_of_len(LIMIT * 4)).await.unwrap();
        assert!(primitive.get_item("value").unwrap().is_none());
        assert!(primitive.get_item("value:chunks").unwrap().is_some());

        let fetched: Option<String> = store.get("value").await.unwrap();
        assert_eq!(fetched, Some(payload_of_len(LIMIT * 4)));

        // Shrinking back to a single item clears the chunked form.
        store.put("value", &payload_of_len(8)).await.unwrap();
        assert!(primitive.get_item("value:chunks").unwrap().is_none());
        assert!(
            primitive
                .keys_with_prefix("value:chunk:")
                .unwrap()
                .is_empty()
        );
        let fetched: Option<String> = store.get("value").await.unwrap();
        assert_eq!(fetched, Some(payload_of_len(8)));
    }

    #[tokio::test]
    async fn shrinking_a_chunked_value_drops_stale_high_chunks() {
        let (primitive, store) = memory_chunked();

        store.put("log", &payload_of_len(LIMIT * 8)).await.unwrap();
        let wide = primitive.keys_with_prefix("log:chunk:").unwrap().len();

        store.put("log", &payload_of_len(LIMIT + 1)).await.unwrap();
        let narrow = primitive.keys_with_prefix("log:chunk:").unwrap().len();
        assert!(
            narrow < wide,
            "stale chunks should be removed ({narrow} vs {wide})"
        );

        let fetched: Option<String> = store.get("log").await.unwrap();
        assert_eq!(fetched, Some(payload_of_len(LIMIT + 1)));
    }

    #[tokio::test]
    async fn missing_chunk_reads_back_as_absent() {
        let (primitive, store) = memory_chunked();
        store.put("torn", &payload_of_len(LIMIT * 3)).await.unwrap();

        primitive.remove_item("torn:chunk:1").unwrap();
        let fetched: Option<String> = store.get("torn").await.unwrap();
        assert_eq!(fetched, None);
    }

    #[tokio::test]
    async fn zero_or_malformed_index_reads_back_as_absent() {
        let (primitive, store) = memory_chunked();

        primitive.put_item("empty:chunks", "0").unwrap();
        let fetched: Option<String> = store.get("empty").await.unwrap();
        assert_eq!(fetched, None);

        primitive.put_item("mangled:chunks", "not-a-number").unwrap();
        let fetched: Option<String> = store.get("mangled").await.unwrap();
        assert_eq!(fetched, None);
    }

    #[tokio::test]
    async fn delete_removes_both_representations() {
        let (primitive, store) = memory_chunked();

        store.put("small", &payload_of_len(4)).await.unwrap();
        store.put("big", &payload_of_len(LIMIT * 2)).await.unwrap();

        store.delete("small").await.unwrap();
        store.delete("big").await.unwrap();

        assert!(primitive.keys_with_prefix("").unwrap().is_empty());
        assert_eq!(store.get::<String>("small").await.unwrap(), None);
        assert_eq!(store.get::<String>("big").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_folds_chunked_items_into_logical_keys() {
        let (_, store) = memory_chunked();

        store.put("recording:a", &payload_of_len(4)).await.unwrap();
        store
            .put("recording:b", &payload_of_len(LIMIT * 2))
            .await
            .unwrap();
        store.put("auth:tokens", &payload_of_len(4)).await.unwrap();

        let keys = store.keys("recording:").await.unwrap();
        assert_eq!(
            keys,
            vec!["recording:a".to_owned(), "recording:b".to_owned()]
        );
    }

    #[tokio::test]
    async fn structured_values_round_trip_through_chunking() {
        let (_, store) = memory_chunked();
        let events: Vec<(String, u64)> = (0..200)
            .map(|index| (format!("event-{index}-\u{1F512}"), index))
            .collect();

        store.put("structured", &events).await.unwrap();
        let fetched: Option<Vec<(String, u64)>> = store.get("structured").await.unwrap();
        assert_eq!(fetched, Some(events));
    }

    #[test]
    fn split_chunks_respects_char_boundaries() {
        let text = "aé漢🙂".repeat(40);
        for max_bytes in [1, 2, 3, 5, 64] {
            let chunks = split_chunks(&text, max_bytes);
            assert_eq!(chunks.concat(), text, "max_bytes={max_bytes}");
            if max_bytes >= 4 {
                assert!(chunks.iter().all(|chunk| chunk.len() <= max_bytes));
            }
        }
    }

    #[test]
    fn memory_store_enforces_item_ceiling() {
        let primitive = MemoryStore::new(16);
        let err = primitive.put_item("key", &"v".repeat(64)).unwrap_err();
        assert!(matches!(err, StoreError::ItemTooLarge { limit: 16, .. }));
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_and_reports_bytes_in_use() {
        let temp_dir = tempfile::tempdir().unwrap();
        let primitive = SqliteStore::open(temp_dir.path().join("kv.db"), LIMIT).unwrap();

        primitive.put_item("alpha", "one").unwrap();
        primitive.put_item("beta", "two").unwrap();
        primitive.put_item("alpha", "replaced").unwrap();

        assert_eq!(
            primitive.get_item("alpha").unwrap().as_deref(),
            Some("replaced")
        );
        assert_eq!(primitive.get_item("missing").unwrap(), None);
        assert_eq!(
            primitive.keys_with_prefix("a").unwrap(),
            vec!["alpha".to_owned()]
        );

        let expected = ("alpha".len() + "replaced".len() + "beta".len() + "two".len()) as u64;
        assert_eq!(primitive.bytes_in_use().unwrap(), expected);

        primitive.remove_item("alpha").unwrap();
        assert_eq!(primitive.get_item("alpha").unwrap(), None);

        let err = primitive
            .put_item("big", &"v".repeat(LIMIT + 1))
            .unwrap_err();
        assert!(matches!(err, StoreError::ItemTooLarge { .. }));
    }

    #[tokio::test]
    async fn chunked_store_over_sqlite_round_trips_large_values() {
        let temp_dir = tempfile::tempdir().unwrap();
        let primitive = Arc::new(SqliteStore::open(temp_dir.path().join("kv.db"), LIMIT).unwrap());
        let store = ChunkedStore::new(primitive as Arc<dyn KeyValueStore>, CHUNK);

        let value = payload_of_len(LIMIT * 12);
        store.put("recording:s1", &value).await.unwrap();
        let fetched: Option<String> = store.get("recording:s1").await.unwrap();
        assert_eq!(fetched, Some(value));
    }
}
