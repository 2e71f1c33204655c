use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::debug;

/// Well-known bucket names.
pub const BUCKET_UPSTREAMS: &str = "upstreams";
pub const BUCKET_TOOLS: &str = "tools";
pub const BUCKET_TOOL_HASHES: &str = "tool_hashes";
pub const BUCKET_TOOL_STATS: &str = "tool_stats";
pub const BUCKET_ACTIVITY: &str = "activity";
pub const BUCKET_OAUTH_TOKENS: &str = "oauth_tokens";
pub const BUCKET_KV: &str = "kv";

pub const DB_FILE: &str = "mcpproxy.db";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is closed")]
    Closed,
    #[error("corrupted store data: {0}")]
    Corrupted(String),
    #[error("store error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key/value store with named buckets on a single SQLite file.
///
/// Concurrency model: WAL journal, one short-lived connection per operation
/// (readers run concurrently; writers serialize behind the busy timeout).
/// After `close()` every operation returns `StoreError::Closed`; callers
/// are expected to degrade to cached data rather than surface it.
pub struct Store {
    db_path: PathBuf,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub buckets: BTreeMap<String, u64>,
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
            closed: AtomicBool::new(false),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connect(&self) -> StoreResult<Connection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;",
        )?;
        Ok(conn)
    }

    fn ensure_schema(&self) -> StoreResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            )",
            [],
        )?;
        Ok(())
    }

    /// Expose the database path so sibling components (the tool index) can
    /// share the same file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn get(&self, bucket: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.connect()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_entries WHERE bucket = ? AND key = ?",
                params![bucket, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, bucket: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO kv_entries (bucket, key, value) VALUES (?, ?, ?)
             ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value",
            params![bucket, key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, bucket: &str, key: &str) -> StoreResult<bool> {
        let conn = self.connect()?;
        let n = conn.execute(
            "DELETE FROM kv_entries WHERE bucket = ? AND key = ?",
            params![bucket, key],
        )?;
        Ok(n > 0)
    }

    /// All entries under a key prefix, ascending key order.
    pub fn range(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let conn = self.connect()?;
        let pattern = format!("{}%", escape_like(prefix));
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv_entries
             WHERE bucket = ? AND key LIKE ? ESCAPE '\\'
             ORDER BY key ASC",
        )?;
        let rows = stmt
            .query_map(params![bucket, pattern], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Descending key order with limit/offset; used for newest-first queries
    /// over time-keyed buckets.
    pub fn range_rev(
        &self,
        bucket: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv_entries
             WHERE bucket = ?
             ORDER BY key DESC
             LIMIT ? OFFSET ?",
        )?;
        let rows = stmt
            .query_map(params![bucket, limit as i64, offset as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self, bucket: &str) -> StoreResult<u64> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kv_entries WHERE bucket = ?",
            params![bucket],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Delete every key strictly below `cutoff` (lexicographic). Returns the
    /// number of deleted entries.
    pub fn delete_below(&self, bucket: &str, cutoff: &str) -> StoreResult<usize> {
        let conn = self.connect()?;
        let n = conn.execute(
            "DELETE FROM kv_entries WHERE bucket = ? AND key < ?",
            params![bucket, cutoff],
        )?;
        Ok(n)
    }

    /// Delete the `n` oldest entries (ascending key order).
    pub fn delete_oldest(&self, bucket: &str, n: usize) -> StoreResult<usize> {
        let conn = self.connect()?;
        let deleted = conn.execute(
            "DELETE FROM kv_entries WHERE bucket = ?1 AND key IN (
                SELECT key FROM kv_entries WHERE bucket = ?1 ORDER BY key ASC LIMIT ?2
            )",
            params![bucket, n as i64],
        )?;
        Ok(deleted)
    }

    /// Atomically increment a counter value stored as decimal text.
    pub fn increment(&self, bucket: &str, key: &str) -> StoreResult<u64> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO kv_entries (bucket, key, value) VALUES (?, ?, '1')
             ON CONFLICT(bucket, key)
             DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)",
            params![bucket, key],
        )?;
        let raw: Vec<u8> = conn.query_row(
            "SELECT value FROM kv_entries WHERE bucket = ? AND key = ?",
            params![bucket, key],
            |row| row.get(0),
        )?;
        let text = String::from_utf8(raw)
            .map_err(|_| StoreError::Corrupted(format!("counter {}:{} is not UTF-8", bucket, key)))?;
        text.parse::<u64>()
            .map_err(|_| StoreError::Corrupted(format!("counter {}:{} is not numeric", bucket, key)))
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT bucket, COUNT(*) FROM kv_entries GROUP BY bucket")?;
        let mut buckets = BTreeMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (bucket, count) = row?;
            buckets.insert(bucket, count as u64);
        }
        Ok(StoreStats { buckets })
    }

    /// Mark the store closed. Idempotent; subsequent operations return
    /// `StoreError::Closed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("store closed: {}", self.db_path.display());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // Typed JSON helpers used by the config/state buckets.

    pub fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        bucket: &str,
        key: &str,
    ) -> StoreResult<Option<T>> {
        match self.get(bucket, key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    StoreError::Corrupted(format!("bucket {} key {}: {}", bucket, key, e))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn put_json<T: serde::Serialize>(
        &self,
        bucket: &str,
        key: &str,
        value: &T,
    ) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StoreError::Corrupted(format!("serialize {}:{}: {}", bucket, key, e)))?;
        self.put(bucket, key, &bytes)
    }
}

fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join(DB_FILE)).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_delete() {
        let (_dir, store) = temp_store();
        assert!(store.get(BUCKET_KV, "a").unwrap().is_none());
        store.put(BUCKET_KV, "a", b"1").unwrap();
        assert_eq!(store.get(BUCKET_KV, "a").unwrap().unwrap(), b"1");
        store.put(BUCKET_KV, "a", b"2").unwrap();
        assert_eq!(store.get(BUCKET_KV, "a").unwrap().unwrap(), b"2");
        assert!(store.delete(BUCKET_KV, "a").unwrap());
        assert!(!store.delete(BUCKET_KV, "a").unwrap());
    }

    #[test]
    fn buckets_are_isolated() {
        let (_dir, store) = temp_store();
        store.put(BUCKET_KV, "k", b"kv").unwrap();
        store.put(BUCKET_TOOLS, "k", b"tools").unwrap();
        assert_eq!(store.get(BUCKET_KV, "k").unwrap().unwrap(), b"kv");
        assert_eq!(store.get(BUCKET_TOOLS, "k").unwrap().unwrap(), b"tools");
        store.delete(BUCKET_KV, "k").unwrap();
        assert!(store.get(BUCKET_TOOLS, "k").unwrap().is_some());
    }

    #[test]
    fn range_is_sorted_and_prefix_filtered() {
        let (_dir, store) = temp_store();
        store.put(BUCKET_TOOLS, "a|z", b"1").unwrap();
        store.put(BUCKET_TOOLS, "a|m", b"2").unwrap();
        store.put(BUCKET_TOOLS, "b|a", b"3").unwrap();
        let rows = store.range(BUCKET_TOOLS, "a|").unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a|m", "a|z"]);
    }

    #[test]
    fn range_prefix_escapes_like_wildcards() {
        let (_dir, store) = temp_store();
        store.put(BUCKET_KV, "a_b", b"1").unwrap();
        store.put(BUCKET_KV, "axb", b"2").unwrap();
        let rows = store.range(BUCKET_KV, "a_").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "a_b");
    }

    #[test]
    fn range_rev_newest_first() {
        let (_dir, store) = temp_store();
        for i in 0..5 {
            store
                .put(BUCKET_ACTIVITY, &format!("{:03}", i), b"x")
                .unwrap();
        }
        let rows = store.range_rev(BUCKET_ACTIVITY, 2, 1).unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["003", "002"]);
    }

    #[test]
    fn delete_below_and_oldest() {
        let (_dir, store) = temp_store();
        for i in 0..10 {
            store
                .put(BUCKET_ACTIVITY, &format!("{:03}", i), b"x")
                .unwrap();
        }
        assert_eq!(store.delete_below(BUCKET_ACTIVITY, "003").unwrap(), 3);
        assert_eq!(store.delete_oldest(BUCKET_ACTIVITY, 2).unwrap(), 2);
        let rows = store.range(BUCKET_ACTIVITY, "").unwrap();
        assert_eq!(rows[0].0, "005");
        assert_eq!(store.count(BUCKET_ACTIVITY).unwrap(), 5);
    }

    #[test]
    fn increment_counts_up() {
        let (_dir, store) = temp_store();
        assert_eq!(store.increment(BUCKET_TOOL_STATS, "a:t").unwrap(), 1);
        assert_eq!(store.increment(BUCKET_TOOL_STATS, "a:t").unwrap(), 2);
        assert_eq!(store.increment(BUCKET_TOOL_STATS, "b:t").unwrap(), 1);
    }

    #[test]
    fn closed_store_errors() {
        let (_dir, store) = temp_store();
        store.put(BUCKET_KV, "a", b"1").unwrap();
        store.close();
        store.close(); // idempotent
        assert!(matches!(
            store.get(BUCKET_KV, "a"),
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            store.put(BUCKET_KV, "a", b"2"),
            Err(StoreError::Closed)
        ));
    }

    #[test]
    fn json_round_trip_and_corruption() {
        let (_dir, store) = temp_store();
        store
            .put_json(BUCKET_UPSTREAMS, "s", &serde_json::json!({"name": "s"}))
            .unwrap();
        let value: serde_json::Value = store.get_json(BUCKET_UPSTREAMS, "s").unwrap().unwrap();
        assert_eq!(value["name"], "s");

        store.put(BUCKET_UPSTREAMS, "bad", b"\xff\xfe not json").unwrap();
        let result: StoreResult<Option<serde_json::Value>> =
            store.get_json(BUCKET_UPSTREAMS, "bad");
        assert!(matches!(result, Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn stats_counts_buckets() {
        let (_dir, store) = temp_store();
        store.put(BUCKET_KV, "a", b"1").unwrap();
        store.put(BUCKET_KV, "b", b"1").unwrap();
        store.put(BUCKET_TOOLS, "c", b"1").unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.buckets.get(BUCKET_KV), Some(&2));
        assert_eq!(stats.buckets.get(BUCKET_TOOLS), Some(&1));
    }

    #[test]
    fn opening_garbage_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DB_FILE);
        std::fs::write(&path, b"definitely not a database").unwrap();
        assert!(Store::open(&path).is_err());
    }

    #[test]
    fn concurrent_readers_during_writes() {
        let (_dir, store) = temp_store();
        let store = std::sync::Arc::new(store);
        let mut handles = Vec::new();
        for t in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    store
                        .put(BUCKET_KV, &format!("{}-{}", t, i), b"v")
                        .unwrap();
                    let _ = store.range(BUCKET_KV, "").unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.count(BUCKET_KV).unwrap(), 200);
    }
}
