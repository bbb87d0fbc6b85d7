//! Two-tier cache for registry lookups.
//!
//! **L1** – [`DashMap`] in-memory map (lock-free concurrent reads).
//! **L2** – Optional SQLite database on disk (persists across process restarts).
//!
//! On [`get`](AuditCache::get): check L1 first; on miss, fall through to L2 and
//! promote the entry back into L1 on hit. On [`put`](AuditCache::put):
//! write-through to both tiers.
//!
//! Every entry carries its own expiry. Expired entries are dropped lazily when
//! they are next read, and from SQLite when the cache is opened.
//!
//! [`get_or_fetch`](AuditCache::get_or_fetch) collapses concurrent misses on
//! the same key into a single fetch. Failed fetches are never cached.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rusqlite::{Connection, OpenFlags, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RetractionStatus;
use crate::matching::normalize_title;
use crate::registry::{ArticleIds, RegistryRecord};

/// Default time-to-live for every entry: 24 hours.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest lifetime an entry can be given; longer TTLs are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Which kind of lookup a cache entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheNamespace {
    Identifier,
    Search,
    Retraction,
    ArticleIds,
}

impl CacheNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheNamespace::Identifier => "identifier",
            CacheNamespace::Search => "search",
            CacheNamespace::Retraction => "retraction",
            CacheNamespace::ArticleIds => "article_ids",
        }
    }
}

/// Cache key: lookup kind + normalized lookup argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: CacheNamespace,
    pub key: String,
}

impl CacheKey {
    /// Key for an identifier lookup. DOIs are case-insensitive.
    pub fn identifier(doi: &str) -> Self {
        Self {
            namespace: CacheNamespace::Identifier,
            key: doi.trim().to_lowercase(),
        }
    }

    /// Key for a fielded search. The title is normalized so that minor
    /// variations (punctuation, diacritics, HTML entities) share an entry.
    pub fn search(title: &str, author: Option<&str>, year: Option<i32>) -> Self {
        let author = author.map(str::to_lowercase).unwrap_or_default();
        let year = year.map(|y| y.to_string()).unwrap_or_default();
        Self {
            namespace: CacheNamespace::Search,
            key: format!("{}|{}|{}", normalize_title(title), author, year),
        }
    }

    /// Key for a retraction status lookup.
    pub fn retraction(doi: &str) -> Self {
        Self {
            namespace: CacheNamespace::Retraction,
            key: doi.trim().to_lowercase(),
        }
    }

    pub fn article_ids(doi: &str) -> Self {
        Self {
            namespace: CacheNamespace::ArticleIds,
            key: doi.trim().to_lowercase(),
        }
    }
}

/// What we store. Each namespace uses exactly one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CachedValue {
    /// Identifier lookup result; `None` records a definitive not-found.
    Record(Option<RegistryRecord>),
    /// Ranked search candidates, best first.
    Candidates(Vec<RegistryRecord>),
    Status(RetractionStatus),
    /// PubMed identifiers; `None` records that the DOI is not indexed.
    ArticleIds(Option<ArticleIds>),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to open cache database at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

/// An L1 entry. L2 rows store the wall-clock expiry instead.
#[derive(Clone, Debug)]
struct CacheEntry {
    value: CachedValue,
    /// `None` when the expiry is past what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Open a SQLite connection with WAL mode and standard pragmas.
fn open_sqlite(path: &Path, read_only: bool) -> Result<Connection, rusqlite::Error> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
    };
    let conn = Connection::open_with_flags(path, flags)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(conn)
}

/// SQLite writer connection (L2 writes: put, clear, evict).
struct SqliteWriter {
    conn: Connection,
}

impl SqliteWriter {
    fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = open_sqlite(path, false)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_cache (
                 namespace  TEXT NOT NULL,
                 cache_key  TEXT NOT NULL,
                 value_json TEXT NOT NULL,
                 expires_at INTEGER NOT NULL,
                 PRIMARY KEY (namespace, cache_key)
             );",
        )?;
        Ok(Self { conn })
    }

    fn put(&self, key: &CacheKey, value: &CachedValue, expires_epoch: u64) {
        let Ok(json) = serde_json::to_string(value) else {
            return;
        };
        if let Err(e) = self.conn.execute(
            "INSERT OR REPLACE INTO audit_cache (namespace, cache_key, value_json, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key.namespace.as_str(), key.key, json, expires_epoch],
        ) {
            tracing::warn!(error = %e, "cache L2 write failed");
        }
    }

    fn clear(&self) {
        let _ = self.conn.execute("DELETE FROM audit_cache", []);
        // Reclaim disk space; deleted pages otherwise stay as free pages.
        let _ = self.conn.execute_batch("VACUUM");
    }

    fn evict_expired(&self) -> usize {
        self.conn
            .execute(
                "DELETE FROM audit_cache WHERE expires_at <= ?1",
                params![now_epoch()],
            )
            .unwrap_or(0)
    }

    fn count(&self) -> usize {
        self.conn
            .query_row("SELECT COUNT(*) FROM audit_cache", [], |row| row.get(0))
            .unwrap_or(0)
    }
}

/// Pool of read-only SQLite connections for concurrent L2 lookups.
///
/// Each reader gets its own connection (WAL mode allows concurrent reads).
/// Connections are returned to the pool after use; if the pool is empty a
/// new connection is opened.
struct ReadPool {
    pool: Mutex<Vec<Connection>>,
    path: PathBuf,
}

impl ReadPool {
    fn new(path: &Path) -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
            path: path.to_path_buf(),
        }
    }

    fn acquire(&self) -> Option<Connection> {
        if let Ok(mut pool) = self.pool.lock()
            && let Some(conn) = pool.pop()
        {
            return Some(conn);
        }
        open_sqlite(&self.path, true).ok()
    }

    fn release(&self, conn: Connection) {
        if let Ok(mut pool) = self.pool.lock() {
            pool.push(conn);
        }
    }

    fn get(&self, key: &CacheKey) -> Option<(CachedValue, u64)> {
        let conn = self.acquire()?;
        let result = Self::query(&conn, key);
        self.release(conn);
        result
    }

    fn query(conn: &Connection, key: &CacheKey) -> Option<(CachedValue, u64)> {
        let mut stmt = conn
            .prepare_cached(
                "SELECT value_json, expires_at FROM audit_cache
                 WHERE namespace = ?1 AND cache_key = ?2",
            )
            .ok()?;
        let (json, expires_epoch): (String, u64) = stmt
            .query_row(params![key.namespace.as_str(), key.key], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .ok()?;

        // Expired rows are left for the writer to evict on next open.
        if expires_epoch <= now_epoch() {
            return None;
        }
        let value = serde_json::from_str(&json).ok()?;
        Some((value, expires_epoch))
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Convert a wall-clock expiry to a monotonic `Instant` approximation.
fn epoch_to_instant(epoch: u64) -> Option<Instant> {
    let remaining = epoch.saturating_sub(now_epoch());
    expiry_after(Duration::from_secs(remaining))
}

fn expiry_after(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl.min(MAX_TTL))
}

/// Per-key in-flight marker. Removes its map entry on drop once no other
/// caller is waiting on the same key.
struct InflightSlot<'a> {
    inflight: &'a DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
    key: &'a CacheKey,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for InflightSlot<'_> {
    fn drop(&mut self) {
        // One reference held by the map, one by this slot.
        self.inflight
            .remove_if(self.key, |_, lock| Arc::strong_count(lock) <= 2);
    }
}

/// Thread-safe two-tier cache shared by the resolver and retraction checker.
///
/// L1: [`DashMap`] for lock-free concurrent access from pool workers.
/// L2: Optional SQLite database. Reads use a [`ReadPool`] of concurrent
///     connections; writes go through a single [`SqliteWriter`] behind a
///     [`Mutex`].
pub struct AuditCache {
    entries: DashMap<CacheKey, CacheEntry>,
    inflight: DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
    sqlite_writer: Option<Mutex<SqliteWriter>>,
    read_pool: Option<ReadPool>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for AuditCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl AuditCache {
    /// Create an in-memory-only cache (no disk persistence).
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            sqlite_writer: None,
            read_pool: None,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Open a persistent cache backed by a SQLite database at `path`.
    ///
    /// Expired rows are evicted on open. L1 starts empty and is populated
    /// lazily as entries are read.
    pub fn open(path: &Path, default_ttl: Duration) -> Result<Self, CacheError> {
        let writer = SqliteWriter::open(path).map_err(|source| CacheError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let evicted = writer.evict_expired();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted expired cache rows");
        }
        Ok(Self {
            sqlite_writer: Some(Mutex::new(writer)),
            read_pool: Some(ReadPool::new(path)),
            ..Self::new(default_ttl)
        })
    }

    /// Look up a live entry without touching the hit/miss counters.
    fn lookup(&self, key: &CacheKey) -> Option<CachedValue> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Some(entry.value.clone());
            }
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired());
        }

        let pool = self.read_pool.as_ref()?;
        let (value, expires_epoch) = pool.get(key)?;
        tracing::trace!(namespace = key.namespace.as_str(), key = %key.key, "cache L2 hit, promoting to L1");
        self.entries.insert(
            key.clone(),
            CacheEntry {
                value: value.clone(),
                expires_at: epoch_to_instant(expires_epoch),
            },
        );
        Some(value)
    }

    /// Return the live entry for `key`, or `None` if absent or expired.
    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        match self.lookup(key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(namespace = key.namespace.as_str(), key = %key.key, "cache hit");
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(namespace = key.namespace.as_str(), key = %key.key, "cache miss");
                None
            }
        }
    }

    /// Store `value` under `key` for `ttl`. Write-through to both tiers.
    pub fn put(&self, key: CacheKey, value: CachedValue, ttl: Duration) {
        let ttl = ttl.min(MAX_TTL);
        let expires_epoch = now_epoch().saturating_add(ttl.as_secs());
        if let Some(ref writer) = self.sqlite_writer
            && let Ok(store) = writer.lock()
        {
            store.put(&key, &value, expires_epoch);
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: expiry_after(ttl),
            },
        );
    }

    /// Return the cached value for `key`, or run `fetch` and cache its result.
    ///
    /// Concurrent callers on the same key wait for the first fetch to finish
    /// and then read its result instead of fetching again. Callers on
    /// different keys never wait on each other. A fetch error is returned to
    /// its caller and nothing is cached, so the next caller fetches afresh.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        fetch: F,
    ) -> Result<CachedValue, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedValue, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let slot = InflightSlot {
            inflight: &self.inflight,
            key,
            lock: self
                .inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone(),
        };
        let _permit = slot.lock.clone().lock_owned().await;

        if let Some(value) = self.lookup(key) {
            tracing::trace!(namespace = key.namespace.as_str(), key = %key.key, "cache filled by concurrent fetch");
            return Ok(value);
        }

        let value = fetch().await?;
        self.put(key.clone(), value.clone(), ttl);
        Ok(value)
    }

    /// Remove all entries from both tiers.
    pub fn clear(&self) {
        self.entries.clear();
        if let Some(ref writer) = self.sqlite_writer
            && let Ok(store) = writer.lock()
        {
            store.clear();
        }
    }

    /// Number of cache hits since creation.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of cache misses since creation.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of entries currently in L1 (expired entries included until read).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows in the persistent L2 store (0 if no SQLite backing).
    pub fn disk_len(&self) -> usize {
        self.sqlite_writer
            .as_ref()
            .and_then(|w| w.lock().ok().map(|store| store.count()))
            .unwrap_or(0)
    }

    /// Whether this cache has a persistent SQLite backing store.
    pub fn has_persistence(&self) -> bool {
        self.sqlite_writer.is_some()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

impl std::fmt::Debug for AuditCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditCache")
            .field("l1_entries", &self.entries.len())
            .field("in_flight", &self.inflight.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .field("default_ttl", &self.default_ttl)
            .field("persistent", &self.has_persistence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetractionState;
    use std::sync::atomic::AtomicUsize;

    fn record(title: &str) -> CachedValue {
        CachedValue::Record(Some(RegistryRecord {
            identifier: "10.1/abc".into(),
            title: title.into(),
            ..Default::default()
        }))
    }

    #[test]
    fn cache_miss_on_empty() {
        let cache = AuditCache::default();
        assert!(cache.get(&CacheKey::identifier("10.1/abc")).is_none());
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 0);
    }

    #[test]
    fn put_then_get() {
        let cache = AuditCache::default();
        let key = CacheKey::identifier("10.1/abc");
        cache.put(key.clone(), record("A Study of X"), DEFAULT_TTL);
        assert_eq!(cache.get(&key), Some(record("A Study of X")));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn not_found_is_cacheable() {
        let cache = AuditCache::default();
        let key = CacheKey::identifier("10.1/missing");
        cache.put(key.clone(), CachedValue::Record(None), DEFAULT_TTL);
        assert_eq!(cache.get(&key), Some(CachedValue::Record(None)));
    }

    #[test]
    fn zero_ttl_entries_expire_immediately() {
        let cache = AuditCache::default();
        let key = CacheKey::identifier("10.1/abc");
        cache.put(key.clone(), record("X"), Duration::ZERO);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn short_ttl_expires_lazily() {
        let cache = AuditCache::default();
        let key = CacheKey::identifier("10.1/abc");
        cache.put(key.clone(), record("X"), Duration::from_millis(20));
        assert!(cache.get(&key).is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn oversized_ttl_is_clamped() {
        let cache = AuditCache::default();
        let key = CacheKey::identifier("10.1/abc");
        cache.put(key.clone(), record("X"), Duration::MAX);
        cache.put(CacheKey::identifier("10.1/def"), record("Y"), Duration::from_secs(u64::MAX));
        assert_eq!(cache.get(&key), Some(record("X")));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn oversized_ttl_survives_sqlite_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let key = CacheKey::identifier("10.1/abc");
        {
            let cache = AuditCache::open(&path, DEFAULT_TTL).unwrap();
            cache.put(key.clone(), record("X"), Duration::from_secs(u64::MAX));
            assert_eq!(cache.disk_len(), 1);
        }
        let cache = AuditCache::open(&path, DEFAULT_TTL).unwrap();
        assert_eq!(cache.get(&key), Some(record("X")));
    }

    #[test]
    fn namespaces_are_separate() {
        let cache = AuditCache::default();
        cache.put(CacheKey::identifier("10.1/abc"), record("X"), DEFAULT_TTL);
        assert!(cache.get(&CacheKey::retraction("10.1/abc")).is_none());
    }

    #[test]
    fn identifier_keys_ignore_case() {
        assert_eq!(
            CacheKey::identifier("10.1/ABC"),
            CacheKey::identifier(" 10.1/abc")
        );
    }

    #[test]
    fn search_key_normalizes_title() {
        assert_eq!(
            CacheKey::search("A Study of X.", Some("Smith"), Some(2020)),
            CacheKey::search("a study of x", Some("smith"), Some(2020))
        );
        assert_ne!(
            CacheKey::search("A Study of X", Some("Smith"), Some(2020)),
            CacheKey::search("A Study of X", Some("Smith"), Some(2021))
        );
    }

    #[test]
    fn clear_removes_everything() {
        let cache = AuditCache::default();
        cache.put(CacheKey::identifier("10.1/a"), record("A"), DEFAULT_TTL);
        cache.put(CacheKey::identifier("10.1/b"), record("B"), DEFAULT_TTL);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn sqlite_write_and_read_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let key = CacheKey::retraction("10.1/abc");
        let status = CachedValue::Status(RetractionStatus {
            identifier: "10.1/abc".into(),
            status: RetractionState::Retracted,
            notice: Some("10.1/notice".into()),
        });

        {
            let cache = AuditCache::open(&path, DEFAULT_TTL).unwrap();
            assert!(cache.has_persistence());
            cache.put(key.clone(), status.clone(), DEFAULT_TTL);
            assert_eq!(cache.disk_len(), 1);
        }

        let cache = AuditCache::open(&path, DEFAULT_TTL).unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&key), Some(status));
        assert_eq!(cache.len(), 1, "L2 hit is promoted to L1");
    }

    #[test]
    fn sqlite_expired_evicted_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let key = CacheKey::identifier("10.1/abc");

        {
            let cache = AuditCache::open(&path, DEFAULT_TTL).unwrap();
            cache.put(key.clone(), record("X"), Duration::ZERO);
            assert_eq!(cache.disk_len(), 1);
        }

        let cache = AuditCache::open(&path, DEFAULT_TTL).unwrap();
        assert_eq!(cache.disk_len(), 0);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn sqlite_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AuditCache::open(&dir.path().join("cache.db"), DEFAULT_TTL).unwrap();
        cache.put(CacheKey::identifier("10.1/a"), record("A"), DEFAULT_TTL);
        cache.clear();
        assert_eq!(cache.disk_len(), 0);
        assert!(cache.get(&CacheKey::identifier("10.1/a")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_fetch_once() {
        let cache = AuditCache::default();
        let key = CacheKey::identifier("10.1/abc");
        let fetches = AtomicUsize::new(0);

        let callers = (0..8).map(|_| {
            cache.get_or_fetch(&key, DEFAULT_TTL, || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, ()>(record("A Study of X"))
            })
        });
        let results = futures_util::future::join_all(callers).await;

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result, Ok(record("A Study of X")));
        }
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = AuditCache::default();
        let key = CacheKey::identifier("10.1/abc");

        let first = cache
            .get_or_fetch(&key, DEFAULT_TTL, || async { Err::<CachedValue, _>("boom") })
            .await;
        assert_eq!(first, Err("boom"));
        assert!(cache.get(&key).is_none());

        let second = cache
            .get_or_fetch(&key, DEFAULT_TTL, || async { Ok::<_, &str>(record("X")) })
            .await;
        assert_eq!(second, Ok(record("X")));
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let cache = AuditCache::default();
        let notify = tokio::sync::Notify::new();
        let key_a = CacheKey::identifier("10.1/a");
        let key_b = CacheKey::identifier("10.1/b");

        let a = cache.get_or_fetch(&key_a, DEFAULT_TTL, || async {
            notify.notified().await;
            Ok::<_, ()>(record("A"))
        });
        let b = cache.get_or_fetch(&key_b, DEFAULT_TTL, || async {
            notify.notify_one();
            Ok::<_, ()>(record("B"))
        });

        let (a, b) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(a, b) })
            .await
            .expect("fetch for one key blocked another");
        assert_eq!(a, Ok(record("A")));
        assert_eq!(b, Ok(record("B")));
    }
}
