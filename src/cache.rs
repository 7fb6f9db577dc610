//! Two-tier memoization cache: a bounded in-memory LRU tier over a durable
//! SQLite tier with expiry.
//!
//! Both tiers and the composed [`TwoTierCache`] expose the same contract
//! (`get`/`set`/`delete`/`exists`/`clear`), with values as JSON. Expiry is
//! checked lazily on read; the durable tier additionally supports a bulk
//! [`SqliteCache::cleanup_expired`] maintenance pass. Durable-tier I/O
//! failures degrade to a miss or no-op rather than surfacing, so the fast
//! tier keeps working standalone.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use crate::error::CacheError;

/// A single cached value with its creation time and optional expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub value: Value,
  pub created_at: DateTime<Utc>,
  pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
  fn new(value: Value, ttl: Option<Duration>) -> Self {
    Self {
      value,
      created_at: Utc::now(),
      expires_at: expiry_from_ttl(ttl),
    }
  }

  /// Whether the entry's expiry (if any) has passed.
  pub fn is_expired(&self) -> bool {
    match self.expires_at {
      Some(expires_at) => Utc::now() > expires_at,
      None => false,
    }
  }
}

fn expiry_from_ttl(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
  ttl
    .and_then(|d| chrono::Duration::from_std(d).ok())
    .map(|d| Utc::now() + d)
}

// --- Fast tier ---

#[derive(Debug)]
struct MemoryInner {
  entries: HashMap<String, CacheEntry>,
  // Keys ordered least- to most-recently accessed (read or write).
  access_order: Vec<String>,
  capacity: usize,
}

impl MemoryInner {
  fn touch(&mut self, key: &str) {
    if let Some(pos) = self.access_order.iter().position(|k| k == key) {
      self.access_order.remove(pos);
    }
    self.access_order.push(key.to_string());
  }

  fn remove_key(&mut self, key: &str) -> bool {
    if self.entries.remove(key).is_some() {
      self.access_order.retain(|k| k != key);
      true
    } else {
      false
    }
  }

  fn evict_lru(&mut self) -> bool {
    if self.access_order.is_empty() {
      return false;
    }
    let oldest = self.access_order.remove(0);
    self.entries.remove(&oldest);
    debug!(key = %oldest, "Evicted least-recently-used cache entry.");
    true
  }
}

/// Bounded in-memory cache with least-recently-used eviction.
///
/// Access (read or write) refreshes an entry's recency; inserting a new key
/// at capacity evicts the least-recently-accessed entry first. Reading an
/// expired entry deletes it and reports absent.
#[derive(Debug)]
pub struct MemoryCache {
  inner: Mutex<MemoryInner>,
}

impl MemoryCache {
  /// Creates a cache holding at most `capacity` entries (minimum 1).
  pub fn new(capacity: usize) -> Self {
    Self {
      inner: Mutex::new(MemoryInner {
        entries: HashMap::new(),
        access_order: Vec::new(),
        capacity: capacity.max(1),
      }),
    }
  }

  pub fn get(&self, key: &str) -> Option<Value> {
    let mut inner = self.inner.lock();
    let expired = match inner.entries.get(key) {
      None => return None,
      Some(entry) => entry.is_expired(),
    };
    if expired {
      inner.remove_key(key);
      return None;
    }
    let value = inner.entries.get(key).map(|e| e.value.clone());
    inner.touch(key);
    value
  }

  pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
    let mut inner = self.inner.lock();
    if !inner.entries.contains_key(key) {
      while inner.entries.len() >= inner.capacity {
        if !inner.evict_lru() {
          break;
        }
      }
    }
    inner.entries.insert(key.to_string(), CacheEntry::new(value, ttl));
    inner.touch(key);
  }

  pub fn delete(&self, key: &str) -> bool {
    self.inner.lock().remove_key(key)
  }

  /// Expiry-aware existence check; does not refresh recency.
  pub fn exists(&self, key: &str) -> bool {
    let mut inner = self.inner.lock();
    match inner.entries.get(key) {
      None => false,
      Some(entry) if entry.is_expired() => {
        inner.remove_key(key);
        false
      }
      Some(_) => true,
    }
  }

  pub fn clear(&self) {
    let mut inner = self.inner.lock();
    inner.entries.clear();
    inner.access_order.clear();
  }

  pub fn len(&self) -> usize {
    self.inner.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

// --- Durable tier ---

fn table_name(namespace: &str) -> Result<String, CacheError> {
  let valid = !namespace.is_empty()
    && namespace
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '_');
  if !valid {
    return Err(CacheError::InvalidTable(namespace.to_string()));
  }
  Ok(format!("cache_{namespace}"))
}

/// Durable key/value cache backed by SQLite.
///
/// One table per namespace: a unique key column, a JSON-serialized value
/// column, and a nullable expiry in Unix milliseconds. Reads past the
/// expiry delete the row and report absent; `cleanup_expired` proactively
/// removes everything past expiry in one statement.
#[derive(Debug)]
pub struct SqliteCache {
  conn: Mutex<Connection>,
  table: String,
}

impl SqliteCache {
  /// Opens (creating if needed) the cache table for `namespace` in the
  /// database at `path`.
  pub fn open(path: impl AsRef<Path>, namespace: &str) -> Result<Self, CacheError> {
    Self::init(Connection::open(path)?, namespace)
  }

  /// Opens the cache table for `namespace` in a private in-memory database.
  pub fn open_in_memory(namespace: &str) -> Result<Self, CacheError> {
    Self::init(Connection::open_in_memory()?, namespace)
  }

  fn init(conn: Connection, namespace: &str) -> Result<Self, CacheError> {
    let table = table_name(namespace)?;
    conn.execute_batch(&format!(
      "CREATE TABLE IF NOT EXISTS {table} (
         key        TEXT PRIMARY KEY,
         value      TEXT NOT NULL,
         created_at INTEGER NOT NULL,
         expires_at INTEGER,
         updated_at INTEGER NOT NULL
       );
       CREATE INDEX IF NOT EXISTS idx_{table}_expires ON {table} (expires_at);"
    ))?;
    Ok(Self {
      conn: Mutex::new(conn),
      table,
    })
  }

  pub fn get(&self, key: &str) -> Option<Value> {
    let conn = self.conn.lock();
    let row: Option<(String, Option<i64>)> = match conn
      .query_row(
        &format!("SELECT value, expires_at FROM {} WHERE key = ?1", self.table),
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
    {
      Ok(row) => row,
      Err(e) => {
        error!(error = %e, table = %self.table, "Durable cache read failed; treating as miss.");
        return None;
      }
    };

    let (raw, expires_at) = row?;
    if let Some(ts) = expires_at {
      if ts <= Utc::now().timestamp_millis() {
        if let Err(e) = conn.execute(
          &format!("DELETE FROM {} WHERE key = ?1", self.table),
          params![key],
        ) {
          warn!(error = %e, table = %self.table, "Failed to delete expired cache row.");
        }
        return None;
      }
    }

    match serde_json::from_str(&raw) {
      Ok(value) => Some(value),
      Err(e) => {
        error!(error = %e, table = %self.table, "Cached value is not valid JSON; treating as miss.");
        None
      }
    }
  }

  pub fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) {
    let now = Utc::now().timestamp_millis();
    let expires_at = ttl.map(|d| now.saturating_add(d.as_millis().min(i64::MAX as u128) as i64));
    let raw = value.to_string();
    let conn = self.conn.lock();
    if let Err(e) = conn.execute(
      &format!(
        "INSERT OR REPLACE INTO {} (key, value, created_at, expires_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        self.table
      ),
      params![key, raw, now, expires_at, now],
    ) {
      error!(error = %e, table = %self.table, "Durable cache write failed; entry not persisted.");
    }
  }

  pub fn delete(&self, key: &str) -> bool {
    let conn = self.conn.lock();
    match conn.execute(
      &format!("DELETE FROM {} WHERE key = ?1", self.table),
      params![key],
    ) {
      Ok(rows) => rows > 0,
      Err(e) => {
        error!(error = %e, table = %self.table, "Durable cache delete failed.");
        false
      }
    }
  }

  pub fn exists(&self, key: &str) -> bool {
    self.get(key).is_some()
  }

  pub fn clear(&self) {
    let conn = self.conn.lock();
    if let Err(e) = conn.execute(&format!("DELETE FROM {}", self.table), []) {
      error!(error = %e, table = %self.table, "Durable cache clear failed.");
    }
  }

  /// Deletes every row whose expiry has passed; returns how many were
  /// removed.
  pub fn cleanup_expired(&self) -> usize {
    let now = Utc::now().timestamp_millis();
    let conn = self.conn.lock();
    match conn.execute(
      &format!(
        "DELETE FROM {} WHERE expires_at IS NOT NULL AND expires_at < ?1",
        self.table
      ),
      params![now],
    ) {
      Ok(rows) => {
        if rows > 0 {
          debug!(table = %self.table, removed = rows, "Cleaned up expired cache rows.");
        }
        rows
      }
      Err(e) => {
        error!(error = %e, table = %self.table, "Expired-row cleanup failed.");
        0
      }
    }
  }

  pub fn len(&self) -> usize {
    let conn = self.conn.lock();
    conn
      .query_row(
        &format!("SELECT COUNT(*) FROM {}", self.table),
        [],
        |row| row.get::<_, i64>(0),
      )
      .map(|n| n as usize)
      .unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

// --- Composed cache ---

const DEFAULT_MEMORY_CAPACITY: usize = 100;
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60 * 24);

/// Builder for configuring and creating a [`TwoTierCache`].
#[derive(Debug, Clone)]
pub struct TwoTierCacheBuilder {
  name: String,
  memory_capacity: usize,
  default_ttl: Option<Duration>,
  path: Option<PathBuf>,
}

impl TwoTierCacheBuilder {
  /// Namespace of the cache. Determines the durable-tier table name
  /// (`cache_<name>`); must be a plain identifier.
  pub fn name(mut self, name: &str) -> Self {
    self.name = name.to_string();
    self
  }

  /// Fast-tier capacity in entries.
  pub fn memory_capacity(mut self, capacity: usize) -> Self {
    self.memory_capacity = capacity;
    self
  }

  /// TTL applied to `set` calls that don't specify one, and to fast-tier
  /// backfills on durable-tier hits. `None` means entries never expire by
  /// default.
  pub fn default_ttl(mut self, ttl: Option<Duration>) -> Self {
    self.default_ttl = ttl;
    self
  }

  /// Path of the SQLite database file backing the durable tier. When not
  /// set, the durable tier lives in a private in-memory database (useful
  /// for tests and ephemeral namespaces).
  pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
    self.path = Some(path.into());
    self
  }

  pub fn build(self) -> Result<TwoTierCache, CacheError> {
    let durable = match &self.path {
      Some(path) => SqliteCache::open(path, &self.name)?,
      None => SqliteCache::open_in_memory(&self.name)?,
    };
    Ok(TwoTierCache {
      name: self.name,
      default_ttl: self.default_ttl,
      memory: MemoryCache::new(self.memory_capacity),
      durable,
    })
  }
}

impl Default for TwoTierCacheBuilder {
  fn default() -> Self {
    Self {
      name: "default".to_string(),
      memory_capacity: DEFAULT_MEMORY_CAPACITY,
      default_ttl: Some(DEFAULT_TTL),
      path: None,
    }
  }
}

/// The composed cache: fast in-memory tier over the durable SQLite tier.
///
/// Reads check the fast tier first and, on a durable-tier hit, repopulate
/// the fast tier before returning. Writes go to both tiers with the same
/// TTL. The tiers lock independently; there is no lock spanning both, so a
/// racing get/set between tiers can at worst cost one extra factory
/// invocation or one cycle of staleness, never corruption.
#[derive(Debug)]
pub struct TwoTierCache {
  name: String,
  default_ttl: Option<Duration>,
  memory: MemoryCache,
  durable: SqliteCache,
}

impl TwoTierCache {
  pub fn builder() -> TwoTierCacheBuilder {
    TwoTierCacheBuilder::default()
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Direct access to the fast tier.
  pub fn memory(&self) -> &MemoryCache {
    &self.memory
  }

  /// Direct access to the durable tier.
  pub fn durable(&self) -> &SqliteCache {
    &self.durable
  }

  pub fn get(&self, key: &str) -> Option<Value> {
    if let Some(value) = self.memory.get(key) {
      return Some(value);
    }
    let value = self.durable.get(key)?;
    // Populate the fast tier on a durable hit so the next read stays local.
    self.memory.set(key, value.clone(), self.default_ttl);
    Some(value)
  }

  pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
    let ttl = ttl.or(self.default_ttl);
    self.durable.set(key, &value, ttl);
    self.memory.set(key, value, ttl);
  }

  /// Deletes from both tiers; true if either tier had the key.
  pub fn delete(&self, key: &str) -> bool {
    let in_memory = self.memory.delete(key);
    let in_durable = self.durable.delete(key);
    in_memory || in_durable
  }

  pub fn exists(&self, key: &str) -> bool {
    self.memory.exists(key) || self.durable.exists(key)
  }

  pub fn clear(&self) {
    self.memory.clear();
    self.durable.clear();
  }

  /// Runs the durable tier's expired-row cleanup; returns how many rows
  /// were removed.
  pub fn cleanup_expired(&self) -> usize {
    self.durable.cleanup_expired()
  }

  /// Returns the cached value for `key`, or invokes `factory`, stores its
  /// non-absent result in both tiers, and returns it.
  ///
  /// No single-flight de-duplication is performed: two callers racing on
  /// the same missing key may both invoke the factory, so factories must be
  /// idempotent.
  pub fn get_or_set<F>(&self, key: &str, ttl: Option<Duration>, factory: F) -> Option<Value>
  where
    F: FnOnce() -> Option<Value>,
  {
    if let Some(value) = self.get(key) {
      return Some(value);
    }
    let value = factory()?;
    self.set(key, value.clone(), ttl);
    Some(value)
  }
}

/// Builds a stable cache key from a prefix and identifying parameters.
///
/// The parameters are serialized to canonical JSON (object keys sorted) and
/// hashed, so logically-equal parameter sets always map to the same key.
pub fn make_cache_key(prefix: &str, params: &Value) -> String {
  let canonical = params.to_string();
  let digest = Sha256::digest(canonical.as_bytes());
  let mut hex = String::with_capacity(digest.len() * 2);
  for byte in digest {
    let _ = write!(hex, "{byte:02x}");
  }
  format!("{prefix}:{hex}")
}
