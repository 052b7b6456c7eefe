use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OtoyakuError, Result};

/// Cached value: the translated text plus the strategy that produced it, so
/// cache hits still carry provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTranslation {
    pub text: String,
    pub strategy: String,
}

/// A stored entry. `source_text` is kept for pattern invalidation; `bytes`
/// is the size estimate charged against the byte budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub source_text: String,
    pub value: CachedTranslation,
    /// Unix seconds at creation; the TTL clock
    pub created_at: u64,
    pub bytes: usize,
}

impl CacheEntry {
    pub fn is_expired(&self, ttl: Duration, now: u64) -> bool {
        now.saturating_sub(self.created_at) > ttl.as_secs()
    }
}

pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Backing store contract. Implementations enforce TTL and capacity on their
/// own; the manager layers coalescing, metrics, and fail-open semantics on
/// top of these four operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// `None` is a miss; an empty translated string is still a present value.
    async fn get(&self, key: &str) -> Result<Option<CachedTranslation>>;

    /// Overwrites unconditionally and resets the TTL clock. Returns the
    /// number of entries physically evicted while making room.
    async fn set(&self, entry: CacheEntry) -> Result<u64>;

    /// Removes entries whose key or source text matches. Returns the count.
    async fn invalidate(&self, pattern: &Regex) -> Result<u64>;

    /// Drops everything. Returns the count removed.
    async fn clear(&self) -> Result<u64>;

    async fn entry_count(&self) -> Result<u64>;
}

/// In-process store with TTL plus LRU eviction under count and byte budgets.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    ttl: Duration,
    max_entries: usize,
    max_bytes: usize,
}

struct MemoryInner {
    map: LruCache<String, CacheEntry>,
    total_bytes: usize,
}

impl MemoryStore {
    pub fn new(ttl: Duration, max_entries: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                map: LruCache::unbounded(),
                total_bytes: 0,
            }),
            ttl,
            max_entries: max_entries.max(1),
            max_bytes,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| OtoyakuError::Cache("memory store lock poisoned".to_string()))
    }

    /// Expired entries go first regardless of recency, then LRU until the
    /// count and byte budgets hold again.
    fn evict(inner: &mut MemoryInner, ttl: Duration, max_entries: usize, max_bytes: usize) -> u64 {
        let now = now_unix();
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, entry)| entry.is_expired(ttl, now))
            .map(|(key, _)| key.clone())
            .collect();
        let mut evicted = 0;
        for key in expired {
            if let Some(entry) = inner.map.pop(&key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
                evicted += 1;
            }
        }
        while inner.map.len() > max_entries || inner.total_bytes > max_bytes {
            match inner.map.pop_lru() {
                Some((_, entry)) => {
                    inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CachedTranslation>> {
        let mut inner = self.lock()?;
        let expired = match inner.map.get(key) {
            Some(entry) if entry.is_expired(self.ttl, now_unix()) => true,
            Some(entry) => return Ok(Some(entry.value.clone())),
            None => return Ok(None),
        };
        if expired {
            if let Some(entry) = inner.map.pop(key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
            }
        }
        Ok(None)
    }

    async fn set(&self, entry: CacheEntry) -> Result<u64> {
        let mut inner = self.lock()?;
        if let Some(previous) = inner.map.pop(&entry.key) {
            inner.total_bytes = inner.total_bytes.saturating_sub(previous.bytes);
        }
        inner.total_bytes += entry.bytes;
        inner.map.put(entry.key.clone(), entry);
        Ok(Self::evict(
            &mut inner,
            self.ttl,
            self.max_entries,
            self.max_bytes,
        ))
    }

    async fn invalidate(&self, pattern: &Regex) -> Result<u64> {
        let mut inner = self.lock()?;
        let matching: Vec<String> = inner
            .map
            .iter()
            .filter(|(key, entry)| pattern.is_match(key) || pattern.is_match(&entry.source_text))
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = 0;
        for key in matching {
            if let Some(entry) = inner.map.pop(&key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<u64> {
        let mut inner = self.lock()?;
        let count = inner.map.len() as u64;
        inner.map.clear();
        inner.total_bytes = 0;
        Ok(count)
    }

    async fn entry_count(&self) -> Result<u64> {
        Ok(self.lock()?.map.len() as u64)
    }
}

/// One JSON file per key under a cache directory, shared between runs.
/// Read problems are treated as misses; only write problems surface, and the
/// manager downgrades those to warnings.
pub struct FileStore {
    dir: PathBuf,
    ttl: Duration,
    max_entries: usize,
}

impl FileStore {
    pub fn new(dir: PathBuf, ttl: Duration, max_entries: usize) -> Self {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("Failed to create cache directory {}: {}", dir.display(), e);
        }
        Self {
            dir,
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    async fn read_entry(&self, path: &PathBuf) -> Option<CacheEntry> {
        let content = tokio::fs::read_to_string(path).await.ok()?;
        match serde_json::from_str::<CacheEntry>(&content) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Discarding unreadable cache entry {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn list_entries(&self) -> Vec<(PathBuf, CacheEntry)> {
        let mut entries = Vec::new();
        let Ok(mut dir) = tokio::fs::read_dir(&self.dir).await else {
            return entries;
        };
        while let Ok(Some(item)) = dir.next_entry().await {
            let path = item.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(entry) = self.read_entry(&path).await {
                    entries.push((path, entry));
                }
            }
        }
        entries
    }
}

#[async_trait]
impl CacheStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<CachedTranslation>> {
        let path = self.entry_path(key);
        let Some(entry) = self.read_entry(&path).await else {
            return Ok(None);
        };
        if entry.is_expired(self.ttl, now_unix()) {
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    async fn set(&self, entry: CacheEntry) -> Result<u64> {
        let path = self.entry_path(&entry.key);
        let content = serde_json::to_string_pretty(&entry)
            .map_err(|e| OtoyakuError::Cache(format!("serialize cache entry: {}", e)))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| OtoyakuError::Cache(format!("write cache entry: {}", e)))?;

        // Best-effort capacity sweep: expired entries first, then oldest.
        let mut listed = self.list_entries().await;
        if listed.len() <= self.max_entries {
            return Ok(0);
        }
        let now = now_unix();
        listed.sort_by_key(|(_, entry)| {
            (
                !entry.is_expired(self.ttl, now),
                entry.created_at,
            )
        });
        let excess = listed.len() - self.max_entries;
        let mut evicted = 0;
        for (path, _) in listed.into_iter().take(excess) {
            if tokio::fs::remove_file(&path).await.is_ok() {
                evicted += 1;
            }
        }
        debug!("File cache evicted {} entries", evicted);
        Ok(evicted)
    }

    async fn invalidate(&self, pattern: &Regex) -> Result<u64> {
        let mut removed = 0;
        for (path, entry) in self.list_entries().await {
            if pattern.is_match(&entry.key) || pattern.is_match(&entry.source_text) {
                if tokio::fs::remove_file(&path).await.is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<u64> {
        let mut removed = 0;
        for (path, _) in self.list_entries().await {
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn entry_count(&self) -> Result<u64> {
        Ok(self.list_entries().await.len() as u64)
    }
}
