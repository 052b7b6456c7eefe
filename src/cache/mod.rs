// Content-addressed translation cache.
//
// The manager layers three guarantees over a pluggable backing store:
// request coalescing (at most one in-flight fill per key), fail-open
// degradation when the store misbehaves, and hit/miss accounting.

pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{CacheBackend, CacheConfig};
use crate::error::{OtoyakuError, Result};

pub use store::{CacheEntry, CacheStore, CachedTranslation, FileStore, MemoryStore, now_unix};

/// Counters surfaced by `otoyaku cache info`.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct CacheManager {
    store: Box<dyn CacheStore>,
    enabled: bool,
    /// Per-key fill gates. A fill holds its key's gate for the whole remote
    /// call; waiters re-check the store once they acquire it.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheManager {
    pub fn from_config(config: &CacheConfig) -> Self {
        let store: Box<dyn CacheStore> = match config.backend {
            CacheBackend::Memory => Box::new(MemoryStore::new(
                config.ttl(),
                config.max_entries,
                config.max_bytes,
            )),
            CacheBackend::File => Box::new(FileStore::new(
                config.dir.clone(),
                config.ttl(),
                config.max_entries,
            )),
        };
        Self::new(store, config.enabled)
    }

    pub fn new(store: Box<dyn CacheStore>, enabled: bool) -> Self {
        Self {
            store,
            enabled,
            inflight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Deterministic fingerprint of everything that makes a translation
    /// reusable: the normalized text, the language pair, the relevant
    /// context fields, and the strategy it is pinned to ("any" when the
    /// fallback chain may pick freely). Fields are length-prefixed so
    /// adjacent values cannot collide.
    pub fn fingerprint(
        text: &str,
        source_lang: &str,
        target_lang: &str,
        context_fields: &[&str],
        strategy: Option<&str>,
    ) -> String {
        let mut hasher = blake3::Hasher::new();
        for field in [text, source_lang, target_lang]
            .into_iter()
            .chain(context_fields.iter().copied())
            .chain([strategy.unwrap_or("any")])
        {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Store lookup with fail-open degradation: a backend error logs a
    /// warning and reads as a miss, never as a request failure.
    pub async fn get(&self, key: &str) -> Option<CachedTranslation> {
        if !self.enabled {
            return None;
        }
        let found = match self.store.get(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Cache backend degraded, treating as miss: {}", e);
                None
            }
        };
        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Unconditional write-through. Backend errors degrade to a warning.
    pub async fn put(&self, key: &str, source_text: &str, value: &CachedTranslation) {
        if !self.enabled {
            return;
        }
        let entry = CacheEntry {
            key: key.to_string(),
            source_text: source_text.to_string(),
            value: value.clone(),
            created_at: now_unix(),
            bytes: key.len() + source_text.len() + value.text.len() + value.strategy.len(),
        };
        match self.store.set(entry).await {
            Ok(evicted) => {
                if evicted > 0 {
                    self.evictions.fetch_add(evicted, Ordering::Relaxed);
                }
            }
            Err(e) => warn!("Cache backend degraded, skipping write: {}", e),
        }
    }

    /// Fetch `key`, or run `fill` to produce it. At most one fill per key is
    /// in flight at any time: concurrent callers for the same key wait on
    /// the first call's gate and then re-check the store. A failed fill
    /// writes nothing and releases the generation, so the next waiter gets a
    /// fresh chance rather than being bound to the failure.
    ///
    /// Returns the value and whether it came from the cache.
    pub async fn fetch_or_fill<F, Fut>(
        &self,
        key: &str,
        source_text: &str,
        fill: F,
    ) -> Result<(CachedTranslation, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CachedTranslation>>,
    {
        if !self.enabled {
            return fill().await.map(|value| (value, false));
        }

        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let outcome = {
            let _guard = gate.lock().await;
            if let Some(value) = self.get(key).await {
                debug!("Coalesced lookup served from cache: {}", key);
                Ok((value, true))
            } else {
                let filled = fill().await;
                if let Ok(value) = &filled {
                    self.put(key, source_text, value).await;
                }
                filled.map(|value| (value, false))
            }
        };

        // Drop the gate entry once nobody else is waiting on it.
        let mut inflight = self.inflight.lock().await;
        if let Some(existing) = inflight.get(key) {
            if Arc::strong_count(existing) <= 2 {
                inflight.remove(key);
            }
        }

        outcome
    }

    /// Targeted cache busting: drops entries whose key or source text
    /// matches the pattern (e.g. after a provider's model version changes).
    pub async fn invalidate(&self, pattern: &str) -> Result<u64> {
        let regex = Regex::new(pattern)
            .map_err(|e| OtoyakuError::InvalidRequest(format!("bad invalidation pattern: {}", e)))?;
        self.store.invalidate(&regex).await
    }

    pub async fn clear(&self) -> Result<u64> {
        self.store.clear().await
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.store.entry_count().await.unwrap_or(0);
        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
