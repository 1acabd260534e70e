use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_bytes: 16 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
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

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    bytes: usize,
    expires_at: Instant,
    last_accessed: Instant,
}

/// TTL+LRU cache. Expired entries are treated as misses and deleted on
/// access; on insert, expired entries are evicted before any unexpired one
/// is considered for LRU eviction.
#[derive(Debug)]
pub struct TtlLruCache<K: Eq + Hash + Clone, V: Clone> {
    config: CacheConfig,
    entries: HashMap<K, CacheEntry<V>>,
    bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlLruCache<K, V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) => now >= entry.expires_at,
            None => {
                self.misses += 1;
                return None;
            }
        };
        if expired {
            // Expired: miss, and the stale entry goes away.
            if let Some(old) = self.entries.remove(key) {
                self.bytes -= old.bytes;
            }
            self.misses += 1;
            return None;
        }

        let entry = self.entries.get_mut(key)?;
        entry.last_accessed = now;
        self.hits += 1;
        Some(entry.value.clone())
    }

    pub fn insert(&mut self, key: K, value: V, bytes: usize, ttl: Option<Duration>) {
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.config.default_ttl);

        if let Some(old) = self.entries.remove(&key) {
            self.bytes -= old.bytes;
        }

        self.purge_expired();
        while !self.entries.is_empty()
            && (self.entries.len() >= self.config.max_entries
                || self.bytes + bytes > self.config.max_bytes)
        {
            self.evict_lru();
        }

        self.bytes += bytes;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                bytes,
                expires_at: now + ttl,
                last_accessed: now,
            },
        );
    }

    pub fn remove(&mut self, key: &K) -> bool {
        if let Some(old) = self.entries.remove(key) {
            self.bytes -= old.bytes;
            true
        } else {
            false
        }
    }

    /// Drop every entry whose key matches the predicate.
    pub fn invalidate_where<F: Fn(&K) -> bool>(&mut self, pred: F) -> usize {
        let doomed: Vec<K> = self
            .entries
            .keys()
            .filter(|k| pred(k))
            .cloned()
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    pub fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| now >= e.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(old) = self.entries.remove(&key) {
                self.bytes -= old.bytes;
                self.evictions += 1;
            }
        }
    }

    fn evict_lru(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_accessed)
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            if let Some(old) = self.entries.remove(&key) {
                self.bytes -= old.bytes;
                self.evictions += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            bytes: self.bytes,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

/// What the coordinator needs from a cache, independent of its key/value types.
pub trait ManagedCache: Send + Sync {
    fn name(&self) -> &str;
    fn bytes(&self) -> usize;
    fn clear(&self);
    fn purge_expired(&self);
    fn stats(&self) -> CacheStats;
}

/// Shareable handle around a [`TtlLruCache`], registered with the coordinator.
pub struct SharedCache<K: Eq + Hash + Clone, V: Clone> {
    name: String,
    inner: Mutex<TtlLruCache<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> SharedCache<K, V> {
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: Mutex::new(TtlLruCache::new(config)),
        })
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).get(key)
    }

    pub fn insert(&self, key: K, value: V, bytes: usize, ttl: Option<Duration>) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, value, bytes, ttl);
    }

    pub fn remove(&self, key: &K) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
    }

    pub fn invalidate_where<F: Fn(&K) -> bool>(&self, pred: F) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .invalidate_where(pred)
    }

    pub fn clear_all(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl<K: Eq + Hash + Clone + Send, V: Clone + Send> ManagedCache for SharedCache<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn bytes(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .bytes()
    }

    fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn purge_expired(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .purge_expired();
    }

    fn stats(&self) -> CacheStats {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stats()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedCacheStats {
    pub name: String,
    #[serde(flatten)]
    pub stats: CacheStats,
    pub hit_rate: f64,
}

/// Holds the registered caches under one global memory budget. When the total
/// exceeds the budget, the largest cache is cleared first, repeating until
/// under budget.
pub struct CacheCoordinator {
    caches: Vec<Arc<dyn ManagedCache>>,
    global_memory_limit: usize,
    cleanup_interval: Duration,
}

impl CacheCoordinator {
    pub fn new(global_memory_limit: usize, cleanup_interval: Duration) -> Self {
        Self {
            caches: Vec::new(),
            global_memory_limit,
            cleanup_interval,
        }
    }

    pub fn register(&mut self, cache: Arc<dyn ManagedCache>) {
        self.caches.push(cache);
    }

    pub fn total_bytes(&self) -> usize {
        self.caches.iter().map(|c| c.bytes()).sum()
    }

    pub fn enforce_budget(&self) {
        while self.total_bytes() > self.global_memory_limit {
            let largest = self
                .caches
                .iter()
                .max_by_key(|c| c.bytes())
                .filter(|c| c.bytes() > 0);
            match largest {
                Some(cache) => {
                    warn!(cache = cache.name(), "over global cache budget, clearing");
                    cache.clear();
                }
                None => break,
            }
        }
    }

    /// Clear one cache by name, or all when `name` is `None`.
    pub fn clear(&self, name: Option<&str>) {
        for cache in &self.caches {
            if name.is_none() || name == Some(cache.name()) {
                cache.clear();
            }
        }
    }

    pub fn stats(&self) -> Vec<NamedCacheStats> {
        self.caches
            .iter()
            .map(|c| {
                let stats = c.stats();
                NamedCacheStats {
                    name: c.name().to_string(),
                    hit_rate: stats.hit_rate(),
                    stats,
                }
            })
            .collect()
    }

    /// Periodic cleanup loop: purge expired entries and enforce the budget
    /// every `cleanup_interval` until cancelled.
    pub fn spawn_cleanup(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.cleanup_interval) => {
                        for cache in &self.caches {
                            cache.purge_expired();
                        }
                        self.enforce_budget();
                        debug!(total_bytes = self.total_bytes(), "cache cleanup pass");
                    }
                }
            }
        })
    }
}
