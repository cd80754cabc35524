use lru::LruCache;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::config::CacheConfig;
use crate::core::errors::{CacheError, ConfigError};
use crate::utils::Metrics;

/// Cached result plus its bookkeeping timestamps
#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    created_at: Instant,
    last_access_at: Instant,
}

/// SHA-256 hex digest of `bytes`, for folding secondary inputs into cache params
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Content-addressed result cache with TTL expiry and LRU eviction.
///
/// Values are stored as JSON so a reader asking for the wrong shape gets a miss
/// instead of a panic. The map is local to this process; replicas each keep
/// their own copy.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    // lru keeps recency order; every hit and every set moves the key to the front
    entries: RwLock<LruCache<String, CacheEntry>>,
    ttl: Duration,
    metrics: Option<Metrics>,
}

/// Snapshot for the stats endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl ResultCache {
    pub fn new(config: &CacheConfig, metrics: Option<Metrics>) -> Result<Self, ConfigError> {
        let capacity = NonZeroUsize::new(config.max_entries).ok_or(ConfigError::InvalidCacheSize)?;

        Ok(Self {
            inner: Arc::new(CacheInner {
                entries: RwLock::new(LruCache::new(capacity)),
                ttl: config.ttl,
                metrics,
            }),
        })
    }

    /// Fingerprint of (input bytes, canonical params, scope) as lowercase SHA-256 hex.
    ///
    /// Params are canonicalised through `serde_json::Value`, whose object keys are
    /// kept sorted, so field order in the caller's struct never changes the key.
    /// Without a scope the caller gets a one-off key that nothing else can match.
    pub fn make_key<P: Serialize + ?Sized>(input: &[u8], params: &P, scope: Option<&str>) -> String {
        let canonical = serde_json::to_value(params)
            .map(|v| v.to_string())
            .unwrap_or_default();

        let scope = match scope.map(str::trim).filter(|s| !s.is_empty()) {
            Some(scope) => scope.to_string(),
            None => {
                warn!("Cache key requested without a scope token; result will not be shared");
                format!("unscoped:{}", uuid::Uuid::new_v4())
            }
        };

        let mut hasher = Sha256::new();
        // Length prefixes keep the three parts from bleeding into each other
        for part in [input, canonical.as_bytes(), scope.as_bytes()] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }

        hex::encode(hasher.finalize())
    }

    /// Look up `key`, returning `None` for a miss, an expired entry or a corrupt one
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let mut entries = self.inner.entries.write();

        let expired = match entries
            .peek(key)
            .map(|entry| now.duration_since(entry.created_at) > self.inner.ttl)
        {
            Some(expired) => expired,
            None => {
                drop(entries);
                self.record_miss();
                return None;
            }
        };

        if expired {
            entries.pop(key);
            let size = entries.len();
            drop(entries);
            debug!("Cache entry {} expired", short(key));
            self.update_size(size);
            self.record_miss();
            return None;
        }

        // `get` (not `peek`) so the entry becomes most recently used
        let entry = entries.get_mut(key)?;
        match serde_json::from_value::<T>(entry.value.clone()) {
            Ok(value) => {
                entry.last_access_at = now;
                drop(entries);
                if let Some(ref m) = self.inner.metrics {
                    m.record_cache_hit();
                }
                Some(value)
            }
            Err(source) => {
                entries.pop(key);
                let size = entries.len();
                drop(entries);
                let err = CacheError::Corruption {
                    key: short(key).to_string(),
                    source,
                };
                warn!("Dropping cache entry: {}", err);
                if let Some(ref m) = self.inner.metrics {
                    m.record_cache_corruption();
                }
                self.update_size(size);
                self.record_miss();
                None
            }
        }
    }

    /// Insert or overwrite `key`; evicts the least recently used entry when full
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let value = serde_json::to_value(value).map_err(CacheError::Serialize)?;
        let now = Instant::now();

        let size = {
            let mut entries = self.inner.entries.write();
            if let Some((evicted, _)) = entries.push(
                key.to_string(),
                CacheEntry {
                    value,
                    created_at: now,
                    last_access_at: now,
                },
            ) {
                if evicted != key {
                    debug!("Evicted least recently used cache entry {}", short(&evicted));
                }
            }
            entries.len()
        };

        self.update_size(size);
        Ok(())
    }

    /// True when `key` is present and not expired; does not touch recency
    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .entries
            .read()
            .peek(key)
            .map(|e| Instant::now().duration_since(e.created_at) <= self.inner.ttl)
            .unwrap_or(false)
    }

    /// When `key` was last served or stored
    pub fn last_access(&self, key: &str) -> Option<Instant> {
        self.inner.entries.read().peek(key).map(|e| e.last_access_at)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.inner.entries.read();
        CacheStats {
            entries: entries.len(),
            capacity: entries.cap().get(),
            ttl_secs: self.inner.ttl.as_secs(),
        }
    }

    fn record_miss(&self) {
        if let Some(ref m) = self.inner.metrics {
            m.record_cache_miss();
        }
    }

    fn update_size(&self, size: usize) {
        if let Some(ref m) = self.inner.metrics {
            m.update_cache_size(size);
        }
    }
}

fn short(key: &str) -> &str {
    &key[..key.len().min(12)]
}
