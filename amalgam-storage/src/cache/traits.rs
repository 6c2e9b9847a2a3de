//! Cache backend trait and statistics.

use amalgam_core::{CacheKey, CoreResult};

/// Cache backend trait for pluggable cache implementations.
///
/// This trait abstracts over different cache backends (e.g., Redis,
/// memcached, in-memory). Implementations must be thread-safe; the engine
/// itself calls them synchronously from one unit of work at a time.
///
/// # TTL
///
/// `ttl_seconds = 0` keeps the entry until it is deleted or overwritten.
/// Any other value makes the entry unreadable once that many seconds have
/// passed since the write.
pub trait CacheStore: Send + Sync {
    /// Get the raw entry stored under `key`, or `None` on a miss.
    fn get(&self, key: &CacheKey) -> CoreResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous entry.
    fn set(&self, key: &CacheKey, value: Vec<u8>, ttl_seconds: u64) -> CoreResult<()>;

    /// Delete the entry under `key`. Returns whether an entry was removed.
    fn delete(&self, key: &CacheKey) -> CoreResult<bool>;

    /// Get cache statistics.
    fn stats(&self) -> CoreResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Approximate memory usage in bytes.
    pub memory_bytes: u64,
    /// Number of entries dropped because their TTL ran out.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
