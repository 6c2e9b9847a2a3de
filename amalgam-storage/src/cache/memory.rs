//! In-memory cache backend with per-entry TTLs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use amalgam_core::{CacheKey, Clock, CoreResult, StorageError, SystemClock, Timestamp};
use chrono::Duration;
use tracing::debug;

use super::traits::{CacheStats, CacheStore};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<Timestamp>,
}

/// Process-local cache backend.
///
/// Expired entries are dropped lazily on the read that discovers them.
#[derive(Debug)]
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
}

impl InMemoryCacheStore {
    /// Create an empty store on wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Check whether a live entry exists without touching the statistics.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        self.entries
            .read()
            .map(|entries| {
                entries
                    .get(&key.encode())
                    .is_some_and(|e| e.expires_at.map_or(true, |at| now <= at))
            })
            .unwrap_or(false)
    }

    /// Drop every entry.
    pub fn clear(&self) -> CoreResult<()> {
        self.entries
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .clear();
        Ok(())
    }
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(&self, key: &CacheKey) -> CoreResult<Option<Vec<u8>>> {
        let encoded = key.encode();
        let now = self.clock.now();

        let expired = {
            let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
            match entries.get(&encoded) {
                Some(entry) if entry.expires_at.map_or(true, |at| now <= at) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            self.entries
                .write()
                .map_err(|_| StorageError::LockPoisoned)?
                .remove(&encoded);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            debug!(key = %encoded, "cache entry expired");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    fn set(&self, key: &CacheKey, value: Vec<u8>, ttl_seconds: u64) -> CoreResult<()> {
        // A TTL past the representable range behaves like no expiry.
        let expires_at = if ttl_seconds == 0 {
            None
        } else {
            i64::try_from(ttl_seconds)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|ttl| self.clock.now().checked_add_signed(ttl))
        };
        self.entries
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(key.encode(), CacheEntry { value, expires_at });
        Ok(())
    }

    fn delete(&self, key: &CacheKey) -> CoreResult<bool> {
        Ok(self
            .entries
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .remove(&key.encode())
            .is_some())
    }

    fn stats(&self) -> CoreResult<CacheStats> {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: entries.len() as u64,
            memory_bytes: entries
                .iter()
                .map(|(k, e)| (k.len() + e.value.len()) as u64)
                .sum(),
            expirations: self.expirations.load(Ordering::Relaxed),
        })
    }
}
