//! Cache dependency on another aggregate's version.

use std::fmt;
use std::sync::Arc;

use amalgam_core::{AggregateId, CacheKey, CoreResult, EngineConfig};
use amalgam_storage::{CacheDependency, CacheStore, Watermark};
use tracing::debug;

use crate::snapshot::AggregateSnapshot;

/// Changes whenever the cached version of one aggregate moves.
///
/// The watermark sequence is the version found in the cache at capture time,
/// or 0 when the aggregate is not cached. Every save bumps the version and
/// rewrites the cache entry, so any save of the watched aggregate invalidates
/// values that depend on it. An eviction does too.
#[derive(Clone)]
pub struct AggregateVersionDependency {
    cache: Arc<dyn CacheStore>,
    key: CacheKey,
}

impl AggregateVersionDependency {
    pub fn new(cache: Arc<dyn CacheStore>, key: CacheKey) -> Self {
        Self { cache, key }
    }

    /// Watch `aggregate_type`/`id` under the default key prefix. Engines
    /// configured with another prefix need [`for_config`](Self::for_config).
    pub fn on(cache: Arc<dyn CacheStore>, aggregate_type: &str, id: impl Into<AggregateId>) -> Self {
        Self::new(cache, CacheKey::aggregate(aggregate_type, id.into()))
    }

    /// Watch the key an engine running on `config` writes for `aggregate_type`/`id`.
    pub fn for_config(
        cache: Arc<dyn CacheStore>,
        config: &EngineConfig,
        aggregate_type: &str,
        id: impl Into<AggregateId>,
    ) -> Self {
        Self::new(
            cache,
            CacheKey::new(config.key_prefix.as_str(), aggregate_type, id.into()),
        )
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    fn cached_version(&self) -> CoreResult<i64> {
        let Some(bytes) = self.cache.get(&self.key)? else {
            return Ok(0);
        };
        match AggregateSnapshot::decode(&self.key, &bytes) {
            Ok(snapshot) => Ok(snapshot.version),
            Err(err) => {
                debug!(key = %self.key, error = %err, "watched entry undecodable");
                Ok(0)
            }
        }
    }
}

impl fmt::Debug for AggregateVersionDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateVersionDependency")
            .field("key", &self.key.encode())
            .finish_non_exhaustive()
    }
}

impl CacheDependency for AggregateVersionDependency {
    fn capture(&self) -> CoreResult<Watermark> {
        Ok(Watermark::new(self.cached_version()?))
    }

    fn has_changed(&self, captured: &Watermark) -> CoreResult<bool> {
        Ok(self.cached_version()? != captured.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amalgam_storage::InMemoryCacheStore;
    use serde_json::json;

    fn write_version(cache: &InMemoryCacheStore, key: &CacheKey, version: i64) {
        let raw = json!({
            "aggregate_type": "Customer",
            "id": 42,
            "version": version,
            "attributes": {"id": 42, "version": version}
        });
        cache.set(key, raw.to_string().into_bytes(), 0).unwrap();
    }

    #[test]
    fn test_missing_entry_captures_zero() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let dep = AggregateVersionDependency::on(cache, "Customer", 42);
        assert_eq!(dep.capture().unwrap().sequence, 0);
    }

    #[test]
    fn test_version_bump_is_a_change() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let dep = AggregateVersionDependency::on(cache.clone(), "Customer", 42);
        write_version(&cache, dep.key(), 3);

        let captured = dep.capture().unwrap();
        assert_eq!(captured.sequence, 3);
        assert!(!dep.has_changed(&captured).unwrap());

        write_version(&cache, dep.key(), 4);
        assert!(dep.has_changed(&captured).unwrap());
    }

    #[test]
    fn test_for_config_follows_key_prefix() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let config = EngineConfig::new().with_key_prefix("Tenant7");
        let dep = AggregateVersionDependency::for_config(cache.clone(), &config, "Customer", 42);
        assert_eq!(dep.key().encode(), "Tenant7:Customer:42");

        let captured = dep.capture().unwrap();
        write_version(&cache, dep.key(), 2);
        assert!(dep.has_changed(&captured).unwrap());
    }

    #[test]
    fn test_eviction_is_a_change() {
        let cache = Arc::new(InMemoryCacheStore::new());
        let dep = AggregateVersionDependency::on(cache.clone(), "Customer", 42);
        write_version(&cache, dep.key(), 2);
        let captured = dep.capture().unwrap();

        cache.delete(dep.key()).unwrap();
        assert!(dep.has_changed(&captured).unwrap());
    }
}
