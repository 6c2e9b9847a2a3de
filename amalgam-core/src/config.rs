//! Configuration types

use crate::error::ConfigError;
use crate::identity::{CacheKey, DEFAULT_KEY_PREFIX};
use serde::{Deserialize, Serialize};

/// Engine-wide configuration.
///
/// Per-type settings (mapping, relations, TTL overrides) live on the aggregate
/// schema; this struct only carries what every type shares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// First component of every cache key.
    pub key_prefix: String,
    /// TTL in seconds for aggregate cache entries. 0 caches indefinitely.
    pub default_cache_ttl: u64,
    /// Version assigned to newly created or freshly assembled aggregates.
    pub initial_version: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_cache_ttl: 0,
            initial_version: 1,
        }
    }
}

impl EngineConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the default cache TTL in seconds.
    pub fn with_cache_ttl(mut self, ttl_seconds: u64) -> Self {
        self.default_cache_ttl = ttl_seconds;
        self
    }

    /// Set the initial aggregate version.
    pub fn with_initial_version(mut self, version: i64) -> Self {
        self.initial_version = version;
        self
    }

    /// Check the config for values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "key_prefix".to_string(),
            });
        }
        if !CacheKey::is_valid_type_name(&self.key_prefix) {
            return Err(ConfigError::InvalidValue {
                field: "key_prefix".to_string(),
                value: self.key_prefix.clone(),
                reason: "must not contain ':'".to_string(),
            });
        }
        if self.initial_version < 1 {
            return Err(ConfigError::InvalidValue {
                field: "initial_version".to_string(),
                value: self.initial_version.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
