//! Aggregate cache layer.
//!
//! The engine stores encoded aggregate snapshots under deterministic
//! [`CacheKey`](amalgam_core::CacheKey)s. Backends only see opaque bytes, so
//! any key/value store with per-entry TTLs can sit behind [`CacheStore`].
//!
//! # Example
//!
//! ```ignore
//! let cache = InMemoryCacheStore::new();
//! cache.set(&key, bytes, 0)?;          // 0 = keep indefinitely
//! let hit = cache.get(&key)?;          // Some(bytes) or None on miss
//! ```

pub mod memory;
pub mod traits;

pub use memory::InMemoryCacheStore;
pub use traits::{CacheStats, CacheStore};
