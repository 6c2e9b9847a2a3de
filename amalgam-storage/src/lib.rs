//! Amalgam Storage - Collaborator Seams and In-Memory Implementations
//!
//! Defines the three external capabilities the aggregate engine consumes:
//! a key/value cache ([`CacheStore`]), a child-record store
//! ([`ChildModelStore`]) and staleness probes ([`CacheDependency`]).
//! In-memory implementations back the tests and small deployments.

pub mod cache;
pub mod child;
pub mod dependency;

pub use cache::{CacheStats, CacheStore, InMemoryCacheStore};
pub use child::{ChildModelStore, InMemoryChildStore, Normalizer};
pub use dependency::{
    CacheDependency, ChangeJournal, InMemoryChangeJournal, JournalDependency, Watermark,
};
