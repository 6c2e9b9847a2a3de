//! Cache dependencies.
//!
//! A dependency answers "has the thing this cached value was derived from
//! changed?". Because cached relation ids travel inside serialized aggregate
//! snapshots, the dependency itself cannot be stored. Instead it captures a
//! serializable [`Watermark`] when the value is cached, and later compares the
//! current state against that watermark.

pub mod watermark;

use std::fmt::Debug;

use amalgam_core::CoreResult;

pub use watermark::{ChangeJournal, InMemoryChangeJournal, JournalDependency, Watermark};

/// Staleness probe attached to a cached value.
pub trait CacheDependency: Send + Sync + Debug {
    /// Record the current state, to be stored alongside the cached value.
    fn capture(&self) -> CoreResult<Watermark>;

    /// Check whether the state moved past `captured`.
    fn has_changed(&self, captured: &Watermark) -> CoreResult<bool>;
}
