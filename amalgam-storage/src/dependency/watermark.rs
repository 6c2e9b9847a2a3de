//! Watermark and change journal for cache invalidation.
//!
//! The change journal tracks mutations per named channel, allowing cached
//! values to determine if the data they were derived from has moved on.
//! Watermarks represent a point in a channel's mutation history.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use amalgam_core::{CoreResult, StorageError, Timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CacheDependency;

/// A watermark representing a point in a change history.
///
/// Watermarks are monotonically increasing and can be compared to determine
/// if mutations have occurred between two points in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark {
    /// Monotonically increasing sequence number.
    /// Each mutation increments this value.
    pub sequence: i64,
    /// When this watermark was observed.
    pub observed_at: Timestamp,
}

impl Watermark {
    /// Create a new watermark with the given sequence number.
    pub fn new(sequence: i64) -> Self {
        Self {
            sequence,
            observed_at: Utc::now(),
        }
    }

    /// Create a new watermark with explicit observed_at timestamp.
    pub fn with_timestamp(sequence: i64, observed_at: DateTime<Utc>) -> Self {
        Self {
            sequence,
            observed_at,
        }
    }

    /// Create a zero watermark (beginning of time).
    pub fn zero() -> Self {
        Self {
            sequence: 0,
            observed_at: DateTime::UNIX_EPOCH,
        }
    }

    /// Check if this watermark is newer than another.
    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.sequence > other.sequence
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::zero()
    }
}

/// Change journal for tracking mutations.
///
/// Channels are free-form names chosen by the writer, e.g. `orders:42` for
/// "anything about the orders of customer 42".
pub trait ChangeJournal: Send + Sync {
    /// Get the current watermark for a channel.
    fn current_watermark(&self, channel: &str) -> CoreResult<Watermark>;

    /// Record a mutation on a channel and return the new watermark.
    fn record_change(&self, channel: &str) -> CoreResult<Watermark>;

    /// Check if any changes have occurred on a channel since the watermark.
    fn changes_since(&self, channel: &str, watermark: &Watermark) -> CoreResult<bool> {
        Ok(self
            .current_watermark(channel)?
            .is_newer_than(watermark))
    }
}

/// In-memory change journal.
#[derive(Debug, Default)]
pub struct InMemoryChangeJournal {
    /// Current sequence number per channel.
    sequences: RwLock<HashMap<String, i64>>,
}

impl InMemoryChangeJournal {
    /// Create a new in-memory change journal.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChangeJournal for InMemoryChangeJournal {
    fn current_watermark(&self, channel: &str) -> CoreResult<Watermark> {
        let sequences = self.sequences.read().map_err(|_| StorageError::LockPoisoned)?;
        let sequence = sequences.get(channel).copied().unwrap_or(0);
        Ok(Watermark::new(sequence))
    }

    fn record_change(&self, channel: &str) -> CoreResult<Watermark> {
        let mut sequences = self.sequences.write().map_err(|_| StorageError::LockPoisoned)?;
        let sequence = sequences.entry(channel.to_string()).or_insert(0);
        *sequence += 1;
        Ok(Watermark::new(*sequence))
    }
}

/// Dependency on one channel of a change journal.
#[derive(Clone)]
pub struct JournalDependency {
    journal: Arc<dyn ChangeJournal>,
    channel: String,
}

impl JournalDependency {
    pub fn new(journal: Arc<dyn ChangeJournal>, channel: impl Into<String>) -> Self {
        Self {
            journal,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl std::fmt::Debug for JournalDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalDependency")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl CacheDependency for JournalDependency {
    fn capture(&self) -> CoreResult<Watermark> {
        self.journal.current_watermark(&self.channel)
    }

    fn has_changed(&self, captured: &Watermark) -> CoreResult<bool> {
        self.journal.changes_since(&self.channel, captured)
    }
}
