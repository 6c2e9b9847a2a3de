//! Amalgam Core - Aggregate Data Types
//!
//! Plain data structures shared by the storage seams and the aggregate
//! engine: identifiers, cache keys, child records, configuration, clocks
//! and the error taxonomy. No I/O lives here.

pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod record;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use error::{CodecError, ConfigError, CoreError, CoreResult, StorageError};
pub use identity::{AggregateId, CacheKey, Timestamp, DEFAULT_KEY_PREFIX};
pub use record::{AttributeValue, ChildRecord};
