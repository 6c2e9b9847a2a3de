//! Error types shared by the storage seams and the engine

use thiserror::Error;

/// Storage layer errors raised by cache and child-record collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Cache operation failed for key {key}: {reason}")]
    Cache { key: String, reason: String },

    #[error("Lookup failed for {model}.{field}: {reason}")]
    LookupFailed {
        model: String,
        field: String,
        reason: String,
    },

    #[error("Persist failed for {model}: {reason}")]
    PersistFailed { model: String, reason: String },

    #[error("Unknown model: {model}")]
    UnknownModel { model: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Snapshot encode/decode errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to encode {what}: {reason}")]
    Encode { what: String, reason: String },

    #[error("Failed to decode entry at {key}: {reason}")]
    Decode { key: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for core and storage operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for core and storage operations.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// TESTS
// =============================================================================
