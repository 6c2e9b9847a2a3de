//! Error types for engine operations

use amalgam_core::{CodecError, CoreError, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One complaint raised by a validation hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub attribute: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.attribute, self.message)
    }
}

/// Engine errors.
///
/// A missing aggregate is not an error: `load` returns `Ok(None)`. Unresolved
/// mapping paths are not errors either; the attribute keeps its default.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Validation failed for {aggregate_type} with {} issue(s)", .issues.len())]
    ValidationFailed {
        aggregate_type: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("Persist failed for {aggregate_type} on child {model}: {reason}")]
    PersistFailed {
        aggregate_type: String,
        model: String,
        reason: String,
    },

    #[error("Unknown aggregate type: {name}")]
    UnknownType { name: String },

    #[error("Unknown attribute {attribute} on {aggregate_type}")]
    UnknownAttribute {
        aggregate_type: String,
        attribute: String,
    },

    #[error("Attribute {attribute} on {aggregate_type} is managed by the engine")]
    ReadOnlyAttribute {
        aggregate_type: String,
        attribute: String,
    },

    #[error("Unknown relation {relation} on {aggregate_type}")]
    UnknownRelation {
        aggregate_type: String,
        relation: String,
    },

    #[error("Invalid declaration for {aggregate_type}: {reason}")]
    InvalidDeclaration {
        aggregate_type: String,
        reason: String,
    },

    #[error("{aggregate_type} aggregate has no id")]
    MissingId { aggregate_type: String },

    #[error("Index {index} out of bounds for list of {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::Core(err.into())
    }
}

impl From<CodecError> for EngineError {
    fn from(err: CodecError) -> Self {
        EngineError::Core(err.into())
    }
}

impl EngineError {
    /// True for failures that happened after some child writes may already
    /// have landed. Callers should reload with a forced refresh before retrying.
    pub fn is_partial_write(&self) -> bool {
        matches!(self, EngineError::PersistFailed { .. })
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
