//! Child records owned by an external store.
//!
//! A child record is a named bag of fields. Related records are carried as
//! nested objects, so a dotted path such as `address.line1` walks from the
//! record into its `address` relation and reads `line1` there.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Value type for aggregate attributes and child fields.
pub type AttributeValue = Value;

/// A unit of data owned by the child model store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRecord {
    /// Store-level model name (e.g. `Member`).
    model: String,
    /// Field values, with relations as nested objects.
    fields: Map<String, Value>,
    /// True until the store has persisted this record once.
    is_new: bool,
    /// Field paths written since the last persist.
    #[serde(skip)]
    dirty: BTreeSet<String>,
}

impl ChildRecord {
    /// Create a fresh record that the store has never seen.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            fields: Map::new(),
            is_new: true,
            dirty: BTreeSet::new(),
        }
    }

    /// Wrap fields loaded from the store.
    pub fn existing(model: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            model: model.into(),
            fields,
            is_new: false,
            dirty: BTreeSet::new(),
        }
    }

    /// Build a stored record from a JSON object literal.
    ///
    /// Non-object values produce an empty record.
    pub fn from_json(model: impl Into<String>, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::existing(model, fields)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Mutable access to the raw fields. Writes made here are not tracked.
    pub fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }

    /// Read a top-level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Write a top-level field and mark it dirty.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        let field = field.into();
        self.dirty.insert(field.clone());
        self.fields.insert(field, value);
    }

    /// Record that a (possibly nested) path was written.
    pub fn mark_dirty(&mut self, path: impl Into<String>) {
        self.dirty.insert(path.into());
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Paths written since the last persist, in sorted order.
    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    /// Called by stores once the record has been written.
    pub fn mark_persisted(&mut self) {
        self.is_new = false;
        self.dirty.clear();
    }
}
