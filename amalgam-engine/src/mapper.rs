//! Attribute mapping between aggregates and child records.
//!
//! Each [`MappingEntry`](crate::schema::MappingEntry) names a child model key
//! and a dotted path into that child. Every segment but the last walks into a
//! nested relation object; the last names the field. A path whose
//! intermediate is null or missing is [`Resolution::Unresolved`]: the data is
//! simply not available, and the forward pass resets the attribute to its
//! default (or null) so the aggregate always mirrors stored child state.

use std::sync::Arc;

use amalgam_core::{AttributeValue, ChildRecord};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::aggregate::Aggregate;
use crate::schema::MappingEntry;

/// Outcome of walking a mapping path.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    Resolved(T),
    Unresolved,
}

impl<T> Resolution<T> {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }

    pub fn resolved(self) -> Option<T> {
        match self {
            Resolution::Resolved(value) => Some(value),
            Resolution::Unresolved => None,
        }
    }
}

/// Child records keyed by model key, in declared dependency order.
#[derive(Debug, Clone, Default)]
pub struct ChildRecords {
    slots: Vec<(String, ChildRecord)>,
}

impl ChildRecords {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for `key`. New keys go to the end.
    pub fn insert(&mut self, key: impl Into<String>, record: ChildRecord) {
        let key = key.into();
        match self.slots.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = record,
            None => self.slots.push((key, record)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ChildRecord> {
        self.slots.iter().find(|(k, _)| k == key).map(|(_, r)| r)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ChildRecord> {
        self.slots.iter_mut().find(|(k, _)| k == key).map(|(_, r)| r)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChildRecord)> {
        self.slots.iter().map(|(k, r)| (k.as_str(), r))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn split_path(path: &str) -> (Option<&str>, &str) {
    match path.rsplit_once('.') {
        Some((parents, field)) => (Some(parents), field),
        None => (None, path),
    }
}

/// Walk `path` on a child record to the object holding the terminal field.
pub fn resolve<'a>(record: &'a ChildRecord, path: &'a str) -> Resolution<(&'a Map<String, Value>, &'a str)> {
    let (parents, field) = split_path(path);
    let mut current = record.fields();
    if let Some(parents) = parents {
        for segment in parents.split('.') {
            current = match current.get(segment) {
                Some(Value::Object(next)) => next,
                _ => return Resolution::Unresolved,
            };
        }
    }
    Resolution::Resolved((current, field))
}

fn resolve_mut<'a>(
    fields: &'a mut Map<String, Value>,
    path: &'a str,
) -> Resolution<(&'a mut Map<String, Value>, &'a str)> {
    let (parents, field) = split_path(path);
    let mut current = fields;
    if let Some(parents) = parents {
        for segment in parents.split('.') {
            current = match current.get_mut(segment) {
                Some(Value::Object(next)) => next,
                _ => return Resolution::Unresolved,
            };
        }
    }
    Resolution::Resolved((current, field))
}

/// Read the value at `path`; a missing terminal field reads as null.
pub fn read_path(record: &ChildRecord, path: &str) -> Resolution<AttributeValue> {
    match resolve(record, path) {
        Resolution::Resolved((object, field)) => {
            Resolution::Resolved(object.get(field).cloned().unwrap_or(Value::Null))
        }
        Resolution::Unresolved => Resolution::Unresolved,
    }
}

/// Copy mapped child fields onto the aggregate.
pub fn populate_aggregate(aggregate: &mut Aggregate, records: &ChildRecords) {
    apply_forward(aggregate, records, |_| true);
}

/// Forward pass restricted to the entries reading from one model key.
pub(crate) fn populate_from_model(aggregate: &mut Aggregate, records: &ChildRecords, model_key: &str) {
    apply_forward(aggregate, records, |entry| entry.model == model_key);
}

fn apply_forward<F>(aggregate: &mut Aggregate, records: &ChildRecords, include: F)
where
    F: Fn(&MappingEntry) -> bool,
{
    let schema = Arc::clone(aggregate.schema());
    for entry in schema.mapping().iter().filter(|e| include(e)) {
        let fallback = || schema.default_for(&entry.attribute).cloned().unwrap_or(Value::Null);

        let Some(record) = records.get(&entry.model) else {
            if schema.model(&entry.model).is_none() {
                warn!(
                    aggregate_type = %schema.name(),
                    attribute = %entry.attribute,
                    model = %entry.model,
                    "mapping references an undeclared model"
                );
            } else {
                debug!(attribute = %entry.attribute, model = %entry.model, "child record absent");
            }
            aggregate.assign(&entry.attribute, fallback());
            continue;
        };

        let (object, field) = match resolve(record, &entry.path) {
            Resolution::Resolved(found) => found,
            Resolution::Unresolved => {
                debug!(attribute = %entry.attribute, path = %entry.path, "mapping path unresolved");
                aggregate.assign(&entry.attribute, fallback());
                continue;
            }
        };

        let mut value = object.get(field).cloned().unwrap_or(Value::Null);
        if let Some(transformer) = entry.transformer() {
            value = transformer.to_clean(value, field, record);
        }
        if value.is_null() {
            value = fallback();
        }
        aggregate.assign(&entry.attribute, value);
    }
}

/// Write aggregate attributes back onto child records.
///
/// Read-only entries are skipped, and a field is only written when its value
/// actually differs, so untouched records stay clean. Returns the number of
/// fields written.
pub fn populate_child_records(aggregate: &Aggregate, records: &mut ChildRecords) -> usize {
    let mut written = 0;
    for entry in aggregate.schema().mapping().iter().filter(|e| !e.read_only) {
        let Some(record) = records.get_mut(&entry.model) else {
            continue;
        };
        let Some(value) = aggregate.attributes().get(&entry.attribute).cloned() else {
            continue;
        };

        let (_, field) = split_path(&entry.path);
        let value = match entry.transformer() {
            Some(transformer) => transformer.to_dirty(value, field, record),
            None => value,
        };

        let changed = match resolve_mut(record.fields_mut(), &entry.path) {
            Resolution::Resolved((object, field)) => {
                let current = object.get(field);
                let unchanged = match current {
                    Some(existing) => *existing == value,
                    None => value.is_null(),
                };
                if !unchanged {
                    object.insert(field.to_string(), value);
                }
                !unchanged
            }
            Resolution::Unresolved => {
                debug!(attribute = %entry.attribute, path = %entry.path, "write path unresolved");
                false
            }
        };

        if changed {
            record.mark_dirty(entry.path.clone());
            written += 1;
        }
    }
    written
}
