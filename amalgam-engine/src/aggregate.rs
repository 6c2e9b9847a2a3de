//! The in-memory aggregate record.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use amalgam_core::{AggregateId, AttributeValue, Timestamp};
use amalgam_storage::Watermark;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::schema::{AggregateSchema, ID_ATTRIBUTE, VERSION_ATTRIBUTE};

/// Shared handle to a live aggregate.
///
/// Handles are scoped to one unit of work and are deliberately `!Send`: the
/// identity map that hands them out must never be shared across concurrent
/// units of work.
pub type AggregateRef = Rc<RefCell<Aggregate>>;

/// Ids found behind a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ids", rename_all = "snake_case")]
pub enum RelationIds {
    One(Option<AggregateId>),
    Many(Vec<AggregateId>),
}

impl RelationIds {
    /// Reshape to a list, for HasMany relations.
    pub fn into_many(self) -> Self {
        match self {
            RelationIds::One(id) => RelationIds::Many(id.into_iter().collect()),
            many => many,
        }
    }

    /// Reshape to a single id, keeping the first one of a list.
    pub fn into_one(self) -> Self {
        match self {
            RelationIds::Many(ids) => RelationIds::One(ids.into_iter().next()),
            one => one,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            RelationIds::One(id) => id.is_none(),
            RelationIds::Many(ids) => ids.is_empty(),
        }
    }
}

impl From<AggregateId> for RelationIds {
    fn from(id: AggregateId) -> Self {
        RelationIds::One(Some(id))
    }
}

impl From<Option<AggregateId>> for RelationIds {
    fn from(id: Option<AggregateId>) -> Self {
        RelationIds::One(id)
    }
}

impl From<Vec<AggregateId>> for RelationIds {
    fn from(ids: Vec<AggregateId>) -> Self {
        RelationIds::Many(ids)
    }
}

/// Relation ids remembered inside the owner's own cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationCacheEntry {
    pub ids: RelationIds,
    pub captured_at: Timestamp,
    /// Dependency state at capture time, when the relation declares one.
    pub dependency: Option<Watermark>,
}

/// A logical entity assembled from one or more child records.
#[derive(Debug, Clone)]
pub struct Aggregate {
    schema: Arc<AggregateSchema>,
    attributes: BTreeMap<String, AttributeValue>,
    is_new: bool,
    relation_cache: BTreeMap<String, RelationCacheEntry>,
}

impl Aggregate {
    /// Empty aggregate with declared defaults applied.
    pub(crate) fn blank(schema: Arc<AggregateSchema>, initial_version: i64) -> Self {
        let attributes = schema
            .attribute_names()
            .map(|name| {
                let value = schema.default_for(name).cloned().unwrap_or(Value::Null);
                (name.to_string(), value)
            })
            .collect();
        let mut aggregate = Self {
            schema,
            attributes,
            is_new: true,
            relation_cache: BTreeMap::new(),
        };
        aggregate.set_version(initial_version);
        aggregate
    }

    pub(crate) fn into_ref(self) -> AggregateRef {
        Rc::new(RefCell::new(self))
    }

    pub fn schema(&self) -> &Arc<AggregateSchema> {
        &self.schema
    }

    pub fn type_name(&self) -> &str {
        self.schema.name()
    }

    /// The aggregate id, once known.
    pub fn id(&self) -> Option<AggregateId> {
        self.attributes.get(ID_ATTRIBUTE).and_then(AggregateId::from_value)
    }

    pub fn version(&self) -> i64 {
        self.attributes
            .get(VERSION_ATTRIBUTE)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Read a declared attribute.
    pub fn get(&self, name: &str) -> EngineResult<&AttributeValue> {
        self.attributes
            .get(name)
            .ok_or_else(|| EngineError::UnknownAttribute {
                aggregate_type: self.type_name().to_string(),
                attribute: name.to_string(),
            })
    }

    /// Write a declared attribute. `version` belongs to the engine.
    pub fn set(&mut self, name: &str, value: impl Into<AttributeValue>) -> EngineResult<()> {
        if name == VERSION_ATTRIBUTE {
            return Err(EngineError::ReadOnlyAttribute {
                aggregate_type: self.type_name().to_string(),
                attribute: name.to_string(),
            });
        }
        match self.attributes.get_mut(name) {
            Some(slot) => {
                *slot = value.into();
                Ok(())
            }
            None => Err(EngineError::UnknownAttribute {
                aggregate_type: self.type_name().to_string(),
                attribute: name.to_string(),
            }),
        }
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    /// Cached ids for a relation, valid or not.
    pub fn relation_cache(&self, relation: &str) -> Option<&RelationCacheEntry> {
        self.relation_cache.get(relation)
    }

    pub(crate) fn relation_cache_entries(&self) -> &BTreeMap<String, RelationCacheEntry> {
        &self.relation_cache
    }

    pub(crate) fn store_relation_cache(&mut self, relation: &str, entry: RelationCacheEntry) {
        self.relation_cache.insert(relation.to_string(), entry);
    }

    /// Assignment that skips the declared-name and engine-owned checks.
    /// Only the mapper and the engine write through here.
    pub(crate) fn assign(&mut self, name: &str, value: AttributeValue) {
        if let Some(slot) = self.attributes.get_mut(name) {
            *slot = value;
        }
    }

    pub(crate) fn set_version(&mut self, version: i64) {
        self.attributes
            .insert(VERSION_ATTRIBUTE.to_string(), Value::from(version));
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.is_new = false;
    }

    /// Restore cached state onto a freshly reconstructed aggregate.
    ///
    /// Attributes that are no longer declared are dropped and relation entries
    /// are kept only for relations the schema still declares.
    pub(crate) fn restore(
        &mut self,
        attributes: BTreeMap<String, AttributeValue>,
        relation_cache: BTreeMap<String, RelationCacheEntry>,
    ) {
        for (name, value) in attributes {
            self.assign(&name, value);
        }
        for (name, entry) in relation_cache {
            if self.schema.relation(&name).is_some() {
                self.relation_cache.insert(name, entry);
            }
        }
    }
}
