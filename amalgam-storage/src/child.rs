//! Child model store trait and in-memory implementation.
//!
//! Child records are owned by an external store. The engine only ever looks
//! records up by a single field and writes them back one at a time; query
//! construction and transactions stay on the store's side of the seam.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use amalgam_core::{ChildRecord, CoreResult, StorageError};
use serde_json::{Map, Value};
use tracing::debug;

/// Store-side hook applied to fields before every write.
pub type Normalizer = Arc<dyn Fn(&mut Map<String, Value>) + Send + Sync>;

/// Storage trait for child records.
pub trait ChildModelStore: Send + Sync {
    /// Find the first record of `model` whose `field` equals `value`.
    fn find_by_field(&self, model: &str, field: &str, value: &Value)
        -> CoreResult<Option<ChildRecord>>;

    /// Insert or update a record.
    ///
    /// On success the store may have rewritten fields (assigned keys,
    /// normalized values) and the record is marked persisted.
    fn persist(&self, record: &mut ChildRecord) -> CoreResult<()>;
}

struct ModelTable {
    primary_key: String,
    rows: Vec<Map<String, Value>>,
    next_id: i64,
    normalizer: Option<Normalizer>,
    failure: Option<String>,
}

impl ModelTable {
    fn new(primary_key: String) -> Self {
        Self {
            primary_key,
            rows: Vec::new(),
            next_id: 1,
            normalizer: None,
            failure: None,
        }
    }

    fn position_of(&self, pk: &Value) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.get(&self.primary_key) == Some(pk))
    }

    fn observe_key(&mut self, pk: &Value) {
        if let Some(n) = pk.as_i64() {
            self.next_id = self.next_id.max(n + 1);
        }
    }
}

/// In-memory child store for tests and embedded use.
///
/// Models must be registered with their primary-key field before use. Integer
/// primary keys are auto-assigned to new records that arrive without one.
/// Updating a stored row with a dirty record writes only the dirty top-level
/// fields and hands the merged row back; a clean record replaces the row.
pub struct InMemoryChildStore {
    tables: RwLock<HashMap<String, ModelTable>>,
    persist_log: RwLock<Vec<String>>,
}

impl InMemoryChildStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            persist_log: RwLock::new(Vec::new()),
        }
    }

    /// Builder-style model registration.
    pub fn with_model(self, model: impl Into<String>, primary_key: impl Into<String>) -> Self {
        self.register_model(model, primary_key);
        self
    }

    /// Register a model and its primary-key field. Re-registering is a no-op.
    pub fn register_model(&self, model: impl Into<String>, primary_key: impl Into<String>) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables
            .entry(model.into())
            .or_insert_with(|| ModelTable::new(primary_key.into()));
    }

    /// Seed a row directly, bypassing normalizers and failure injection.
    pub fn insert(&self, model: &str, row: Value) -> CoreResult<()> {
        let Value::Object(row) = row else {
            return Err(StorageError::PersistFailed {
                model: model.to_string(),
                reason: "row must be an object".to_string(),
            }
            .into());
        };
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let table = tables.get_mut(model).ok_or_else(|| StorageError::UnknownModel {
            model: model.to_string(),
        })?;
        if let Some(pk) = row.get(&table.primary_key).cloned() {
            table.observe_key(&pk);
        }
        table.rows.push(row);
        Ok(())
    }

    /// Install a hook that rewrites fields on every persist of `model`.
    pub fn set_normalizer(&self, model: &str, normalizer: Normalizer) -> CoreResult<()> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let table = tables.get_mut(model).ok_or_else(|| StorageError::UnknownModel {
            model: model.to_string(),
        })?;
        table.normalizer = Some(normalizer);
        Ok(())
    }

    /// Make every persist of `model` fail with `reason` until cleared.
    pub fn fail_persists(&self, model: &str, reason: impl Into<String>) -> CoreResult<()> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let table = tables.get_mut(model).ok_or_else(|| StorageError::UnknownModel {
            model: model.to_string(),
        })?;
        table.failure = Some(reason.into());
        Ok(())
    }

    pub fn clear_failure(&self, model: &str) -> CoreResult<()> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(table) = tables.get_mut(model) {
            table.failure = None;
        }
        Ok(())
    }

    /// Number of rows stored for `model`.
    pub fn row_count(&self, model: &str) -> usize {
        self.tables
            .read()
            .map(|tables| tables.get(model).map_or(0, |t| t.rows.len()))
            .unwrap_or(0)
    }

    /// Models in the order they were successfully persisted.
    pub fn persist_log(&self) -> Vec<String> {
        self.persist_log
            .read()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemoryChildStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Top-level fields touched by the record's dirty paths.
fn dirty_columns(record: &ChildRecord) -> BTreeSet<String> {
    record
        .dirty_fields()
        .map(|path| path.split_once('.').map_or(path, |(head, _)| head).to_string())
        .collect()
}

impl ChildModelStore for InMemoryChildStore {
    fn find_by_field(
        &self,
        model: &str,
        field: &str,
        value: &Value,
    ) -> CoreResult<Option<ChildRecord>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let table = tables.get(model).ok_or_else(|| StorageError::UnknownModel {
            model: model.to_string(),
        })?;
        Ok(table
            .rows
            .iter()
            .find(|row| row.get(field) == Some(value))
            .map(|row| ChildRecord::existing(model, row.clone())))
    }

    fn persist(&self, record: &mut ChildRecord) -> CoreResult<()> {
        let model = record.model().to_string();
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let table = tables
            .get_mut(&model)
            .ok_or_else(|| StorageError::UnknownModel {
                model: model.clone(),
            })?;

        if let Some(reason) = &table.failure {
            return Err(StorageError::PersistFailed {
                model,
                reason: reason.clone(),
            }
            .into());
        }

        if let Some(normalize) = &table.normalizer {
            normalize(record.fields_mut());
        }

        let pk_field = table.primary_key.clone();
        let pk = record.get(&pk_field).filter(|v| !v.is_null()).cloned();

        if record.is_new() {
            let pk = match pk {
                Some(pk) => {
                    if table.position_of(&pk).is_some() {
                        return Err(StorageError::PersistFailed {
                            model,
                            reason: format!("duplicate primary key {}", pk),
                        }
                        .into());
                    }
                    pk
                }
                None => {
                    let assigned = Value::from(table.next_id);
                    record.fields_mut().insert(pk_field.clone(), assigned.clone());
                    assigned
                }
            };
            table.observe_key(&pk);
            table.rows.push(record.fields().clone());
            debug!(model = %model, pk = %pk, "inserted child record");
        } else {
            let pk = pk.ok_or_else(|| StorageError::PersistFailed {
                model: model.clone(),
                reason: format!("missing primary key {}", pk_field),
            })?;
            match table.position_of(&pk) {
                Some(idx) if record.is_dirty() => {
                    let row = &mut table.rows[idx];
                    for column in dirty_columns(record) {
                        match record.fields().get(&column) {
                            Some(value) => row.insert(column, value.clone()),
                            None => row.remove(&column),
                        };
                    }
                    *record.fields_mut() = row.clone();
                }
                Some(idx) => table.rows[idx] = record.fields().clone(),
                None => {
                    table.observe_key(&pk);
                    table.rows.push(record.fields().clone());
                }
            }
            debug!(model = %model, pk = %pk, "updated child record");
        }

        record.mark_persisted();
        drop(tables);
        self.persist_log
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .push(model);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
