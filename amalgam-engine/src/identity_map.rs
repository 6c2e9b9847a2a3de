//! Per-unit-of-work identity map.
//!
//! Within one unit of work every `(type, id)` pair maps to at most one live
//! aggregate, so two loads of the same id hand back the same instance. There
//! is no eviction: the map lives exactly as long as the unit of work.

use std::collections::HashMap;
use std::rc::Rc;

use amalgam_core::AggregateId;

use crate::aggregate::AggregateRef;

#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<(String, AggregateId), AggregateRef>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, aggregate_type: &str, id: &AggregateId) -> Option<AggregateRef> {
        self.entries
            .get(&(aggregate_type.to_string(), id.clone()))
            .map(Rc::clone)
    }

    /// Register an instance, replacing whatever was there.
    pub fn put(&mut self, aggregate_type: &str, id: AggregateId, instance: AggregateRef) {
        self.entries.insert((aggregate_type.to_string(), id), instance);
    }

    pub fn remove(&mut self, aggregate_type: &str, id: &AggregateId) -> Option<AggregateRef> {
        self.entries.remove(&(aggregate_type.to_string(), id.clone()))
    }

    pub fn contains(&self, aggregate_type: &str, id: &AggregateId) -> bool {
        self.entries
            .contains_key(&(aggregate_type.to_string(), id.clone()))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Context owned by one caller's unit of work (e.g. one request).
///
/// Every engine operation takes it explicitly. It is not `Send`; create one
/// per request rather than sharing.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    identity_map: IdentityMap,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub fn identity_map_mut(&mut self) -> &mut IdentityMap {
        &mut self.identity_map
    }

    /// Forget every loaded aggregate.
    pub fn clear(&mut self) {
        self.identity_map.clear();
    }
}
