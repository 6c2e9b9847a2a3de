//! Relation resolver.
//!
//! Ids behind a relation are computed on demand by the relation's finder and,
//! when the relation declares a cache duration, remembered inside the owner's
//! own cache entry. A BelongsTo relation with a direct attribute skips all of
//! that and reads the id off the owner.

use std::sync::Arc;

use amalgam_core::AggregateId;
use chrono::Duration;
use tracing::debug;

use crate::aggregate::{AggregateRef, RelationCacheEntry, RelationIds};
use crate::engine::{AggregateEngine, UpdateMode};
use crate::error::{EngineError, EngineResult};
use crate::identity_map::UnitOfWork;
use crate::list_proxy::ListProxy;
use crate::schema::{RelationDescriptor, RelationKind};

/// Aggregates behind a relation.
#[derive(Debug)]
pub enum RelationData {
    One(Option<AggregateRef>),
    Many(ListProxy),
}

impl RelationData {
    pub fn into_one(self) -> Option<AggregateRef> {
        match self {
            RelationData::One(aggregate) => aggregate,
            RelationData::Many(_) => None,
        }
    }

    pub fn into_many(self) -> Option<ListProxy> {
        match self {
            RelationData::Many(list) => Some(list),
            RelationData::One(_) => None,
        }
    }
}

impl AggregateEngine {
    /// Ids behind `relation` on `owner`, from the relation cache when valid.
    ///
    /// A recompute on a cached relation stores the new entry on the owner and
    /// rewrites the owner's cache entry without bumping its version.
    pub fn find_ids(
        &self,
        uow: &mut UnitOfWork,
        owner: &AggregateRef,
        relation_name: &str,
    ) -> EngineResult<RelationIds> {
        let schema = Arc::clone(owner.borrow().schema());
        let relation = schema
            .relation(relation_name)
            .ok_or_else(|| EngineError::UnknownRelation {
                aggregate_type: schema.name().to_string(),
                relation: relation_name.to_string(),
            })?;

        if let (RelationKind::BelongsTo, Some(attribute)) = (relation.kind(), relation.attribute()) {
            let owner = owner.borrow();
            return Ok(RelationIds::One(AggregateId::from_value(owner.get(attribute)?)));
        }

        if let Some(entry) = owner.borrow().relation_cache(relation_name) {
            if self.entry_is_valid(relation, entry)? {
                debug!(aggregate_type = %schema.name(), relation = relation_name, "relation cache hit");
                return Ok(entry.ids.clone());
            }
        }

        let finder = relation
            .finder()
            .ok_or_else(|| EngineError::InvalidDeclaration {
                aggregate_type: schema.name().to_string(),
                reason: format!("relation {} has no finder", relation_name),
            })?;
        let found = {
            let owner = owner.borrow();
            let owner_id = owner.id();
            finder(owner_id.as_ref(), &*owner)?
        };
        let ids = if relation.kind().is_many() {
            found.into_many()
        } else {
            found.into_one()
        };
        debug!(aggregate_type = %schema.name(), relation = relation_name, "relation ids recomputed");

        if relation.cache_duration().is_some() {
            let dependency = relation.dependency().map(|d| d.capture()).transpose()?;
            owner.borrow_mut().store_relation_cache(
                relation_name,
                RelationCacheEntry {
                    ids: ids.clone(),
                    captured_at: self.clock().now(),
                    dependency,
                },
            );
            self.update(uow, owner, UpdateMode::METADATA_ONLY)?;
        }

        Ok(ids)
    }

    /// Load what `relation` points at: one aggregate, or a lazy list.
    pub fn relation(
        &self,
        uow: &mut UnitOfWork,
        owner: &AggregateRef,
        relation_name: &str,
    ) -> EngineResult<RelationData> {
        let ids = self.find_ids(uow, owner, relation_name)?;
        let target = {
            let owner = owner.borrow();
            owner
                .schema()
                .relation(relation_name)
                .map(|r| r.target().to_string())
                .unwrap_or_default()
        };

        match ids {
            RelationIds::One(None) => Ok(RelationData::One(None)),
            RelationIds::One(Some(id)) => Ok(RelationData::One(self.load(uow, &target, id)?)),
            RelationIds::Many(ids) => Ok(RelationData::Many(self.load_many(&target, ids)?)),
        }
    }

    /// A stored entry is trusted only while the relation still declares a
    /// cache duration, the duration has not run out, and any dependency is
    /// unchanged since capture.
    fn entry_is_valid(
        &self,
        relation: &RelationDescriptor,
        entry: &RelationCacheEntry,
    ) -> EngineResult<bool> {
        let Some(duration) = relation.cache_duration() else {
            return Ok(false);
        };

        if duration > 0 {
            let expires_at = i64::try_from(duration)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|d| entry.captured_at.checked_add_signed(d));
            if let Some(expires_at) = expires_at {
                if self.clock().now() > expires_at {
                    debug!(relation = %relation.name(), "relation cache expired");
                    return Ok(false);
                }
            }
        }

        if let Some(dependency) = relation.dependency() {
            let Some(captured) = &entry.dependency else {
                return Ok(false);
            };
            if dependency.has_changed(captured)? {
                debug!(relation = %relation.name(), "relation dependency changed");
                return Ok(false);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AggregateSchema, ModelDependency, SchemaRegistry};
    use crate::test_support::harness;
    use amalgam_core::{CacheKey, EngineConfig, ManualClock};
    use amalgam_storage::{
        CacheStore, ChangeJournal, InMemoryCacheStore, InMemoryChangeJournal, InMemoryChildStore,
        JournalDependency,
    };
    use serde_json::json;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_direct_attribute_skips_finder() {
        let h = harness();
        let mut uow = UnitOfWork::new();
        let ada = h.engine.load(&mut uow, "Customer", 1).unwrap().unwrap();

        let ids = h.engine.find_ids(&mut uow, &ada, "manager").unwrap();
        assert_eq!(ids, RelationIds::One(Some(AggregateId::from(2))));
        assert!(ada.borrow().relation_cache("manager").is_none());

        let manager = h
            .engine
            .relation(&mut uow, &ada, "manager")
            .unwrap()
            .into_one()
            .unwrap();
        assert_eq!(manager.borrow().get("name").unwrap(), &json!("Grace"));

        let grace = h.engine.load(&mut uow, "Customer", 2).unwrap().unwrap();
        assert!(Rc::ptr_eq(&grace, &manager));
        assert!(h
            .engine
            .relation(&mut uow, &grace, "manager")
            .unwrap()
            .into_one()
            .is_none());
    }

    #[test]
    fn test_cached_ids_until_duration_runs_out() {
        let h = harness();
        let mut uow = UnitOfWork::new();
        let ada = h.engine.load(&mut uow, "Customer", 1).unwrap().unwrap();

        let first = h.engine.find_ids(&mut uow, &ada, "orders").unwrap();
        assert_eq!(h.finder_calls(), 1);
        assert_eq!(ada.borrow().version(), 1);

        h.set_order_ids(vec![12]);
        h.clock.advance_secs(59);
        assert_eq!(h.engine.find_ids(&mut uow, &ada, "orders").unwrap(), first);
        h.clock.advance_secs(1);
        assert_eq!(h.engine.find_ids(&mut uow, &ada, "orders").unwrap(), first);
        assert_eq!(h.finder_calls(), 1);

        h.clock.advance_secs(1);
        assert_eq!(
            h.engine.find_ids(&mut uow, &ada, "orders").unwrap(),
            RelationIds::Many(vec![AggregateId::from(12)])
        );
        assert_eq!(h.finder_calls(), 2);
    }

    #[test]
    fn test_cached_ids_ride_the_owner_cache_entry() {
        let h = harness();
        {
            let mut uow = UnitOfWork::new();
            let ada = h.engine.load(&mut uow, "Customer", 1).unwrap().unwrap();
            h.engine.find_ids(&mut uow, &ada, "orders").unwrap();
        }

        let mut uow = UnitOfWork::new();
        let ada = h.engine.load(&mut uow, "Customer", 1).unwrap().unwrap();
        assert!(ada.borrow().relation_cache("orders").is_some());
        assert_eq!(ada.borrow().version(), 1);
        h.engine.find_ids(&mut uow, &ada, "orders").unwrap();
        assert_eq!(h.finder_calls(), 1);

        let key = CacheKey::aggregate("Customer", AggregateId::from(1));
        assert!(h.cache.get(&key).unwrap().is_some());
        assert!(h.children.persist_log().is_empty());
    }

    #[test]
    fn test_uncached_relation_always_recomputes() {
        let h = harness();
        let mut uow = UnitOfWork::new();
        let ada = h.engine.load(&mut uow, "Customer", 1).unwrap().unwrap();

        let latest = h.engine.find_ids(&mut uow, &ada, "latestOrder").unwrap();
        assert_eq!(latest, RelationIds::One(Some(AggregateId::from(10))));
        assert!(ada.borrow().relation_cache("latestOrder").is_none());
    }

    #[test]
    fn test_has_many_yields_lazy_list() {
        let h = harness();
        let mut uow = UnitOfWork::new();
        let ada = h.engine.load(&mut uow, "Customer", 1).unwrap().unwrap();

        let orders = h
            .engine
            .relation(&mut uow, &ada, "orders")
            .unwrap()
            .into_many()
            .unwrap();
        assert_eq!(orders.count(), 4);
        assert_eq!(orders.load_all(&h.engine, &mut uow).unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_relation() {
        let h = harness();
        let mut uow = UnitOfWork::new();
        let ada = h.engine.load(&mut uow, "Customer", 1).unwrap().unwrap();
        assert!(matches!(
            h.engine.find_ids(&mut uow, &ada, "invoices"),
            Err(EngineError::UnknownRelation { .. })
        ));
    }

    #[test]
    fn test_dependency_change_invalidates() {
        let journal = Arc::new(InMemoryChangeJournal::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut registry = SchemaRegistry::new();
        registry
            .register(
                AggregateSchema::builder("Customer")
                    .model(ModelDependency::primary("Customer", "Customer", "cust_id").required())
                    .map_field("id", "Customer", "cust_id")
                    .relation(
                        RelationDescriptor::has_many("orders", "Customer")
                            .with_finder(move |_, _| {
                                counter.fetch_add(1, Ordering::SeqCst);
                                Ok(RelationIds::Many(vec![]))
                            })
                            .cache_for(0)
                            .depends_on(Arc::new(JournalDependency::new(
                                journal.clone(),
                                "orders:1",
                            ))),
                    )
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let clock = Arc::new(ManualClock::starting_now());
        let children = Arc::new(InMemoryChildStore::new().with_model("Customer", "cust_id"));
        children.insert("Customer", json!({"cust_id": 1})).unwrap();
        let engine = AggregateEngine::new(
            registry,
            Arc::new(InMemoryCacheStore::new()),
            children,
            EngineConfig::default(),
        )
        .unwrap()
        .with_clock(clock.clone());

        let mut uow = UnitOfWork::new();
        let owner = engine.load(&mut uow, "Customer", 1).unwrap().unwrap();
        engine.find_ids(&mut uow, &owner, "orders").unwrap();

        // Zero duration never time-expires.
        clock.advance_secs(86_400 * 365);
        engine.find_ids(&mut uow, &owner, "orders").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        journal.record_change("orders:1").unwrap();
        engine.find_ids(&mut uow, &owner, "orders").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        engine.find_ids(&mut uow, &owner, "orders").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
