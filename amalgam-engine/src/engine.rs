//! Load and save pipeline.
//!
//! Load: identity map, then cache, then assembly from child records, with the
//! result written through to cache and identity map. Save: validate, write
//! aggregate attributes back onto child records, persist each child in
//! declared order, bump the version, and write the snapshot to the cache last.

use std::rc::Rc;
use std::sync::Arc;

use amalgam_core::{AggregateId, CacheKey, Clock, CoreError, EngineConfig, SystemClock};
use amalgam_storage::{CacheStore, ChildModelStore};
use tracing::{debug, warn};

use crate::aggregate::{Aggregate, AggregateRef};
use crate::error::{EngineError, EngineResult};
use crate::identity_map::UnitOfWork;
use crate::list_proxy::{ListItem, ListProxy};
use crate::mapper::{self, ChildRecords};
use crate::schema::{AggregateSchema, SchemaRegistry, ID_ATTRIBUTE};
use crate::snapshot::AggregateSnapshot;

/// Knobs for a single load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Neither read from nor register in the identity map.
    pub skip_identity_map: bool,
    /// Ignore identity map and cached attributes; reassemble from children.
    pub force_refresh: bool,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bypass_identity_map(mut self) -> Self {
        self.skip_identity_map = true;
        self
    }

    pub fn refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }
}

/// What an update does besides rewriting the cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateMode {
    pub increment_version: bool,
    pub persist_to_store: bool,
}

impl UpdateMode {
    /// Full save: bump the version and write the child records.
    pub const SAVE: UpdateMode = UpdateMode {
        increment_version: true,
        persist_to_store: true,
    };

    /// Cache-only refresh of metadata such as relation ids.
    pub const METADATA_ONLY: UpdateMode = UpdateMode {
        increment_version: false,
        persist_to_store: false,
    };
}

/// The aggregate engine.
///
/// Holds the shared collaborators; all per-request state lives in the
/// [`UnitOfWork`] passed to each call.
pub struct AggregateEngine {
    registry: SchemaRegistry,
    cache: Arc<dyn CacheStore>,
    children: Arc<dyn ChildModelStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl AggregateEngine {
    pub fn new(
        registry: SchemaRegistry,
        cache: Arc<dyn CacheStore>,
        children: Arc<dyn ChildModelStore>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate().map_err(CoreError::from)?;
        Ok(Self {
            registry,
            cache,
            children,
            clock: Arc::new(SystemClock),
            config,
        })
    }

    /// Replace the time source used for relation cache checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn schema(&self, aggregate_type: &str) -> EngineResult<Arc<AggregateSchema>> {
        self.registry.get(aggregate_type)
    }

    /// Deterministic cache key: `<prefix>:<type>:<id>`.
    pub fn cache_key(&self, aggregate_type: &str, id: &AggregateId) -> CacheKey {
        CacheKey::new(self.config.key_prefix.as_str(), aggregate_type, id.clone())
    }

    fn ttl_for(&self, schema: &AggregateSchema) -> u64 {
        schema.cache_ttl().unwrap_or(self.config.default_cache_ttl)
    }

    /// New, unsaved aggregate with defaults applied.
    pub fn assemble(&self, aggregate_type: &str) -> EngineResult<AggregateRef> {
        let schema = self.schema(aggregate_type)?;
        Ok(Aggregate::blank(schema, self.config.initial_version).into_ref())
    }

    /// Load one aggregate. `Ok(None)` means a required child is missing.
    pub fn load(
        &self,
        uow: &mut UnitOfWork,
        aggregate_type: &str,
        id: impl Into<AggregateId>,
    ) -> EngineResult<Option<AggregateRef>> {
        self.load_with(uow, aggregate_type, id, LoadOptions::default())
    }

    pub fn load_with(
        &self,
        uow: &mut UnitOfWork,
        aggregate_type: &str,
        id: impl Into<AggregateId>,
        options: LoadOptions,
    ) -> EngineResult<Option<AggregateRef>> {
        let id = id.into();
        let schema = self.schema(aggregate_type)?;
        let use_identity_map = !options.skip_identity_map;

        if use_identity_map && !options.force_refresh {
            if let Some(existing) = uow.identity_map().get(aggregate_type, &id) {
                debug!(aggregate_type, id = %id, "identity map hit");
                return Ok(Some(existing));
            }
        }

        let key = self.cache_key(aggregate_type, &id);
        let cached = self.read_snapshot(&key)?;

        let aggregate = match cached {
            Some(snapshot) if !options.force_refresh => {
                debug!(key = %key, "aggregate cache hit");
                snapshot.into_aggregate(Arc::clone(&schema), self.config.initial_version)
            }
            cached => {
                let Some(records) = self.resolve_children(&schema, &id)? else {
                    return Ok(None);
                };
                let mut aggregate =
                    Aggregate::blank(Arc::clone(&schema), self.config.initial_version);
                mapper::populate_aggregate(&mut aggregate, &records);
                if aggregate.id().is_none() {
                    aggregate.assign(ID_ATTRIBUTE, id.to_value());
                }
                // A forced refresh must not move the version backwards.
                if let Some(previous) = cached {
                    if previous.version > aggregate.version() {
                        aggregate.set_version(previous.version);
                    }
                }
                aggregate.mark_persisted();

                let bytes = AggregateSnapshot::capture(&aggregate).encode()?;
                self.cache.set(&key, bytes, self.ttl_for(&schema))?;
                debug!(key = %key, "aggregate assembled from child records");
                aggregate
            }
        };

        if !use_identity_map {
            return Ok(Some(aggregate.into_ref()));
        }

        // Refresh an instance already handed out instead of forking a second one.
        if let Some(existing) = uow.identity_map().get(aggregate_type, &id) {
            let writable = existing.try_borrow_mut().is_ok();
            if writable {
                *existing.borrow_mut() = aggregate;
                return Ok(Some(existing));
            }
            warn!(aggregate_type, id = %id, "live instance is borrowed; replacing it");
        }

        let handle = aggregate.into_ref();
        uow.identity_map_mut()
            .put(aggregate_type, id, Rc::clone(&handle));
        Ok(Some(handle))
    }

    /// Lazy list over `items`; nothing is loaded until an element is accessed.
    pub fn load_many<I, T>(&self, aggregate_type: &str, items: I) -> EngineResult<ListProxy>
    where
        I: IntoIterator<Item = T>,
        T: Into<ListItem>,
    {
        self.schema(aggregate_type)?;
        ListProxy::new(aggregate_type, items)
    }

    /// Validate, then persist with a version bump.
    pub fn save(&self, uow: &mut UnitOfWork, aggregate: &AggregateRef) -> EngineResult<()> {
        self.save_with(uow, aggregate, true)
    }

    pub fn save_with(
        &self,
        uow: &mut UnitOfWork,
        aggregate: &AggregateRef,
        run_validation: bool,
    ) -> EngineResult<()> {
        if run_validation {
            let current = aggregate.borrow();
            if let Some(validate) = current.schema().validator() {
                if let Err(issues) = validate(&*current) {
                    debug!(aggregate_type = %current.type_name(), count = issues.len(), "validation failed");
                    return Err(EngineError::ValidationFailed {
                        aggregate_type: current.type_name().to_string(),
                        issues,
                    });
                }
            }
        }
        self.update(uow, aggregate, UpdateMode::SAVE)
    }

    /// Rewrite the aggregate's cache entry, optionally bumping the version
    /// and writing the child records first.
    ///
    /// The version bump is unconditional when requested; skipping saves with
    /// nothing dirty is the caller's business. If a child write fails, earlier
    /// child writes stay applied, the in-memory version is restored and the
    /// cache is left untouched.
    pub fn update(
        &self,
        uow: &mut UnitOfWork,
        aggregate: &AggregateRef,
        mode: UpdateMode,
    ) -> EngineResult<()> {
        let previous_version = aggregate.borrow().version();
        if mode.increment_version {
            aggregate.borrow_mut().set_version(previous_version + 1);
        }

        if mode.persist_to_store {
            if let Err(err) = self.persist_children(aggregate) {
                aggregate.borrow_mut().set_version(previous_version);
                return Err(err);
            }
        }

        self.write_through(uow, aggregate)
    }

    /// Drop an aggregate from the cache and the identity map.
    pub fn evict(
        &self,
        uow: &mut UnitOfWork,
        aggregate_type: &str,
        id: impl Into<AggregateId>,
    ) -> EngineResult<bool> {
        let id = id.into();
        self.schema(aggregate_type)?;
        let removed = self.cache.delete(&self.cache_key(aggregate_type, &id))?;
        uow.identity_map_mut().remove(aggregate_type, &id);
        Ok(removed)
    }

    fn read_snapshot(&self, key: &CacheKey) -> EngineResult<Option<AggregateSnapshot>> {
        let Some(bytes) = self.cache.get(key)? else {
            debug!(key = %key, "aggregate cache miss");
            return Ok(None);
        };
        match AggregateSnapshot::decode(key, &bytes) {
            Ok(snapshot) if snapshot.aggregate_type == key.aggregate_type() => Ok(Some(snapshot)),
            Ok(snapshot) => {
                warn!(key = %key, found = %snapshot.aggregate_type, "cache entry holds another type");
                Ok(None)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "undecodable cache entry treated as miss");
                Ok(None)
            }
        }
    }

    fn write_through(&self, uow: &mut UnitOfWork, handle: &AggregateRef) -> EngineResult<()> {
        let aggregate = handle.borrow();
        let Some(id) = aggregate.id() else {
            debug!(aggregate_type = %aggregate.type_name(), "no id yet; cache write skipped");
            return Ok(());
        };
        let key = self.cache_key(aggregate.type_name(), &id);
        let bytes = AggregateSnapshot::capture(&aggregate).encode()?;
        self.cache.set(&key, bytes, self.ttl_for(aggregate.schema()))?;

        let aggregate_type = aggregate.type_name().to_string();
        drop(aggregate);
        uow.identity_map_mut()
            .put(&aggregate_type, id, Rc::clone(handle));
        Ok(())
    }

    /// Look up every declared child. `None` if a required one is missing.
    fn resolve_children(
        &self,
        schema: &AggregateSchema,
        id: &AggregateId,
    ) -> EngineResult<Option<ChildRecords>> {
        let id_value = id.to_value();
        let mut records = ChildRecords::new();
        for dependency in schema.models() {
            let found = self.children.find_by_field(
                &dependency.model,
                dependency.lookup.field(),
                &id_value,
            )?;
            match found {
                Some(record) => records.insert(dependency.key.clone(), record),
                None if dependency.required => {
                    debug!(
                        aggregate_type = %schema.name(),
                        id = %id,
                        model = %dependency.model,
                        "required child record missing"
                    );
                    return Ok(None);
                }
                None => {
                    debug!(model = %dependency.model, id = %id, "optional child record missing");
                }
            }
        }
        Ok(Some(records))
    }

    /// Child records a save writes to. Whenever the id is known each child is
    /// looked up by it, so a creation that failed after its first child landed
    /// updates that child on retry. Fresh records fill in whatever is not
    /// stored. Fails before any write if a child cannot be produced.
    fn children_for_save(
        &self,
        schema: &AggregateSchema,
        aggregate: &Aggregate,
    ) -> EngineResult<ChildRecords> {
        let id = aggregate.id();
        let mut records = ChildRecords::new();
        for dependency in schema.models() {
            let stored = match &id {
                Some(id) => self.children.find_by_field(
                    &dependency.model,
                    dependency.lookup.field(),
                    &id.to_value(),
                )?,
                None => None,
            };
            let Some(record) = stored.or_else(|| schema.assemble_child(dependency)) else {
                warn!(model = %dependency.model, "no child record available for save");
                return Err(EngineError::PersistFailed {
                    aggregate_type: schema.name().to_string(),
                    model: dependency.model.clone(),
                    reason: "child record could not be resolved".to_string(),
                });
            };
            records.insert(dependency.key.clone(), record);
        }
        Ok(records)
    }

    fn persist_children(&self, handle: &AggregateRef) -> EngineResult<()> {
        let schema = Arc::clone(handle.borrow().schema());
        let mut records = {
            let aggregate = handle.borrow();
            let mut records = self.children_for_save(&schema, &aggregate)?;
            let written = mapper::populate_child_records(&aggregate, &mut records);
            debug!(aggregate_type = %schema.name(), fields = written, "attributes written to children");
            records
        };

        for dependency in schema.models() {
            let id = handle.borrow().id();
            let Some(record) = records.get_mut(&dependency.key) else {
                continue;
            };

            if let (Some(id), Some(field)) = (&id, dependency.lookup.stamped_field()) {
                let value = id.to_value();
                if record.get(field) != Some(&value) {
                    record.set(field, value);
                }
            }

            self.children.persist(record).map_err(|err| {
                warn!(
                    aggregate_type = %schema.name(),
                    model = %dependency.model,
                    error = %err,
                    "child persist failed"
                );
                EngineError::PersistFailed {
                    aggregate_type: schema.name().to_string(),
                    model: dependency.model.clone(),
                    reason: err.to_string(),
                }
            })?;

            // Pick up a store-assigned id so later children can be stamped.
            if id.is_none() {
                mapper::populate_from_model(&mut handle.borrow_mut(), &records, &dependency.key);
            }
        }

        let mut aggregate = handle.borrow_mut();
        mapper::populate_aggregate(&mut aggregate, &records);
        aggregate.mark_persisted();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AggregateSchema, ModelDependency};
    use amalgam_core::ChildRecord;
    use amalgam_storage::{InMemoryCacheStore, InMemoryChildStore};
    use serde_json::json;

    struct Fixture {
        engine: AggregateEngine,
        cache: Arc<InMemoryCacheStore>,
        children: Arc<InMemoryChildStore>,
    }

    fn make_fixture() -> Fixture {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                AggregateSchema::builder("User")
                    .model(ModelDependency::primary("Member", "Member", "mem_id").required())
                    .model(ModelDependency::foreign("Address", "Address", "mem_id"))
                    .map_field("id", "Member", "mem_id")
                    .map_field("firstName", "Member", "fname")
                    .map_field("addressLine1", "Address", "line1")
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let cache = Arc::new(InMemoryCacheStore::new());
        let children = Arc::new(
            InMemoryChildStore::new()
                .with_model("Member", "mem_id")
                .with_model("Address", "addr_id"),
        );
        children
            .insert("Member", json!({"mem_id": 1, "fname": "Test"}))
            .unwrap();
        children
            .insert("Address", json!({"addr_id": 5, "mem_id": 1, "line1": "123 Fake Street"}))
            .unwrap();

        let engine = AggregateEngine::new(
            registry,
            cache.clone(),
            children.clone(),
            EngineConfig::default(),
        )
        .unwrap();
        Fixture {
            engine,
            cache,
            children,
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = AggregateEngine::new(
            SchemaRegistry::new(),
            Arc::new(InMemoryCacheStore::new()),
            Arc::new(InMemoryChildStore::new()),
            EngineConfig::new().with_initial_version(0),
        );
        assert!(matches!(result, Err(EngineError::Core(CoreError::Config(_)))));
    }

    #[test]
    fn test_load_assembles_and_caches() {
        let fx = make_fixture();
        let mut uow = UnitOfWork::new();

        let user = fx.engine.load(&mut uow, "User", 1).unwrap().unwrap();
        {
            let user = user.borrow();
            assert_eq!(user.get("firstName").unwrap(), &json!("Test"));
            assert_eq!(user.get("addressLine1").unwrap(), &json!("123 Fake Street"));
            assert_eq!(user.version(), 1);
            assert!(!user.is_new());
        }
        assert!(fx
            .cache
            .contains(&CacheKey::aggregate("User", AggregateId::from(1))));
    }

    #[test]
    fn test_load_unknown_type() {
        let fx = make_fixture();
        let mut uow = UnitOfWork::new();
        assert!(matches!(
            fx.engine.load(&mut uow, "Order", 1),
            Err(EngineError::UnknownType { .. })
        ));
    }

    #[test]
    fn test_required_child_missing_is_none() {
        let fx = make_fixture();
        let mut uow = UnitOfWork::new();
        assert!(fx.engine.load(&mut uow, "User", 99).unwrap().is_none());
        assert!(uow.identity_map().is_empty());
    }

    #[test]
    fn test_cache_hit_does_not_touch_children() {
        let fx = make_fixture();
        fx.engine.load(&mut UnitOfWork::new(), "User", 1).unwrap();

        // Change the child row behind the cache's back.
        let mut member = ChildRecord::from_json("Member", json!({"mem_id": 1, "fname": "Changed"}));
        fx.children.persist(&mut member).unwrap();
        let mut uow = UnitOfWork::new();
        let user = fx.engine.load(&mut uow, "User", 1).unwrap().unwrap();
        assert_eq!(user.borrow().get("firstName").unwrap(), &json!("Test"));
        assert_eq!(fx.cache.stats().unwrap().hits, 1);
    }

    #[test]
    fn test_corrupt_cache_entry_is_a_miss() {
        let fx = make_fixture();
        let key = CacheKey::aggregate("User", AggregateId::from(1));
        fx.cache.set(&key, b"{broken".to_vec(), 0).unwrap();

        let mut uow = UnitOfWork::new();
        let user = fx.engine.load(&mut uow, "User", 1).unwrap().unwrap();
        assert_eq!(user.borrow().get("firstName").unwrap(), &json!("Test"));
    }

    #[test]
    fn test_refresh_updates_live_instance_in_place() {
        let fx = make_fixture();
        let mut uow = UnitOfWork::new();
        let live = fx.engine.load(&mut uow, "User", 1).unwrap().unwrap();

        let mut member = ChildRecord::from_json("Member", json!({"mem_id": 1, "fname": "Moved"}));
        fx.children.persist(&mut member).unwrap();
        let fresh = fx
            .engine
            .load_with(&mut uow, "User", 1, LoadOptions::new().refresh())
            .unwrap()
            .unwrap();
        assert!(Rc::ptr_eq(&live, &fresh));
        assert_eq!(live.borrow().get("firstName").unwrap(), &json!("Moved"));
    }

    #[test]
    fn test_refresh_replaces_borrowed_instance() {
        let fx = make_fixture();
        let mut uow = UnitOfWork::new();
        let live = fx.engine.load(&mut uow, "User", 1).unwrap().unwrap();

        let guard = live.borrow();
        let fresh = fx
            .engine
            .load_with(&mut uow, "User", 1, LoadOptions::new().refresh())
            .unwrap()
            .unwrap();
        drop(guard);

        assert!(!Rc::ptr_eq(&live, &fresh));
        let mapped = uow.identity_map().get("User", &AggregateId::from(1)).unwrap();
        assert!(Rc::ptr_eq(&mapped, &fresh));
    }

    #[test]
    fn test_update_metadata_only_keeps_version_and_store() {
        let fx = make_fixture();
        let mut uow = UnitOfWork::new();
        let user = fx.engine.load(&mut uow, "User", 1).unwrap().unwrap();

        fx.engine
            .update(&mut uow, &user, UpdateMode::METADATA_ONLY)
            .unwrap();
        assert_eq!(user.borrow().version(), 1);
        assert!(fx.children.persist_log().is_empty());
    }

    #[test]
    fn test_evict() {
        let fx = make_fixture();
        let mut uow = UnitOfWork::new();
        fx.engine.load(&mut uow, "User", 1).unwrap();

        assert!(fx.engine.evict(&mut uow, "User", 1).unwrap());
        assert!(uow.identity_map().is_empty());
        assert!(!fx.engine.evict(&mut uow, "User", 1).unwrap());
    }

    #[test]
    fn test_cache_key_uses_configured_prefix() {
        let fx = make_fixture();
        assert_eq!(
            fx.engine.cache_key("User", &AggregateId::from(3)).encode(),
            "AggregateModel:User:3"
        );
    }
}
