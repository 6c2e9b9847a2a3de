//! Amalgam Test Utilities
//!
//! Shared test infrastructure for the Amalgam workspace:
//! - Proptest generators for ids, names and attribute values
//! - Fixtures for the Member/Address `User` scenario
//! - Custom assertions for engine outcomes

use std::sync::Arc;

pub use amalgam_core::{
    AggregateId, CacheKey, ChildRecord, Clock, CoreError, EngineConfig, ManualClock,
    StorageError,
};
pub use amalgam_engine::{
    AggregateDefinition, AggregateEngine, AggregateRef, AggregateSchema, EngineError,
    EngineResult, LoadOptions, MappingEntry, ModelDependency, SchemaRegistry, UnitOfWork,
    UpdateMode, ValidationIssue,
};
pub use amalgam_storage::{CacheStore, ChildModelStore, InMemoryCacheStore, InMemoryChildStore};

/// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
///
/// Safe to call from every test; later calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for engine inputs.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    pub fn arb_int_id() -> impl Strategy<Value = AggregateId> {
        (1i64..1_000_000).prop_map(AggregateId::Int)
    }

    pub fn arb_text_id() -> impl Strategy<Value = AggregateId> {
        "[a-z0-9][a-z0-9:_-]{0,23}".prop_map(AggregateId::Text)
    }

    pub fn arb_aggregate_id() -> impl Strategy<Value = AggregateId> {
        prop_oneof![arb_int_id(), arb_text_id()]
    }

    /// Valid aggregate type names (no `:`).
    pub fn arb_type_name() -> impl Strategy<Value = String> {
        "[A-Z][A-Za-z0-9]{0,15}"
    }

    pub fn arb_field_name() -> impl Strategy<Value = String> {
        "[a-z][a-z_]{0,11}"
    }

    /// A person's first name, never empty.
    pub fn arb_first_name() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{1,11}"
    }

    /// Non-null scalar attribute values.
    pub fn arb_scalar_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,32}".prop_map(Value::from),
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! The `User` scenario: a Member row keyed by `mem_id` plus an Address
    //! row pointing back at it, and an `Account` view over the same Member
    //! row with a nested profile path.

    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    pub const USER: &str = "User";
    pub const ACCOUNT: &str = "Account";

    /// `User`: id, firstName and addressLine1 over Member and Address.
    pub struct UserAggregate;

    impl AggregateDefinition for UserAggregate {
        const TYPE_NAME: &'static str = USER;

        fn schema() -> EngineResult<AggregateSchema> {
            AggregateSchema::builder(USER)
                .model(ModelDependency::primary("Member", "Member", "mem_id").required())
                .model(ModelDependency::foreign("Address", "Address", "mem_id"))
                .map_field("id", "Member", "mem_id")
                .map_field("firstName", "Member", "fname")
                .map_field("addressLine1", "Address", "line1")
                .validator(|user| {
                    match user.get("firstName") {
                        Ok(serde_json::Value::String(name)) if !name.trim().is_empty() => Ok(()),
                        _ => Err(vec![ValidationIssue::new("firstName", "must not be empty")]),
                    }
                })
                .build()
        }
    }

    /// `Account`: nickname lives under the optional `profile` object of the
    /// Member row and defaults to `"anonymous"`; status is read-only.
    pub struct AccountAggregate;

    impl AggregateDefinition for AccountAggregate {
        const TYPE_NAME: &'static str = ACCOUNT;

        fn schema() -> EngineResult<AggregateSchema> {
            AggregateSchema::builder(ACCOUNT)
                .model(ModelDependency::primary("Member", "Member", "mem_id").required())
                .map_field("id", "Member", "mem_id")
                .map_field("nickname", "Member", "profile.nickname")
                .map(MappingEntry::new("status", "Member", "status").read_only())
                .default_value("nickname", json!("anonymous"))
                .build()
        }
    }

    pub fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register_definition::<UserAggregate>()
            .expect("User schema is valid");
        registry
            .register_definition::<AccountAggregate>()
            .expect("Account schema is valid");
        registry
    }

    /// Member 1 ("Test", no profile) with its address, and member 2 with a
    /// profile but no address.
    pub fn seeded_child_store() -> InMemoryChildStore {
        let store = InMemoryChildStore::new()
            .with_model("Member", "mem_id")
            .with_model("Address", "addr_id");
        store
            .insert(
                "Member",
                json!({"mem_id": 1, "fname": "Test", "profile": null, "status": "active"}),
            )
            .expect("seed member 1");
        store
            .insert(
                "Address",
                json!({"addr_id": 1, "mem_id": 1, "line1": "123 Fake Street"}),
            )
            .expect("seed address 1");
        store
            .insert(
                "Member",
                json!({
                    "mem_id": 2,
                    "fname": "Second",
                    "profile": {"nickname": "deuce"},
                    "status": "suspended"
                }),
            )
            .expect("seed member 2");
        store
    }

    /// Fixed starting point for the manual clock.
    pub fn epoch() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    /// An engine wired to in-memory stores and a manual clock.
    pub struct TestHarness {
        pub engine: AggregateEngine,
        pub cache: Arc<InMemoryCacheStore>,
        pub children: Arc<InMemoryChildStore>,
        pub clock: Arc<ManualClock>,
    }

    impl TestHarness {
        pub fn new() -> Self {
            Self::with_config(EngineConfig::default())
        }

        pub fn with_config(config: EngineConfig) -> Self {
            Self::with_registry(registry(), config)
        }

        pub fn with_registry(registry: SchemaRegistry, config: EngineConfig) -> Self {
            Self::build(config, |_| registry)
        }

        /// Build with a registry that needs the harness cache, e.g. for
        /// relations depending on another aggregate's cached version.
        pub fn build<F>(config: EngineConfig, make_registry: F) -> Self
        where
            F: FnOnce(&Arc<InMemoryCacheStore>) -> SchemaRegistry,
        {
            let clock = Arc::new(ManualClock::new(epoch()));
            let cache = Arc::new(InMemoryCacheStore::with_clock(clock.clone()));
            let children = Arc::new(seeded_child_store());
            let registry = make_registry(&cache);
            let engine = AggregateEngine::new(registry, cache.clone(), children.clone(), config)
                .expect("test config is valid")
                .with_clock(clock.clone());
            Self {
                engine,
                cache,
                children,
                clock,
            }
        }

        pub fn user_key(&self, id: i64) -> CacheKey {
            self.engine.cache_key(USER, &AggregateId::from(id))
        }

        /// Version stored in the cache entry for `User:<id>`, if any.
        pub fn cached_user_version(&self, id: i64) -> Option<i64> {
            let bytes = self.cache.get(&self.user_key(id)).ok()??;
            let snapshot: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
            snapshot.get("version")?.as_i64()
        }

        /// Current row for `model` whose `field` equals `value`.
        pub fn row(&self, model: &str, field: &str, value: serde_json::Value) -> Option<ChildRecord> {
            self.children
                .find_by_field(model, field, &value)
                .expect("child lookup")
        }
    }

    impl Default for TestHarness {
        fn default() -> Self {
            Self::new()
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for engine outcomes.

    use super::*;
    use std::rc::Rc;

    /// Assert that two handles are the very same live instance.
    #[track_caller]
    pub fn assert_same_instance(a: &AggregateRef, b: &AggregateRef) {
        assert!(Rc::ptr_eq(a, b), "Expected the same aggregate instance");
    }

    /// Assert an attribute's value.
    #[track_caller]
    pub fn assert_attribute(aggregate: &AggregateRef, name: &str, expected: serde_json::Value) {
        let aggregate = aggregate.borrow();
        match aggregate.get(name) {
            Ok(actual) => assert_eq!(actual, &expected, "attribute {}", name),
            Err(err) => panic!("Expected attribute {}, got: {}", name, err),
        }
    }

    #[track_caller]
    pub fn assert_validation_failed<T: std::fmt::Debug>(result: &EngineResult<T>) {
        match result {
            Err(EngineError::ValidationFailed { .. }) => {}
            other => panic!("Expected ValidationFailed, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_persist_failed<T: std::fmt::Debug>(result: &EngineResult<T>, model: &str) {
        match result {
            Err(EngineError::PersistFailed { model: m, .. }) => {
                assert_eq!(m, model, "Wrong model in PersistFailed");
            }
            other => panic!("Expected PersistFailed on {}, got: {:?}", model, other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
