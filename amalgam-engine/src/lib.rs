//! Amalgam Engine - Cached Aggregates Over Child Records
//!
//! An aggregate is one logical entity whose attributes live across several
//! child records. The engine assembles aggregates from those records through
//! declarative path mappings, keeps one live instance per id inside a
//! [`UnitOfWork`], caches a serialized snapshot per aggregate, writes changes
//! back onto the children on save, and resolves relations to other
//! aggregates lazily with their own cache rules.
//!
//! ```ignore
//! let mut uow = UnitOfWork::new();
//! let user = engine.load(&mut uow, "User", 1)?.expect("user 1");
//! user.borrow_mut().set("firstName", "Ada")?;
//! engine.save(&mut uow, &user)?;
//! ```

pub mod aggregate;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod identity_map;
pub mod list_proxy;
pub mod mapper;
pub mod relation;
pub mod schema;
pub mod snapshot;

#[cfg(test)]
mod test_support;

pub use aggregate::{Aggregate, AggregateRef, RelationCacheEntry, RelationIds};
pub use dependency::AggregateVersionDependency;
pub use engine::{AggregateEngine, LoadOptions, UpdateMode};
pub use error::{EngineError, EngineResult, ValidationIssue};
pub use identity_map::{IdentityMap, UnitOfWork};
pub use list_proxy::{ListItem, ListIter, ListProxy};
pub use mapper::{ChildRecords, Resolution};
pub use relation::RelationData;
pub use schema::{
    AggregateDefinition, AggregateSchema, AggregateSchemaBuilder, Assembler,
    AttributeTransformer, Finder, Lookup, MappingEntry, ModelDependency, RelationDescriptor,
    RelationKind, SchemaRegistry, Validator, ID_ATTRIBUTE, VERSION_ATTRIBUTE,
};
pub use snapshot::AggregateSnapshot;
