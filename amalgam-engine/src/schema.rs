//! Aggregate type declarations.
//!
//! An [`AggregateSchema`] is read once per aggregate type when it is
//! registered: which child records make up the aggregate, how their fields
//! map onto aggregate attributes, which relations exist, and the optional
//! validation and assembly hooks. Instances only hold an `Arc` to it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use amalgam_core::{AggregateId, AttributeValue, CacheKey, ChildRecord};
use amalgam_storage::CacheDependency;
use tracing::warn;

use crate::aggregate::{Aggregate, RelationIds};
use crate::error::{EngineError, EngineResult, ValidationIssue};

/// Attribute names every aggregate carries.
pub const ID_ATTRIBUTE: &str = "id";
pub const VERSION_ATTRIBUTE: &str = "version";

/// Computes the ids behind a relation from the owner's id and state.
pub type Finder =
    Arc<dyn Fn(Option<&AggregateId>, &Aggregate) -> EngineResult<RelationIds> + Send + Sync>;

/// Validation hook run by `save`.
pub type Validator = Arc<dyn Fn(&Aggregate) -> Result<(), Vec<ValidationIssue>> + Send + Sync>;

/// Produces a fresh child record for a dependency, or `None` if it cannot.
pub type Assembler = Arc<dyn Fn(&ModelDependency) -> Option<ChildRecord> + Send + Sync>;

/// Two-way value conversion between a child field and an aggregate attribute.
pub trait AttributeTransformer: Send + Sync {
    /// Child field value to aggregate attribute value.
    fn to_clean(&self, value: AttributeValue, field: &str, owner: &ChildRecord) -> AttributeValue;

    /// Aggregate attribute value to child field value.
    fn to_dirty(&self, value: AttributeValue, field: &str, owner: &ChildRecord) -> AttributeValue;
}

// ============================================================================
// MAPPING
// ============================================================================

/// Maps one aggregate attribute to a path inside one child record.
#[derive(Clone)]
pub struct MappingEntry {
    /// Logical attribute name on the aggregate.
    pub attribute: String,
    /// Key of the child model dependency holding the value.
    pub model: String,
    /// Dot-separated path; all but the last segment walk nested relations.
    pub path: String,
    /// Populated on load, never written back on save.
    pub read_only: bool,
    transformer: Option<Arc<dyn AttributeTransformer>>,
}

impl MappingEntry {
    pub fn new(
        attribute: impl Into<String>,
        model: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            model: model.into(),
            path: path.into(),
            read_only: false,
            transformer: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn AttributeTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn transformer(&self) -> Option<&dyn AttributeTransformer> {
        self.transformer.as_deref()
    }
}

impl fmt::Debug for MappingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingEntry")
            .field("attribute", &self.attribute)
            .field("model", &self.model)
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("transformer", &self.transformer.is_some())
            .finish()
    }
}

// ============================================================================
// MODEL DEPENDENCIES
// ============================================================================

/// How a child record is found from the aggregate id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The aggregate id is the child's primary key, stored in this field.
    PrimaryKey(String),
    /// The child references the aggregate id through this field.
    ForeignKey(String),
}

impl Lookup {
    /// Field compared against the aggregate id.
    pub fn field(&self) -> &str {
        match self {
            Lookup::PrimaryKey(f) | Lookup::ForeignKey(f) => f,
        }
    }

    /// Field stamped with the aggregate id on save.
    pub fn stamped_field(&self) -> Option<&str> {
        match self {
            Lookup::PrimaryKey(_) => None,
            Lookup::ForeignKey(f) => Some(f),
        }
    }
}

/// A child record the aggregate is assembled from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDependency {
    /// Key used by mapping entries.
    pub key: String,
    /// Model name in the child store.
    pub model: String,
    pub lookup: Lookup,
    /// Load yields not-found when a required child is missing.
    pub required: bool,
}

impl ModelDependency {
    /// Child whose primary key (in `pk_field`) is the aggregate id.
    pub fn primary(key: impl Into<String>, model: impl Into<String>, pk_field: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model: model.into(),
            lookup: Lookup::PrimaryKey(pk_field.into()),
            required: false,
        }
    }

    /// Child pointing at the aggregate through `fk_field`.
    pub fn foreign(key: impl Into<String>, model: impl Into<String>, fk_field: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model: model.into(),
            lookup: Lookup::ForeignKey(fk_field.into()),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

// ============================================================================
// RELATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    BelongsTo,
    HasOne,
    HasMany,
}

impl RelationKind {
    pub fn is_many(&self) -> bool {
        matches!(self, RelationKind::HasMany)
    }
}

/// A lazily resolved link to other aggregates.
#[derive(Clone)]
pub struct RelationDescriptor {
    name: String,
    kind: RelationKind,
    target: String,
    attribute: Option<String>,
    finder: Option<Finder>,
    cache_duration: Option<u64>,
    dependency: Option<Arc<dyn CacheDependency>>,
}

impl RelationDescriptor {
    fn new(name: impl Into<String>, kind: RelationKind, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            attribute: None,
            finder: None,
            cache_duration: None,
            dependency: None,
        }
    }

    pub fn belongs_to(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, RelationKind::BelongsTo, target)
    }

    pub fn has_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, RelationKind::HasOne, target)
    }

    pub fn has_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, RelationKind::HasMany, target)
    }

    /// Read the foreign id straight from a local attribute.
    pub fn via_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn with_finder<F>(mut self, finder: F) -> Self
    where
        F: Fn(Option<&AggregateId>, &Aggregate) -> EngineResult<RelationIds> + Send + Sync + 'static,
    {
        self.finder = Some(Arc::new(finder));
        self
    }

    /// Cache found ids for `seconds`; 0 keeps them until a dependency changes.
    pub fn cache_for(mut self, seconds: u64) -> Self {
        self.cache_duration = Some(seconds);
        self
    }

    pub fn depends_on(mut self, dependency: Arc<dyn CacheDependency>) -> Self {
        self.dependency = Some(dependency);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    /// Aggregate type the relation points at.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn attribute(&self) -> Option<&str> {
        self.attribute.as_deref()
    }

    pub fn finder(&self) -> Option<&Finder> {
        self.finder.as_ref()
    }

    pub fn cache_duration(&self) -> Option<u64> {
        self.cache_duration
    }

    pub fn dependency(&self) -> Option<&dyn CacheDependency> {
        self.dependency.as_deref()
    }

    /// BelongsTo relations with a direct attribute bypass finder and caching.
    pub fn uses_direct_attribute(&self) -> bool {
        self.kind == RelationKind::BelongsTo && self.attribute.is_some()
    }
}

impl fmt::Debug for RelationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("attribute", &self.attribute)
            .field("finder", &self.finder.is_some())
            .field("cache_duration", &self.cache_duration)
            .field("dependency", &self.dependency)
            .finish()
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

/// Everything the engine knows about one aggregate type.
pub struct AggregateSchema {
    name: String,
    models: Vec<ModelDependency>,
    mapping: Vec<MappingEntry>,
    defaults: BTreeMap<String, AttributeValue>,
    relations: Vec<RelationDescriptor>,
    validator: Option<Validator>,
    assembler: Option<Assembler>,
    cache_ttl: Option<u64>,
    attribute_names: BTreeSet<String>,
}

impl AggregateSchema {
    pub fn builder(name: impl Into<String>) -> AggregateSchemaBuilder {
        AggregateSchemaBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Child dependencies in declared order.
    pub fn models(&self) -> &[ModelDependency] {
        &self.models
    }

    pub fn model(&self, key: &str) -> Option<&ModelDependency> {
        self.models.iter().find(|m| m.key == key)
    }

    pub fn mapping(&self) -> &[MappingEntry] {
        &self.mapping
    }

    pub fn default_for(&self, attribute: &str) -> Option<&AttributeValue> {
        self.defaults.get(attribute)
    }

    pub fn relations(&self) -> &[RelationDescriptor] {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn validator(&self) -> Option<&Validator> {
        self.validator.as_ref()
    }

    /// Per-type TTL override for aggregate cache entries.
    pub fn cache_ttl(&self) -> Option<u64> {
        self.cache_ttl
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute_names.contains(name)
    }

    /// All declared attribute names, always including `id` and `version`.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attribute_names.iter().map(String::as_str)
    }

    /// Fresh child record for a creation flow.
    pub fn assemble_child(&self, dependency: &ModelDependency) -> Option<ChildRecord> {
        match &self.assembler {
            Some(assemble) => assemble(dependency),
            None => Some(ChildRecord::new(dependency.model.clone())),
        }
    }
}

impl fmt::Debug for AggregateSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateSchema")
            .field("name", &self.name)
            .field("models", &self.models)
            .field("mapping", &self.mapping)
            .field("defaults", &self.defaults)
            .field("relations", &self.relations)
            .field("validator", &self.validator.is_some())
            .field("assembler", &self.assembler.is_some())
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

/// Builder for [`AggregateSchema`].
pub struct AggregateSchemaBuilder {
    name: String,
    models: Vec<ModelDependency>,
    mapping: Vec<MappingEntry>,
    defaults: BTreeMap<String, AttributeValue>,
    relations: Vec<RelationDescriptor>,
    validator: Option<Validator>,
    assembler: Option<Assembler>,
    cache_ttl: Option<u64>,
}

impl AggregateSchemaBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            models: Vec::new(),
            mapping: Vec::new(),
            defaults: BTreeMap::new(),
            relations: Vec::new(),
            validator: None,
            assembler: None,
            cache_ttl: None,
        }
    }

    pub fn model(mut self, dependency: ModelDependency) -> Self {
        self.models.push(dependency);
        self
    }

    pub fn map(mut self, entry: MappingEntry) -> Self {
        self.mapping.push(entry);
        self
    }

    /// Shorthand for a writable mapping entry.
    pub fn map_field(
        self,
        attribute: impl Into<String>,
        model: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        self.map(MappingEntry::new(attribute, model, path))
    }

    pub fn default_value(mut self, attribute: impl Into<String>, value: AttributeValue) -> Self {
        self.defaults.insert(attribute.into(), value);
        self
    }

    pub fn relation(mut self, relation: RelationDescriptor) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn validator<F>(mut self, validate: F) -> Self
    where
        F: Fn(&Aggregate) -> Result<(), Vec<ValidationIssue>> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validate));
        self
    }

    pub fn assembler<F>(mut self, assemble: F) -> Self
    where
        F: Fn(&ModelDependency) -> Option<ChildRecord> + Send + Sync + 'static,
    {
        self.assembler = Some(Arc::new(assemble));
        self
    }

    pub fn cache_ttl(mut self, ttl_seconds: u64) -> Self {
        self.cache_ttl = Some(ttl_seconds);
        self
    }

    fn invalid(&self, reason: impl Into<String>) -> EngineError {
        EngineError::InvalidDeclaration {
            aggregate_type: self.name.clone(),
            reason: reason.into(),
        }
    }

    pub fn build(self) -> EngineResult<AggregateSchema> {
        if !CacheKey::is_valid_type_name(&self.name) {
            return Err(self.invalid("type name must be non-empty and contain no ':'"));
        }

        let mut model_keys = BTreeSet::new();
        for dependency in &self.models {
            if !model_keys.insert(dependency.key.as_str()) {
                return Err(self.invalid(format!("duplicate model key {}", dependency.key)));
            }
        }

        let mut attribute_names: BTreeSet<String> =
            [ID_ATTRIBUTE, VERSION_ATTRIBUTE].iter().map(|s| s.to_string()).collect();
        let mut mapped = BTreeSet::new();
        for entry in &self.mapping {
            if !mapped.insert(entry.attribute.as_str()) {
                return Err(self.invalid(format!("attribute {} mapped twice", entry.attribute)));
            }
            if entry.path.split('.').any(str::is_empty) {
                return Err(self.invalid(format!(
                    "mapping for {} has malformed path '{}'",
                    entry.attribute, entry.path
                )));
            }
            if !model_keys.contains(entry.model.as_str()) {
                // Tolerated: the attribute just stays at its default.
                warn!(
                    aggregate_type = %self.name,
                    attribute = %entry.attribute,
                    model = %entry.model,
                    "mapping references an undeclared model"
                );
            }
            attribute_names.insert(entry.attribute.clone());
        }
        attribute_names.extend(self.defaults.keys().cloned());

        let mut relation_names = BTreeSet::new();
        for relation in &self.relations {
            if !relation_names.insert(relation.name.as_str()) {
                return Err(self.invalid(format!("duplicate relation {}", relation.name)));
            }
            match (&relation.attribute, relation.kind) {
                (Some(_), RelationKind::HasOne | RelationKind::HasMany) => {
                    return Err(self.invalid(format!(
                        "relation {} may only use a direct attribute as BelongsTo",
                        relation.name
                    )));
                }
                (Some(attribute), RelationKind::BelongsTo) => {
                    if !attribute_names.contains(attribute) {
                        return Err(self.invalid(format!(
                            "relation {} reads undeclared attribute {}",
                            relation.name, attribute
                        )));
                    }
                }
                (None, _) => {
                    if relation.finder.is_none() {
                        return Err(
                            self.invalid(format!("relation {} needs a finder", relation.name))
                        );
                    }
                }
            }
            if !CacheKey::is_valid_type_name(&relation.target) {
                return Err(self.invalid(format!(
                    "relation {} has invalid target type '{}'",
                    relation.name, relation.target
                )));
            }
        }

        Ok(AggregateSchema {
            name: self.name,
            models: self.models,
            mapping: self.mapping,
            defaults: self.defaults,
            relations: self.relations,
            validator: self.validator,
            assembler: self.assembler,
            cache_ttl: self.cache_ttl,
            attribute_names,
        })
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Capability implemented once per aggregate type.
pub trait AggregateDefinition {
    /// Type tag used in cache keys and registry lookups.
    const TYPE_NAME: &'static str;

    fn schema() -> EngineResult<AggregateSchema>;
}

/// Aggregate schemas indexed by type name.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<AggregateSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: AggregateSchema) -> EngineResult<Arc<AggregateSchema>> {
        if self.schemas.contains_key(schema.name()) {
            return Err(EngineError::InvalidDeclaration {
                aggregate_type: schema.name().to_string(),
                reason: "type registered twice".to_string(),
            });
        }
        let schema = Arc::new(schema);
        self.schemas
            .insert(schema.name().to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn register_definition<D: AggregateDefinition>(&mut self) -> EngineResult<Arc<AggregateSchema>> {
        let schema = D::schema()?;
        if schema.name() != D::TYPE_NAME {
            return Err(EngineError::InvalidDeclaration {
                aggregate_type: D::TYPE_NAME.to_string(),
                reason: format!("schema is named {}", schema.name()),
            });
        }
        self.register(schema)
    }

    pub fn get(&self, name: &str) -> EngineResult<Arc<AggregateSchema>> {
        self.schemas
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownType {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_builder() -> AggregateSchemaBuilder {
        AggregateSchema::builder("User")
            .model(ModelDependency::primary("Member", "Member", "mem_id").required())
            .model(ModelDependency::foreign("Address", "Address", "mem_id"))
            .map_field("id", "Member", "mem_id")
            .map_field("firstName", "Member", "fname")
            .map_field("addressLine1", "Address", "line1")
    }

    #[test]
    fn test_build_collects_attribute_names() {
        let schema = user_builder()
            .default_value("status", json!("active"))
            .build()
            .unwrap();
        let names: Vec<&str> = schema.attribute_names().collect();
        assert_eq!(
            names,
            vec!["addressLine1", "firstName", "id", "status", "version"]
        );
        assert!(schema.has_attribute("version"));
        assert_eq!(schema.default_for("status"), Some(&json!("active")));
    }

    #[test]
    fn test_models_keep_declared_order() {
        let schema = user_builder().build().unwrap();
        let keys: Vec<&str> = schema.models().iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["Member", "Address"]);
        assert!(schema.model("Member").unwrap().required);
        assert!(!schema.model("Address").unwrap().required);
    }

    #[test]
    fn test_rejects_bad_type_name() {
        let err = AggregateSchema::builder("Bad:Name").build().unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeclaration { .. }));
    }

    #[test]
    fn test_rejects_duplicate_mapping() {
        let err = user_builder()
            .map_field("firstName", "Member", "other")
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeclaration { .. }));
    }

    #[test]
    fn test_rejects_malformed_path() {
        let err = user_builder()
            .map_field("city", "Address", "geo..city")
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeclaration { .. }));
    }

    #[test]
    fn test_undeclared_model_in_mapping_is_tolerated() {
        let schema = user_builder()
            .map_field("nickname", "Profile", "nick")
            .build()
            .unwrap();
        assert!(schema.has_attribute("nickname"));
    }

    #[test]
    fn test_relation_without_finder_rejected() {
        let err = user_builder()
            .relation(RelationDescriptor::has_many("orders", "Order"))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeclaration { .. }));
    }

    #[test]
    fn test_direct_attribute_only_for_belongs_to() {
        let err = user_builder()
            .relation(RelationDescriptor::has_one("profile", "Profile").via_attribute("id"))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeclaration { .. }));

        let err = user_builder()
            .relation(RelationDescriptor::belongs_to("company", "Company").via_attribute("companyId"))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeclaration { .. }));

        let schema = user_builder()
            .default_value("companyId", json!(null))
            .relation(RelationDescriptor::belongs_to("company", "Company").via_attribute("companyId"))
            .build()
            .unwrap();
        assert!(schema.relation("company").unwrap().uses_direct_attribute());
    }

    #[test]
    fn test_default_assembler_creates_new_record() {
        let schema = user_builder().build().unwrap();
        let dependency = schema.model("Address").unwrap();
        let record = schema.assemble_child(dependency).unwrap();
        assert_eq!(record.model(), "Address");
        assert!(record.is_new());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = SchemaRegistry::new();
        registry.register(user_builder().build().unwrap()).unwrap();

        assert!(registry.contains("User"));
        assert_eq!(registry.get("User").unwrap().name(), "User");
        assert!(matches!(
            registry.get("Order"),
            Err(EngineError::UnknownType { .. })
        ));
        assert!(registry.register(user_builder().build().unwrap()).is_err());
    }

    struct Mismatched;

    impl AggregateDefinition for Mismatched {
        const TYPE_NAME: &'static str = "Account";

        fn schema() -> EngineResult<AggregateSchema> {
            AggregateSchema::builder("User").build()
        }
    }

    #[test]
    fn test_definition_name_must_match() {
        let mut registry = SchemaRegistry::new();
        assert!(registry.register_definition::<Mismatched>().is_err());
        assert!(registry.is_empty());
    }
}
