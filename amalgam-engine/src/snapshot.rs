//! Cache representation of an aggregate.
//!
//! Only data crosses the cache boundary. Live relation descriptors are rebuilt
//! from the schema on load and then get their cached ids back from here.

use std::collections::BTreeMap;
use std::sync::Arc;

use amalgam_core::{AggregateId, AttributeValue, CacheKey, CodecError};
use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, RelationCacheEntry};
use crate::schema::AggregateSchema;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub aggregate_type: String,
    pub id: Option<AggregateId>,
    pub version: i64,
    pub attributes: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub relations: BTreeMap<String, RelationCacheEntry>,
}

impl AggregateSnapshot {
    pub fn capture(aggregate: &Aggregate) -> Self {
        Self {
            aggregate_type: aggregate.type_name().to_string(),
            id: aggregate.id(),
            version: aggregate.version(),
            attributes: aggregate.attributes().clone(),
            relations: aggregate.relation_cache_entries().clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::Encode {
            what: format!("{} snapshot", self.aggregate_type),
            reason: e.to_string(),
        })
    }

    pub fn decode(key: &CacheKey, bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
            key: key.encode(),
            reason: e.to_string(),
        })
    }

    /// Rebuild a live aggregate. The result is never new: it came from a
    /// cache entry that was written after a load or a save.
    pub fn into_aggregate(self, schema: Arc<AggregateSchema>, initial_version: i64) -> Aggregate {
        let mut aggregate = Aggregate::blank(schema, initial_version);
        aggregate.restore(self.attributes, self.relations);
        aggregate.set_version(self.version);
        aggregate.mark_persisted();
        aggregate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::RelationIds;
    use crate::schema::{ModelDependency, RelationDescriptor};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn make_schema() -> Arc<AggregateSchema> {
        Arc::new(
            AggregateSchema::builder("User")
                .model(ModelDependency::primary("Member", "Member", "mem_id"))
                .map_field("id", "Member", "mem_id")
                .map_field("firstName", "Member", "fname")
                .relation(
                    RelationDescriptor::has_many("orders", "Order")
                        .with_finder(|_, _| Ok(RelationIds::Many(vec![])))
                        .cache_for(60),
                )
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_capture_and_rebuild() {
        let schema = make_schema();
        let mut aggregate = Aggregate::blank(Arc::clone(&schema), 1);
        aggregate.set("id", 1).unwrap();
        aggregate.set("firstName", "Test").unwrap();
        aggregate.set_version(4);
        aggregate.store_relation_cache(
            "orders",
            RelationCacheEntry {
                ids: RelationIds::Many(vec![AggregateId::from(7)]),
                captured_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                dependency: None,
            },
        );

        let key = CacheKey::aggregate("User", AggregateId::from(1));
        let bytes = AggregateSnapshot::capture(&aggregate).encode().unwrap();
        let snapshot = AggregateSnapshot::decode(&key, &bytes).unwrap();
        assert_eq!(snapshot.id, Some(AggregateId::from(1)));
        assert_eq!(snapshot.version, 4);

        let rebuilt = snapshot.into_aggregate(schema, 1);
        assert!(!rebuilt.is_new());
        assert_eq!(rebuilt.version(), 4);
        assert_eq!(rebuilt.get("firstName").unwrap(), &json!("Test"));
        assert_eq!(
            rebuilt.relation_cache("orders").unwrap().ids,
            RelationIds::Many(vec![AggregateId::from(7)])
        );
    }

    #[test]
    fn test_decode_garbage_is_codec_error() {
        let key = CacheKey::aggregate("User", AggregateId::from(1));
        let err = AggregateSnapshot::decode(&key, b"not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }

    #[test]
    fn test_snapshot_without_relations_decodes() {
        let key = CacheKey::aggregate("User", AggregateId::from(1));
        let raw = json!({
            "aggregate_type": "User",
            "id": 1,
            "version": 2,
            "attributes": {"id": 1, "version": 2, "firstName": "Old"}
        });
        let snapshot = AggregateSnapshot::decode(&key, raw.to_string().as_bytes()).unwrap();
        assert!(snapshot.relations.is_empty());
    }
}
