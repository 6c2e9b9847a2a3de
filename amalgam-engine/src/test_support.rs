//! Customer/Order fixture shared by the unit tests in this crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use amalgam_core::{AggregateId, EngineConfig, ManualClock};
use amalgam_storage::{InMemoryCacheStore, InMemoryChildStore};
use chrono::{TimeZone, Utc};
use serde_json::json;

use crate::aggregate::RelationIds;
use crate::engine::AggregateEngine;
use crate::schema::{AggregateSchema, ModelDependency, RelationDescriptor, SchemaRegistry};

pub(crate) struct Harness {
    pub engine: AggregateEngine,
    pub cache: Arc<InMemoryCacheStore>,
    pub children: Arc<InMemoryChildStore>,
    pub clock: Arc<ManualClock>,
    pub finder_calls: Arc<AtomicUsize>,
    pub order_ids: Arc<RwLock<Vec<AggregateId>>>,
}

impl Harness {
    pub fn finder_calls(&self) -> usize {
        self.finder_calls.load(Ordering::SeqCst)
    }

    pub fn set_order_ids(&self, ids: Vec<i64>) {
        *self.order_ids.write().unwrap() = ids.into_iter().map(AggregateId::from).collect();
    }
}

fn customer_schema(
    finder_calls: Arc<AtomicUsize>,
    order_ids: Arc<RwLock<Vec<AggregateId>>>,
) -> AggregateSchema {
    let latest = Arc::clone(&order_ids);
    AggregateSchema::builder("Customer")
        .model(ModelDependency::primary("Customer", "Customer", "cust_id").required())
        .map_field("id", "Customer", "cust_id")
        .map_field("name", "Customer", "name")
        .map_field("managerId", "Customer", "manager_id")
        .relation(RelationDescriptor::belongs_to("manager", "Customer").via_attribute("managerId"))
        .relation(
            RelationDescriptor::has_many("orders", "Order")
                .with_finder(move |_, _| {
                    finder_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(RelationIds::Many(order_ids.read().unwrap().clone()))
                })
                .cache_for(60),
        )
        .relation(
            RelationDescriptor::has_one("latestOrder", "Order")
                .with_finder(move |_, _| Ok(RelationIds::Many(latest.read().unwrap().clone()))),
        )
        .build()
        .unwrap()
}

fn order_schema() -> AggregateSchema {
    AggregateSchema::builder("Order")
        .model(ModelDependency::primary("Order", "Order", "order_id").required())
        .map_field("id", "Order", "order_id")
        .map_field("total", "Order", "total")
        .build()
        .unwrap()
}

/// Customers 1 (manager 2) and 2; orders 10, 11 and 12. The orders finder
/// starts out returning `[10, 11, 99, 12]`, where 99 does not exist.
pub(crate) fn harness() -> Harness {
    let finder_calls = Arc::new(AtomicUsize::new(0));
    let order_ids = Arc::new(RwLock::new(
        [10, 11, 99, 12].into_iter().map(AggregateId::from).collect(),
    ));

    let mut registry = SchemaRegistry::new();
    registry
        .register(customer_schema(Arc::clone(&finder_calls), Arc::clone(&order_ids)))
        .unwrap();
    registry.register(order_schema()).unwrap();

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let cache = Arc::new(InMemoryCacheStore::with_clock(clock.clone()));
    let children = Arc::new(
        InMemoryChildStore::new()
            .with_model("Customer", "cust_id")
            .with_model("Order", "order_id"),
    );
    children
        .insert("Customer", json!({"cust_id": 1, "name": "Ada", "manager_id": 2}))
        .unwrap();
    children
        .insert("Customer", json!({"cust_id": 2, "name": "Grace", "manager_id": null}))
        .unwrap();
    for (id, total) in [(10, 5), (11, 12), (12, 40)] {
        children
            .insert("Order", json!({"order_id": id, "total": total}))
            .unwrap();
    }

    let engine = AggregateEngine::new(registry, cache.clone(), children.clone(), EngineConfig::default())
        .unwrap()
        .with_clock(clock.clone());

    Harness {
        engine,
        cache,
        children,
        clock,
        finder_calls,
        order_ids,
    }
}
