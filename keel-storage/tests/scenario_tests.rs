//! End-to-end scenarios across factory, region and engine
//!
//! Tests verify:
//! - A replicated, optimistic region survives losing its anchor
//! - Factory configuration from properties reaches built regions
//! - Region names are escaped consistently for any prefix

use keel_core::{
    CacheMode, ConcurrencyStrategy, DataVersion, EvictionStrategy, Propagation,
    RegionFactoryConfig, RegionNameCodec, RegionType,
};
use keel_storage::{
    ClusteredCache, InMemoryClusteredCache, RegionFactory, RegionState, ThreadTransactionManager,
    TransactionManager,
};
use keel_test_utils::fixtures::{replicated_async_optimistic, started_factory};
use keel_test_utils::init_tracing;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// REPLICATED ORDERS REGION
// ============================================================================

#[test]
fn test_orders_region_recovers_dropped_anchor() {
    init_tracing();
    let cache = replicated_async_optimistic();
    let factory = RegionFactory::new(
        cache.clone(),
        None,
        RegionFactoryConfig::new().with_region_prefix("app"),
    );
    factory.start().unwrap();

    let orders = factory.build_entity_region("orders").unwrap();
    let region = orders.region().clone();
    assert_eq!(region.root().as_str(), "app/orders");
    assert_eq!(region.concurrency(), ConcurrencyStrategy::Optimistic);

    // Activation pinned the anchor with a non-locking version.
    let anchor = cache.metadata(region.anchor_key()).unwrap().unwrap();
    assert!(anchor.resident);
    assert_eq!(anchor.version, DataVersion::NonLocking);

    let order = json!({ "id": 42, "customer": "acme", "total": 99.5 });
    orders.facade().put("order:42", order.clone()).unwrap();

    // A replication message from a peer drops the anchor on this member.
    assert!(cache.drop_entry(region.anchor_key()));

    // Data entries are independent of the anchor, so the value is still there.
    assert_eq!(orders.facade().get("order:42").unwrap(), Some(order));
    let anchor = cache.metadata(region.anchor_key()).unwrap().unwrap();
    assert!(anchor.resident);
    assert_eq!(anchor.version, DataVersion::NonLocking);
    assert_eq!(region.repair_count(), 1);
    assert_eq!(region.state(), RegionState::Active);

    let topology = cache.topology().unwrap();
    assert_eq!(topology.mode(), CacheMode::Replication);
    assert_eq!(topology.propagation(), Propagation::Async);

    factory.stop();
    assert_eq!(region.state(), RegionState::Destroyed);
}

#[test]
fn test_read_through_with_transactions() {
    let cache = replicated_async_optimistic();
    let transactions = Arc::new(ThreadTransactionManager::new());
    let manager: Arc<dyn TransactionManager> = transactions.clone();
    let factory = RegionFactory::new(cache, Some(manager), RegionFactoryConfig::new());
    factory.start().unwrap();

    let tx = transactions.begin().unwrap();
    let access = factory.build_entity_region("orders").unwrap().access();

    assert_eq!(access.get("order:7").unwrap(), None);
    assert!(access.put_from_load("order:7", json!({ "id": 7 }), true).unwrap());
    assert_eq!(access.get("order:7").unwrap(), Some(json!({ "id": 7 })));
    assert!(!access.put_from_load("order:7", json!({ "id": 8 }), true).unwrap());

    access.update("order:7", json!({ "id": 7, "paid": true })).unwrap();
    assert_eq!(
        access.get("order:7").unwrap(),
        Some(json!({ "id": 7, "paid": true }))
    );

    // Building the region suspended and resumed the transaction.
    assert_eq!(transactions.end(), Some(tx));
}

#[test]
fn test_factory_lifecycle_across_region_types() {
    let cache = Arc::new(InMemoryClusteredCache::default());
    let factory = started_factory(cache.clone());

    let built = vec![
        factory.build_entity_region("com.acme.Order").unwrap(),
        factory.build_immutable_entity_region("com.acme.Country").unwrap(),
        factory.build_collection_region("com.acme.Order.lines").unwrap(),
        factory.build_natural_id_region("com.acme.Order##NaturalId").unwrap(),
        factory.build_query_results_region("default-query").unwrap(),
        factory.build_timestamps_region("update-timestamps").unwrap(),
    ];
    for region in &built {
        region.facade().put("k", json!(region.region_type().as_str())).unwrap();
    }
    assert_eq!(factory.region_names().len(), 6);
    assert_eq!(cache.entry_count(), 12);

    factory.stop();
    assert!(built.iter().all(|r| r.region().is_destroyed()));
    assert_eq!(cache.entry_count(), 0);
    assert!(!factory.is_running());
    assert!(factory.build_entity_region("com.acme.Order").is_err());
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[test]
fn test_factory_from_properties() {
    let properties: HashMap<String, String> = [
        ("keel.cache.region_prefix", "shop"),
        ("keel.cache.entity.eviction.strategy", "LRU"),
        ("keel.cache.entity.eviction.max_entries", "100"),
        ("keel.cache.com.acme.Order.eviction.max_entries", "2"),
        ("keel.cache.query.cfg", "replicated-query"),
        ("unrelated.setting", "ignored"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    let config = RegionFactoryConfig::from_properties(&properties).unwrap();
    assert_eq!(config.region_prefix.as_deref(), Some("shop"));

    let factory = RegionFactory::new(Arc::new(InMemoryClusteredCache::default()), None, config);
    factory.start().unwrap();

    let order = factory.build_entity_region("com.acme.Order").unwrap();
    assert_eq!(order.settings().eviction_strategy, Some(EvictionStrategy::Lru));
    assert_eq!(order.settings().eviction_max_entries, Some(2));
    assert_eq!(order.region().root().as_str(), "shop/com/acme/Order");

    for i in 0..10 {
        order.facade().put(&i.to_string(), json!(i)).unwrap();
    }
    assert_eq!(order.facade().size().unwrap(), 2);

    let customer = factory.build_entity_region("com.acme.Customer").unwrap();
    assert_eq!(customer.settings().eviction_max_entries, Some(100));

    let query = factory.build_query_results_region("default-query").unwrap();
    assert_eq!(query.settings().cache_name.as_deref(), Some("replicated-query"));
    assert_eq!(query.region_type(), RegionType::QueryResults);

    assert_eq!(
        factory.region_names(),
        vec!["com.acme.Customer", "com.acme.Order", "default-query"]
    );
}

#[test]
fn test_timestamps_eviction_rejected_at_start() {
    let properties: HashMap<String, String> =
        [("keel.cache.timestamps.eviction.strategy", "LRU".to_string())]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
    assert!(RegionFactoryConfig::from_properties(&properties).is_err());
}

// ============================================================================
// PROPERTIES
// ============================================================================

mod prop_tests {
    use super::*;
    use keel_test_utils::generators::{arb_region_name, arb_region_prefix, arb_region_type};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Every built region lives under the qualified name of its prefix.
        #[test]
        fn prop_built_region_root_matches_codec(
            name in arb_region_name(),
            prefix in arb_region_prefix(),
            region_type in arb_region_type(),
        ) {
            let mut config = RegionFactoryConfig::new();
            if let Some(prefix) = &prefix {
                config = config.with_region_prefix(prefix.clone());
            }
            let factory = RegionFactory::new(
                Arc::new(InMemoryClusteredCache::default()),
                None,
                config,
            );
            factory.start().unwrap();

            let built = factory.build_region(&name, region_type).unwrap();
            let expected = RegionNameCodec::qualify(&name, prefix.as_deref());
            prop_assert_eq!(built.region().root(), &expected);
            prop_assert_eq!(built.region_type(), region_type);
        }
    }
}
