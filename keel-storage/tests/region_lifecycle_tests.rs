//! Integration tests for region anchors
//!
//! Tests verify:
//! - A lost or unpinned anchor is re-established before any data operation
//! - Concurrent callers on an invalid anchor repair it exactly once
//! - Destroy never fails and only tears down once
//! - Activation failures surface to the caller

use keel_core::{
    Capabilities, ConcurrencyStrategy, DataVersion, EngineError, KeelError, RegionAdminError,
};
use keel_storage::{
    CacheAdapter, CacheOperationFacade, ClusteredCache, InMemoryClusteredCache,
    RegionLifecycleManager, RegionState, TransactionScopeGuard,
};
use keel_test_utils::fixtures::{faulty_cache, local_cache};
use keel_test_utils::{init_tracing, FaultPoint};
use proptest::prelude::*;
use serde_json::json;
use std::num::NonZeroUsize;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn lifecycle_over(cache: Arc<dyn ClusteredCache>) -> Arc<RegionLifecycleManager> {
    Arc::new(RegionLifecycleManager::new(
        CacheAdapter::new(cache),
        TransactionScopeGuard::without_transactions(),
    ))
}

fn facade_over(
    cache: Arc<dyn ClusteredCache>,
    name: &str,
    prefix: Option<&str>,
) -> CacheOperationFacade {
    let lifecycle = lifecycle_over(cache);
    let region = lifecycle.activate(name, prefix).unwrap();
    CacheOperationFacade::new(region, lifecycle)
}

fn assert_anchor_valid(cache: &InMemoryClusteredCache, facade: &CacheOperationFacade) {
    let region = facade.region();
    let meta = cache
        .metadata(region.anchor_key())
        .unwrap()
        .expect("anchor present");
    assert!(meta.resident, "anchor of {} is not resident", region.root());
    if region.concurrency().is_optimistic() {
        assert_eq!(meta.version, DataVersion::NonLocking);
    }
}

// ============================================================================
// ANCHOR REPAIR
// ============================================================================

#[test]
fn test_anchor_survives_eviction_pressure() {
    init_tracing();
    let cache = Arc::new(
        InMemoryClusteredCache::builder()
            .max_entries(NonZeroUsize::new(3).unwrap())
            .build(),
    );
    let facade = facade_over(cache.clone(), "com.acme.Order", Some("app"));

    for i in 0..50 {
        facade.put(&format!("order:{}", i), json!({ "id": i })).unwrap();
        assert_anchor_valid(&cache, &facade);
    }

    assert!(cache.eviction_count() > 0);
    assert_eq!(facade.size().unwrap(), 3);
    assert_eq!(facade.region().repair_count(), 0);
}

#[test]
fn test_dropped_anchor_is_repaired_before_operation() {
    let cache = local_cache();
    let facade = facade_over(cache.clone(), "orders", None);
    facade.put("a", json!(1)).unwrap();

    assert!(cache.drop_entry(facade.region().anchor_key()));
    assert_eq!(facade.get("a").unwrap(), Some(json!(1)));
    assert_anchor_valid(&cache, &facade);
    assert_eq!(facade.region().repair_count(), 1);
    assert_eq!(facade.region().state(), RegionState::Active);
}

#[test]
fn test_lost_residency_is_reasserted() {
    let cache = local_cache();
    let facade = facade_over(cache.clone(), "orders", None);

    assert!(cache.clear_residency(facade.region().anchor_key()));
    facade.contains_key("a", Capabilities::empty()).unwrap();
    assert_anchor_valid(&cache, &facade);
    assert_eq!(facade.region().repair_count(), 1);
}

#[test]
fn test_repair_is_mutually_exclusive() {
    init_tracing();
    const THREADS: usize = 16;

    let cache = local_cache();
    let facade = facade_over(cache.clone(), "orders", Some("app"));
    facade.put("a", json!("value")).unwrap();
    cache.drop_entry(facade.region().anchor_key());

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let facade = facade.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                facade.get("a")
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), Some(json!("value")));
    }
    assert_eq!(facade.region().repair_count(), 1);
    assert_anchor_valid(&cache, &facade);
}

#[test]
fn test_repair_failure_surfaces_to_caller() {
    let (inner, faulty) = faulty_cache();
    let facade = facade_over(faulty.clone(), "orders", None);
    inner.drop_entry(facade.region().anchor_key());

    faulty.fail(
        FaultPoint::Put,
        EngineError::Rejected {
            reason: "read only".to_string(),
        },
    );
    let err = facade.get("a").unwrap_err();
    assert!(matches!(
        err,
        KeelError::RegionAdmin(RegionAdminError::RepairFailed { .. })
    ));

    faulty.heal_all();
    assert_eq!(facade.get("a").unwrap(), None);
    assert_eq!(facade.region().repair_count(), 1);
}

// ============================================================================
// ACTIVATION
// ============================================================================

#[test]
fn test_activation_fails_on_unreachable_engine() {
    let (_inner, faulty) = faulty_cache();
    faulty.fail(
        FaultPoint::Metadata,
        EngineError::Unreachable {
            reason: "no coordinator".to_string(),
        },
    );

    let lifecycle = lifecycle_over(faulty);
    let err = lifecycle.activate("orders", None).unwrap_err();
    assert!(err.is_unavailable());
}

#[test]
fn test_activation_reuses_existing_anchor() {
    let cache = Arc::new(
        InMemoryClusteredCache::builder()
            .concurrency(ConcurrencyStrategy::Optimistic)
            .build(),
    );
    let first = facade_over(cache.clone(), "orders", Some("app"));
    first.put("a", json!(1)).unwrap();

    let second = facade_over(cache.clone(), "orders", Some("app"));
    assert_eq!(second.region().root(), first.region().root());
    assert_eq!(second.get("a").unwrap(), Some(json!(1)));
    assert_anchor_valid(&cache, &second);
}

// ============================================================================
// DESTROY
// ============================================================================

#[test]
fn test_destroy_is_fail_silent_and_idempotent() {
    init_tracing();
    let (_inner, faulty) = faulty_cache();
    let lifecycle = lifecycle_over(faulty.clone());
    let region = lifecycle.activate("orders", Some("app")).unwrap();

    let down = EngineError::Unreachable {
        reason: "partitioned".to_string(),
    };
    faulty.fail(FaultPoint::Remove, down.clone());
    faulty.fail(FaultPoint::ClearRegion, down);

    lifecycle.destroy(&region);
    assert_eq!(region.state(), RegionState::Destroyed);
    assert_eq!(faulty.calls(FaultPoint::Remove), 1);

    lifecycle.destroy(&region);
    assert_eq!(faulty.calls(FaultPoint::Remove), 1);
    assert_eq!(faulty.calls(FaultPoint::ClearRegion), 1);
}

#[test]
fn test_operations_after_destroy_are_rejected() {
    let cache = local_cache();
    let facade = facade_over(cache.clone(), "orders", None);
    facade.put("a", json!(1)).unwrap();

    let lifecycle = lifecycle_over(cache.clone());
    lifecycle.destroy(facade.region());

    assert_eq!(cache.entry_count(), 0);
    assert!(matches!(
        facade.get("a").unwrap_err(),
        KeelError::RegionAdmin(RegionAdminError::Destroyed { .. })
    ));
    assert!(facade.put("a", json!(2)).is_err());
}

#[test]
fn test_destroy_during_repair_leaves_no_anchor() {
    init_tracing();
    let cache = Arc::new(
        InMemoryClusteredCache::builder()
            .lock_acquisition_timeout(Duration::from_secs(5))
            .build(),
    );
    let lifecycle = lifecycle_over(cache.clone());
    let region = lifecycle.activate("orders", Some("app")).unwrap();
    let facade = CacheOperationFacade::new(Arc::clone(&region), Arc::clone(&lifecycle));

    // The repair will block writing the anchor until the entry lock is free.
    cache.drop_entry(region.anchor_key());
    let anchor_lock = cache.lock_entry(region.anchor_key());

    let reader = thread::spawn(move || facade.get("a"));
    wait_until(|| region.state() == RegionState::Stale);
    thread::sleep(Duration::from_millis(50));

    let destroyer = {
        let lifecycle = Arc::clone(&lifecycle);
        let region = Arc::clone(&region);
        thread::spawn(move || lifecycle.destroy(&region))
    };
    wait_until(|| region.is_destroyed());
    drop(anchor_lock);

    assert!(matches!(
        reader.join().unwrap().unwrap_err(),
        KeelError::RegionAdmin(RegionAdminError::Destroyed { .. })
    ));
    destroyer.join().unwrap();

    assert_eq!(region.state(), RegionState::Destroyed);
    assert_eq!(cache.metadata(region.anchor_key()).unwrap(), None);
}

fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

// ============================================================================
// PROPERTIES
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    DropAnchor,
    ClearResidency,
    Put(u8),
    Get(u8),
    Remove(u8),
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::DropAnchor),
        Just(Step::ClearResidency),
        any::<u8>().prop_map(Step::Put),
        any::<u8>().prop_map(Step::Get),
        any::<u8>().prop_map(Step::Remove),
    ]
}

mod prop_tests {
    use super::*;
    use keel_test_utils::generators::arb_concurrency;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Whatever happened to the anchor, the next data operation finds it
        /// valid again and still sees the data entries.
        #[test]
        fn prop_anchor_valid_after_every_operation(
            concurrency in arb_concurrency(),
            steps in prop::collection::vec(arb_step(), 1..40),
        ) {
            let cache = Arc::new(
                InMemoryClusteredCache::builder().concurrency(concurrency).build(),
            );
            let facade = facade_over(cache.clone(), "com.acme.Order", Some("app"));
            let anchor = facade.region().anchor_key().clone();
            let mut model = std::collections::HashMap::new();

            for step in steps {
                match step {
                    Step::DropAnchor => { cache.drop_entry(&anchor); }
                    Step::ClearResidency => { cache.clear_residency(&anchor); }
                    Step::Put(k) => {
                        facade.put(&k.to_string(), json!(k)).unwrap();
                        model.insert(k, json!(k));
                        assert_anchor_valid(&cache, &facade);
                    }
                    Step::Get(k) => {
                        let got = facade.get(&k.to_string()).unwrap();
                        prop_assert_eq!(got.as_ref(), model.get(&k));
                        assert_anchor_valid(&cache, &facade);
                    }
                    Step::Remove(k) => {
                        facade.remove(&k.to_string()).unwrap();
                        model.remove(&k);
                        assert_anchor_valid(&cache, &facade);
                    }
                }
            }
        }
    }
}
