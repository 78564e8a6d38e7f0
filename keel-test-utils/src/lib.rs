//! KEEL Test Utilities
//!
//! Shared test infrastructure for the keel workspace:
//! - Tracing setup for test binaries
//! - Proptest generators for region names and prefixes
//! - Fault-injecting engine and recording transaction manager
//! - Fixtures for common engine and factory setups

pub use keel_core::{
    Capabilities, CacheMode, CacheTopology, ConcurrencyStrategy, DataVersion, EngineError,
    EntryKey, KeelError, KeelResult, Propagation, RegionFactoryConfig, RegionId,
    RegionNameCodec, RegionType, TransactionError,
};
pub use keel_storage::{
    CacheValue, ClusteredCache, InMemoryClusteredCache, RegionFactory, ThreadTransactionManager,
    Transaction, TransactionManager,
};

use keel_core::{ClusterAddress, ClusterMembership, TypeOverrides};
use keel_storage::{CacheListener, EntryMetadata, ListenerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

// ============================================================================
// TRACING
// ============================================================================

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    /// A single name segment without separators.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z0-9_]{0,11}"
    }

    /// Dotted region name such as `com.acme.Order`.
    pub fn arb_region_name() -> impl Strategy<Value = String> {
        prop::collection::vec(arb_segment(), 1..5).prop_map(|segments| segments.join("."))
    }

    /// Optional region prefix, itself possibly dotted.
    pub fn arb_region_prefix() -> impl Strategy<Value = Option<String>> {
        prop::option::of(arb_region_name())
    }

    pub fn arb_region_type() -> impl Strategy<Value = RegionType> {
        prop::sample::select(RegionType::ALL.to_vec())
    }

    pub fn arb_topology() -> impl Strategy<Value = CacheTopology> {
        prop_oneof![
            Just(CacheTopology::local()),
            Just(CacheTopology::new(CacheMode::Replication, Propagation::Sync)),
            Just(CacheTopology::new(CacheMode::Replication, Propagation::Async)),
            Just(CacheTopology::new(CacheMode::Invalidation, Propagation::Sync)),
            Just(CacheTopology::new(CacheMode::Invalidation, Propagation::Async)),
        ]
    }

    pub fn arb_concurrency() -> impl Strategy<Value = ConcurrencyStrategy> {
        prop_oneof![
            Just(ConcurrencyStrategy::Pessimistic),
            Just(ConcurrencyStrategy::Optimistic),
        ]
    }

    /// Small JSON payloads.
    pub fn arb_value() -> impl Strategy<Value = CacheValue> {
        prop_oneof![
            any::<i64>().prop_map(CacheValue::from),
            "[a-z]{0,16}".prop_map(CacheValue::from),
            any::<bool>().prop_map(CacheValue::from),
        ]
    }
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Engine call that a [`FaultyCache`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Get,
    Put,
    PutForExternalRead,
    Remove,
    ClearRegion,
    Metadata,
    SetResident,
}

/// Wraps an engine and fails selected calls with a configured error.
///
/// Faults ignore `FAIL_SILENTLY`: the injected error always reaches the
/// caller, so tests can check that keel itself swallows it where required.
pub struct FaultyCache {
    inner: Arc<dyn ClusteredCache>,
    faults: Mutex<HashMap<FaultPoint, EngineError>>,
    calls: Mutex<HashMap<FaultPoint, u64>>,
}

impl FaultyCache {
    pub fn new(inner: Arc<dyn ClusteredCache>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail every call at `point` with `error` until [`heal`](Self::heal).
    pub fn fail(&self, point: FaultPoint, error: EngineError) {
        self.faults.lock().insert(point, error);
    }

    pub fn fail_with_lock_timeout(&self, point: FaultPoint) {
        self.fail(
            point,
            EngineError::LockTimeout {
                key: "injected".to_string(),
                timeout: Duration::ZERO,
            },
        );
    }

    pub fn heal(&self, point: FaultPoint) {
        self.faults.lock().remove(&point);
    }

    pub fn heal_all(&self) {
        self.faults.lock().clear();
    }

    /// Number of calls made at `point`, failed or not.
    pub fn calls(&self, point: FaultPoint) -> u64 {
        self.calls.lock().get(&point).copied().unwrap_or(0)
    }

    fn check(&self, point: FaultPoint) -> Result<(), EngineError> {
        *self.calls.lock().entry(point).or_default() += 1;
        match self.faults.lock().get(&point) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

impl ClusteredCache for FaultyCache {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get(&self, key: &EntryKey, flags: Capabilities) -> Result<Option<CacheValue>, EngineError> {
        self.check(FaultPoint::Get)?;
        self.inner.get(key, flags)
    }

    fn put(
        &self,
        key: &EntryKey,
        value: CacheValue,
        flags: Capabilities,
    ) -> Result<Option<CacheValue>, EngineError> {
        self.check(FaultPoint::Put)?;
        self.inner.put(key, value, flags)
    }

    fn put_for_external_read(
        &self,
        key: &EntryKey,
        value: CacheValue,
        flags: Capabilities,
    ) -> Result<(), EngineError> {
        self.check(FaultPoint::PutForExternalRead)?;
        self.inner.put_for_external_read(key, value, flags)
    }

    fn remove(
        &self,
        key: &EntryKey,
        flags: Capabilities,
    ) -> Result<Option<CacheValue>, EngineError> {
        self.check(FaultPoint::Remove)?;
        self.inner.remove(key, flags)
    }

    fn evict(&self, key: &EntryKey) -> Result<bool, EngineError> {
        self.inner.evict(key)
    }

    fn clear_region(&self, region: &RegionId, flags: Capabilities) -> Result<(), EngineError> {
        self.check(FaultPoint::ClearRegion)?;
        self.inner.clear_region(region, flags)
    }

    fn keys(&self, region: &RegionId) -> Result<Vec<EntryKey>, EngineError> {
        self.inner.keys(region)
    }

    fn contains_key(&self, key: &EntryKey, flags: Capabilities) -> Result<bool, EngineError> {
        self.inner.contains_key(key, flags)
    }

    fn metadata(&self, key: &EntryKey) -> Result<Option<EntryMetadata>, EngineError> {
        self.check(FaultPoint::Metadata)?;
        self.inner.metadata(key)
    }

    fn set_resident(&self, key: &EntryKey, resident: bool) -> Result<(), EngineError> {
        self.check(FaultPoint::SetResident)?;
        self.inner.set_resident(key, resident)
    }

    fn set_data_version(&self, key: &EntryKey, version: DataVersion) -> Result<(), EngineError> {
        self.inner.set_data_version(key, version)
    }

    fn set_lock_acquisition_timeout(&self, timeout: Duration) -> Result<(), EngineError> {
        self.inner.set_lock_acquisition_timeout(timeout)
    }

    fn define_region(
        &self,
        region: &RegionId,
        settings: &TypeOverrides,
    ) -> Result<(), EngineError> {
        self.inner.define_region(region, settings)
    }

    fn topology(&self) -> Result<CacheTopology, EngineError> {
        self.inner.topology()
    }

    fn concurrency(&self) -> ConcurrencyStrategy {
        self.inner.concurrency()
    }

    fn local_address(&self) -> Result<Option<ClusterAddress>, EngineError> {
        self.inner.local_address()
    }

    fn members(&self) -> Result<ClusterMembership, EngineError> {
        self.inner.members()
    }

    fn add_listener(&self, listener: Arc<dyn CacheListener>) -> ListenerId {
        self.inner.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.remove_listener(id)
    }
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// What a [`RecordingTransactionManager`] saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    Suspended(Option<Transaction>),
    Resumed(Transaction),
}

/// Thread-associated transaction manager that records suspend/resume calls
/// and can be told to fail either of them.
#[derive(Default)]
pub struct RecordingTransactionManager {
    inner: ThreadTransactionManager,
    events: Mutex<Vec<TransactionEvent>>,
    fail_suspend: AtomicBool,
    fail_resume: AtomicBool,
}

impl RecordingTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> Transaction {
        self.inner
            .begin()
            .expect("calling thread already has a transaction")
    }

    pub fn end(&self) -> Option<Transaction> {
        self.inner.end()
    }

    pub fn fail_suspend(&self, fail: bool) {
        self.fail_suspend.store(fail, Ordering::SeqCst);
    }

    pub fn fail_resume(&self, fail: bool) {
        self.fail_resume.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<TransactionEvent> {
        self.events.lock().clone()
    }

    pub fn resume_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, TransactionEvent::Resumed(_)))
            .count()
    }
}

impl TransactionManager for RecordingTransactionManager {
    fn current(&self) -> Option<Transaction> {
        self.inner.current()
    }

    fn suspend(&self) -> Result<Option<Transaction>, TransactionError> {
        if self.fail_suspend.load(Ordering::SeqCst) {
            return Err(TransactionError::SuspendFailed {
                reason: "injected".to_string(),
            });
        }
        let suspended = self.inner.suspend()?;
        self.events.lock().push(TransactionEvent::Suspended(suspended));
        Ok(suspended)
    }

    fn resume(&self, transaction: Transaction) -> Result<(), TransactionError> {
        self.events.lock().push(TransactionEvent::Resumed(transaction));
        if self.fail_resume.load(Ordering::SeqCst) {
            return Err(TransactionError::ResumeFailed {
                transaction: transaction.to_string(),
                reason: "injected".to_string(),
            });
        }
        self.inner.resume(transaction)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;

    /// Local, pessimistic engine with a short lock timeout.
    pub fn local_cache() -> Arc<InMemoryClusteredCache> {
        Arc::new(
            InMemoryClusteredCache::builder()
                .lock_acquisition_timeout(Duration::from_millis(50))
                .build(),
        )
    }

    /// Asynchronously replicated engine with optimistic concurrency.
    pub fn replicated_async_optimistic() -> Arc<InMemoryClusteredCache> {
        Arc::new(
            InMemoryClusteredCache::builder()
                .topology(CacheTopology::new(CacheMode::Replication, Propagation::Async))
                .concurrency(ConcurrencyStrategy::Optimistic)
                .lock_acquisition_timeout(Duration::from_millis(50))
                .build(),
        )
    }

    /// Engine wrapped for fault injection, with the bare engine alongside.
    pub fn faulty_cache() -> (Arc<InMemoryClusteredCache>, Arc<FaultyCache>) {
        let inner = local_cache();
        let faulty = Arc::new(FaultyCache::new(inner.clone()));
        (inner, faulty)
    }

    /// Started factory over `cache` with no transaction manager.
    pub fn started_factory(cache: Arc<dyn ClusteredCache>) -> RegionFactory {
        let factory = RegionFactory::new(cache, None, RegionFactoryConfig::default());
        factory.start().expect("default configuration is valid");
        factory
    }
}
