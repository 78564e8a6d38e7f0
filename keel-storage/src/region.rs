//! Region handles and anchor lifecycle.
//!
//! Every region is rooted at an anchor entry in the engine. The anchor is
//! pinned against eviction and, under optimistic concurrency, carries a
//! non-locking data version so region administration never conflicts with
//! application transactions. A region whose anchor has gone missing is
//! unusable until the anchor is re-established.
//!
//! # State Machine
//!
//! ```text
//! Uninitialized --activate--> Active --anchor lost--> Stale --repair--> Active
//!                               |                       |
//!                               +-------destroy---------+--> Destroyed
//! ```

use crate::adapter::CacheAdapter;
use crate::tx_guard::TransactionScopeGuard;
use keel_core::{
    Capabilities, ConcurrencyStrategy, DataVersion, EntryKey, KeelError, KeelResult,
    RegionAdminError, RegionId, RegionNameCodec,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

// ============================================================================
// REGION
// ============================================================================

/// Lifecycle state of a [`Region`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RegionState {
    Uninitialized = 0,
    Active = 1,
    Stale = 2,
    Destroyed = 3,
}

impl RegionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RegionState::Active,
            2 => RegionState::Stale,
            3 => RegionState::Destroyed,
            _ => RegionState::Uninitialized,
        }
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegionState::Uninitialized => "uninitialized",
            RegionState::Active => "active",
            RegionState::Stale => "stale",
            RegionState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// A named logical partition of the shared cache.
///
/// One `Region` exists per logical region name per process; it is shared as
/// `Arc<Region>` between the facade and whoever built it.
pub struct Region {
    name: String,
    prefix: Option<String>,
    root: RegionId,
    anchor: EntryKey,
    concurrency: ConcurrencyStrategy,
    state: AtomicU8,
    repair_lock: Mutex<()>,
    repairs: AtomicU64,
}

impl Region {
    fn new(name: &str, prefix: Option<&str>, concurrency: ConcurrencyStrategy) -> Self {
        let root = RegionNameCodec::qualify(name, prefix);
        Self {
            name: name.to_string(),
            prefix: prefix.map(str::to_string),
            anchor: EntryKey::anchor(&root),
            root,
            concurrency,
            state: AtomicU8::new(RegionState::Uninitialized as u8),
            repair_lock: Mutex::new(()),
            repairs: AtomicU64::new(0),
        }
    }

    /// Logical name the region was activated with.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Qualified root id in the engine.
    pub fn root(&self) -> &RegionId {
        &self.root
    }

    pub fn anchor_key(&self) -> &EntryKey {
        &self.anchor
    }

    /// Key of an application entry in this region.
    pub fn data_key(&self, key: &str) -> EntryKey {
        EntryKey::data(&self.root, key)
    }

    pub fn concurrency(&self) -> ConcurrencyStrategy {
        self.concurrency
    }

    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == RegionState::Destroyed
    }

    /// Number of lazy anchor repairs performed on this region.
    pub fn repair_count(&self) -> u64 {
        self.repairs.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: RegionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move to `to` unless the region has been destroyed.
    fn transition(&self, to: RegionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != RegionState::Destroyed as u8).then_some(to as u8)
            })
            .is_ok()
    }

    fn destroyed_error(&self) -> KeelError {
        RegionAdminError::Destroyed {
            region: self.root.to_string(),
        }
        .into()
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("concurrency", &self.concurrency)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// LIFECYCLE MANAGER
// ============================================================================

/// Creates, validates, repairs and destroys region anchors.
pub struct RegionLifecycleManager {
    adapter: CacheAdapter,
    guard: TransactionScopeGuard,
}

impl RegionLifecycleManager {
    pub fn new(adapter: CacheAdapter, guard: TransactionScopeGuard) -> Self {
        Self { adapter, guard }
    }

    pub fn adapter(&self) -> &CacheAdapter {
        &self.adapter
    }

    /// Activate a region, creating or correcting its anchor.
    ///
    /// Runs with the ambient transaction suspended. Fails if the anchor
    /// cannot be established; the region is unusable without it.
    pub fn activate(&self, name: &str, prefix: Option<&str>) -> KeelResult<Arc<Region>> {
        let region = Region::new(name, prefix, self.adapter.concurrency());

        self.guard
            .run_suspended(|| self.establish_anchor(&region))
            .map_err(|e| {
                admin_failure(e, |reason| RegionAdminError::ActivationFailed {
                    region: region.root.to_string(),
                    reason,
                })
            })?;

        region.set_state(RegionState::Active);
        tracing::debug!(
            region = %region.root,
            concurrency = ?region.concurrency,
            "Activated cache region"
        );
        Ok(Arc::new(region))
    }

    /// Check the anchor and repair it if it has gone missing.
    ///
    /// The fast path is one metadata read. Concurrent callers that find the
    /// anchor invalid serialize on the region's repair lock; only the first
    /// one repairs and the rest observe its result.
    pub fn ensure_valid(&self, region: &Region) -> KeelResult<()> {
        if region.is_destroyed() {
            return Err(region.destroyed_error());
        }
        if self.anchor_is_valid(region)? {
            return Ok(());
        }

        region.transition(RegionState::Stale);
        let _repairing = region.repair_lock.lock();

        if region.is_destroyed() {
            return Err(region.destroyed_error());
        }
        if self.anchor_is_valid(region)? {
            return if region.transition(RegionState::Active) {
                Ok(())
            } else {
                Err(region.destroyed_error())
            };
        }

        self.guard
            .run_suspended(|| self.establish_anchor(region))
            .map_err(|e| {
                admin_failure(e, |reason| RegionAdminError::RepairFailed {
                    region: region.root.to_string(),
                    reason,
                })
            })?;

        region.repairs.fetch_add(1, Ordering::Relaxed);
        // Destroyed mid-repair: destroy is waiting on the repair lock and
        // removes the anchor again once we let go.
        if !region.transition(RegionState::Active) {
            return Err(region.destroyed_error());
        }
        tracing::debug!(region = %region.root, "Re-established region anchor");
        Ok(())
    }

    /// Tear a region down on this member.
    ///
    /// Best effort: failures are logged, never returned. Destroying a
    /// destroyed region does nothing. A repair already running is allowed to
    /// finish first so it cannot re-create the anchor afterwards.
    pub fn destroy(&self, region: &Region) {
        let previous = region.state.swap(RegionState::Destroyed as u8, Ordering::AcqRel);
        if previous == RegionState::Destroyed as u8 {
            return;
        }
        let _repairing = region.repair_lock.lock();

        let result = self.guard.run_suspended(|| {
            let teardown = Capabilities::teardown();
            if let Err(e) = self.adapter.remove(&region.anchor, teardown) {
                tracing::warn!(
                    region = %region.root,
                    error = %e,
                    "Failed to remove region anchor"
                );
            }
            if let Err(e) = self.adapter.clear(&region.root, teardown) {
                tracing::warn!(
                    region = %region.root,
                    error = %e,
                    "Failed to clear region entries"
                );
            }
            Ok(())
        });

        match result {
            Ok(()) => tracing::debug!(region = %region.root, "Destroyed cache region"),
            Err(e) => tracing::warn!(
                region = %region.root,
                error = %e,
                "Region teardown could not run outside the ambient transaction"
            ),
        }
    }

    fn anchor_is_valid(&self, region: &Region) -> KeelResult<bool> {
        let Some(meta) = self.adapter.metadata(&region.anchor)? else {
            return Ok(false);
        };
        let version_ok = !region.concurrency.is_optimistic() || meta.version.is_non_locking();
        Ok(meta.resident && version_ok)
    }

    /// Create the anchor if absent, then pin it and fix its version.
    fn establish_anchor(&self, region: &Region) -> KeelResult<()> {
        let anchor = &region.anchor;

        let existing = self.adapter.metadata(anchor)?;
        if existing.is_none() {
            let marker = serde_json::json!({ "region": region.name });
            self.adapter
                .put(anchor, marker, Capabilities::anchor_maintenance())?;
        }

        let resident = existing.is_some_and(|m| m.resident);
        if !resident {
            self.adapter.set_resident(anchor, true)?;
        }

        if region.concurrency.is_optimistic() {
            match existing {
                Some(meta) if !meta.version.is_non_locking() => {
                    tracing::warn!(
                        region = %region.root,
                        version = %meta.version,
                        "Correcting region anchor data version"
                    );
                    self.adapter.set_data_version(anchor, DataVersion::NonLocking)?;
                }
                Some(_) => {}
                None => self.adapter.set_data_version(anchor, DataVersion::NonLocking)?,
            }
        }
        Ok(())
    }
}

/// Rewrap an administrative failure, keeping `CacheUnavailable` and
/// transaction failures as they are.
fn admin_failure(error: KeelError, wrap: impl FnOnce(String) -> RegionAdminError) -> KeelError {
    match error {
        KeelError::CacheUnavailable { .. } | KeelError::RegionAdmin(_) => error,
        other => wrap(other.to_string()).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ClusteredCache;
    use crate::memory::InMemoryClusteredCache;
    use crate::transaction::{ThreadTransactionManager, TransactionManager};
    use serde_json::json;

    fn setup(
        concurrency: ConcurrencyStrategy,
    ) -> (Arc<InMemoryClusteredCache>, RegionLifecycleManager) {
        let cache = Arc::new(
            InMemoryClusteredCache::builder()
                .concurrency(concurrency)
                .build(),
        );
        let manager = RegionLifecycleManager::new(
            CacheAdapter::new(cache.clone()),
            TransactionScopeGuard::without_transactions(),
        );
        (cache, manager)
    }

    #[test]
    fn test_activate_creates_resident_anchor() {
        let (cache, manager) = setup(ConcurrencyStrategy::Pessimistic);
        let region = manager.activate("orders", Some("app")).unwrap();

        assert_eq!(region.root().as_str(), "app/orders");
        assert_eq!(region.state(), RegionState::Active);
        let meta = cache.metadata(region.anchor_key()).unwrap().unwrap();
        assert!(meta.resident);
        assert!(!meta.version.is_non_locking());
    }

    #[test]
    fn test_activate_optimistic_uses_non_locking_version() {
        let (cache, manager) = setup(ConcurrencyStrategy::Optimistic);
        let region = manager.activate("orders", Some("app")).unwrap();
        let meta = cache.metadata(region.anchor_key()).unwrap().unwrap();
        assert!(meta.resident);
        assert_eq!(meta.version, DataVersion::NonLocking);
    }

    #[test]
    fn test_activate_corrects_wrong_version() {
        let (cache, manager) = setup(ConcurrencyStrategy::Optimistic);
        let anchor = EntryKey::anchor(&RegionId::from_path("app/orders"));
        cache.put(&anchor, json!(null), Capabilities::empty()).unwrap();
        cache.set_resident(&anchor, true).unwrap();

        manager.activate("orders", Some("app")).unwrap();
        assert_eq!(
            cache.metadata(&anchor).unwrap().unwrap().version,
            DataVersion::NonLocking
        );
    }

    #[test]
    fn test_ensure_valid_repairs_dropped_anchor() {
        let (cache, manager) = setup(ConcurrencyStrategy::Pessimistic);
        let region = manager.activate("orders", None).unwrap();

        manager.ensure_valid(&region).unwrap();
        assert_eq!(region.repair_count(), 0);

        cache.drop_entry(region.anchor_key());
        manager.ensure_valid(&region).unwrap();
        assert_eq!(region.repair_count(), 1);
        assert_eq!(region.state(), RegionState::Active);
        assert!(cache.metadata(region.anchor_key()).unwrap().unwrap().resident);
    }

    #[test]
    fn test_ensure_valid_reasserts_residency() {
        let (cache, manager) = setup(ConcurrencyStrategy::Pessimistic);
        let region = manager.activate("orders", None).unwrap();

        cache.clear_residency(region.anchor_key());
        manager.ensure_valid(&region).unwrap();
        assert!(cache.metadata(region.anchor_key()).unwrap().unwrap().resident);
        assert_eq!(region.repair_count(), 1);
    }

    #[test]
    fn test_activate_fails_when_unavailable() {
        let (cache, manager) = setup(ConcurrencyStrategy::Pessimistic);
        cache.set_reachable(false);
        let err = manager.activate("orders", None).unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (cache, manager) = setup(ConcurrencyStrategy::Pessimistic);
        let region = manager.activate("orders", None).unwrap();
        cache
            .put(&region.data_key("a"), json!(1), Capabilities::empty())
            .unwrap();

        manager.destroy(&region);
        assert!(region.is_destroyed());
        assert_eq!(cache.entry_count(), 0);

        manager.destroy(&region);
        assert!(region.is_destroyed());
        assert!(matches!(
            manager.ensure_valid(&region),
            Err(KeelError::RegionAdmin(RegionAdminError::Destroyed { .. }))
        ));
    }

    #[test]
    fn test_destroy_swallows_engine_failure() {
        let (cache, manager) = setup(ConcurrencyStrategy::Pessimistic);
        let region = manager.activate("orders", None).unwrap();
        cache.set_reachable(false);
        manager.destroy(&region);
        assert!(region.is_destroyed());
    }

    #[test]
    fn test_activation_runs_outside_transaction() {
        let cache = Arc::new(InMemoryClusteredCache::default());
        let tm = Arc::new(ThreadTransactionManager::new());
        let tx = tm.begin().unwrap();
        let manager = RegionLifecycleManager::new(
            CacheAdapter::new(cache),
            TransactionScopeGuard::new(Some(tm.clone() as Arc<dyn TransactionManager>)),
        );

        manager.activate("orders", None).unwrap();
        assert_eq!(tm.current(), Some(tx));
    }
}
