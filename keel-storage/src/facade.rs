//! Data-entry operations on a region.
//!
//! Two failure policies are offered side by side. The plain operations
//! propagate every failure, lock timeouts included. The `*_allowing_timeout`
//! variants and [`CacheOperationFacade::put_for_external_read`] turn a lock
//! timeout into a miss, because a contended second-level cache should send the
//! caller to the source of truth rather than fail it.
//!
//! Every operation checks the region's anchor first and repairs it if needed.

use crate::adapter::CacheAdapter;
use crate::engine::CacheValue;
use crate::region::{Region, RegionLifecycleManager};
use keel_core::{Capabilities, KeelResult};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Uniform get/put/remove surface over one region's data entries.
///
/// Cloning is cheap. [`CacheOperationFacade::with_capabilities`] gives a view
/// whose capabilities apply to its own calls only.
#[derive(Clone)]
pub struct CacheOperationFacade {
    region: Arc<Region>,
    lifecycle: Arc<RegionLifecycleManager>,
    adapter: CacheAdapter,
}

impl CacheOperationFacade {
    pub fn new(region: Arc<Region>, lifecycle: Arc<RegionLifecycleManager>) -> Self {
        let adapter = lifecycle.adapter().clone();
        Self {
            region,
            lifecycle,
            adapter,
        }
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub fn capabilities(&self) -> Capabilities {
        self.adapter.capabilities()
    }

    /// A view of this facade applying `capabilities` to every call made
    /// through it. The original facade is unaffected.
    pub fn with_capabilities(&self, capabilities: Capabilities) -> Self {
        Self {
            region: Arc::clone(&self.region),
            lifecycle: Arc::clone(&self.lifecycle),
            adapter: self.adapter.with_capabilities(capabilities),
        }
    }

    fn ensure_valid(&self) -> KeelResult<()> {
        self.lifecycle.ensure_valid(&self.region)
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub fn get(&self, key: &str) -> KeelResult<Option<CacheValue>> {
        self.ensure_valid()?;
        self.adapter
            .get(&self.region.data_key(key), Capabilities::empty())
    }

    /// Like [`get`](Self::get), but a lock timeout reads as a miss.
    pub fn get_allowing_timeout(&self, key: &str) -> KeelResult<Option<CacheValue>> {
        match self.get(key) {
            Err(e) if e.is_lock_timeout() => {
                tracing::trace!(
                    region = %self.region.root(),
                    key,
                    "Read timed out, treating as miss"
                );
                Ok(None)
            }
            other => other,
        }
    }

    pub fn contains_key(&self, key: &str, capabilities: Capabilities) -> KeelResult<bool> {
        self.ensure_valid()?;
        self.adapter
            .contains_key(&self.region.data_key(key), capabilities)
    }

    pub fn key_set(&self) -> KeelResult<BTreeSet<String>> {
        self.ensure_valid()?;
        self.adapter.key_set(self.region.root())
    }

    pub fn size(&self) -> KeelResult<usize> {
        self.ensure_valid()?;
        self.adapter.size(self.region.root())
    }

    /// Point-in-time copy of the region's data entries.
    pub fn to_map(&self) -> KeelResult<BTreeMap<String, CacheValue>> {
        self.ensure_valid()?;
        self.adapter.to_map(self.region.root())
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Store a value, returning the previous one. Every failure propagates.
    pub fn put(&self, key: &str, value: CacheValue) -> KeelResult<Option<CacheValue>> {
        self.put_with(key, value, Capabilities::empty())
    }

    /// Store a value with extra per-call capabilities.
    pub fn put_with(
        &self,
        key: &str,
        value: CacheValue,
        capabilities: Capabilities,
    ) -> KeelResult<Option<CacheValue>> {
        self.ensure_valid()?;
        self.adapter
            .put(&self.region.data_key(key), value, capabilities)
    }

    /// Opportunistic write: a lock timeout drops the write and returns `None`.
    pub fn put_allowing_timeout(
        &self,
        key: &str,
        value: CacheValue,
        capabilities: Capabilities,
    ) -> KeelResult<Option<CacheValue>> {
        match self.put_with(key, value, capabilities) {
            Err(e) if e.is_lock_timeout() => {
                tracing::trace!(
                    region = %self.region.root(),
                    key,
                    "Write timed out, dropping it"
                );
                Ok(None)
            }
            other => other,
        }
    }

    /// Populate the cache after reading from the source of truth.
    ///
    /// Never waits for a held lock. Returns false if the lock was held.
    pub fn put_for_external_read(&self, key: &str, value: CacheValue) -> KeelResult<bool> {
        self.ensure_valid()?;
        let result = self.adapter.put_for_external_read(
            &self.region.data_key(key),
            value,
            Capabilities::external_read(),
        );
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_lock_timeout() => {
                tracing::debug!(
                    region = %self.region.root(),
                    key,
                    "Lock held, skipping put for external read"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn remove(&self, key: &str) -> KeelResult<Option<CacheValue>> {
        self.ensure_valid()?;
        self.adapter
            .remove(&self.region.data_key(key), Capabilities::empty())
    }

    /// Ask the engine to drop its local copy. Nothing evicted is not an error.
    pub fn evict(&self, key: &str) -> KeelResult<()> {
        self.ensure_valid()?;
        let evicted = self.adapter.evict(&self.region.data_key(key))?;
        if !evicted {
            tracing::trace!(region = %self.region.root(), key, "Nothing to evict");
        }
        Ok(())
    }

    /// Remove every data entry of the region. The anchor stays.
    pub fn clear(&self) -> KeelResult<()> {
        self.ensure_valid()?;
        self.adapter
            .clear(self.region.root(), Capabilities::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryClusteredCache;
    use crate::tx_guard::TransactionScopeGuard;
    use keel_core::{CacheOperationError, KeelError};
    use serde_json::json;
    use std::thread;
    use std::time::Duration;

    fn facade() -> (Arc<InMemoryClusteredCache>, CacheOperationFacade) {
        let cache = Arc::new(
            InMemoryClusteredCache::builder()
                .lock_acquisition_timeout(Duration::from_millis(20))
                .build(),
        );
        let lifecycle = Arc::new(RegionLifecycleManager::new(
            CacheAdapter::new(cache.clone()),
            TransactionScopeGuard::without_transactions(),
        ));
        let region = lifecycle.activate("orders", Some("app")).unwrap();
        (cache, CacheOperationFacade::new(region, lifecycle))
    }

    #[test]
    fn test_put_get_remove() {
        let (_cache, facade) = facade();
        assert_eq!(facade.put("a", json!(1)).unwrap(), None);
        assert_eq!(facade.get("a").unwrap(), Some(json!(1)));
        assert_eq!(facade.remove("a").unwrap(), Some(json!(1)));
        assert_eq!(facade.get("a").unwrap(), None);
    }

    #[test]
    fn test_timeout_policies_with_held_lock() {
        let (cache, facade) = facade();
        facade.put("a", json!(1)).unwrap();
        let key = facade.region().data_key("a");
        let _held = cache.lock_entry(&key);

        let f = facade.clone();
        let (strict, lenient, strict_put, lenient_put, pfer) = thread::spawn(move || {
            (
                f.get("a"),
                f.get_allowing_timeout("a"),
                f.put("a", json!(2)),
                f.put_allowing_timeout("a", json!(2), Capabilities::empty()),
                f.put_for_external_read("a", json!(2)),
            )
        })
        .join()
        .unwrap();

        assert!(matches!(
            strict,
            Err(KeelError::Operation(CacheOperationError::LockTimeout { operation: "get", .. }))
        ));
        assert_eq!(lenient.unwrap(), None);
        assert!(strict_put.unwrap_err().is_lock_timeout());
        assert_eq!(lenient_put.unwrap(), None);
        assert!(!pfer.unwrap());
    }

    #[test]
    fn test_put_for_external_read_populates_once() {
        let (_cache, facade) = facade();
        assert!(facade.put_for_external_read("a", json!("db")).unwrap());
        assert!(facade.put_for_external_read("a", json!("later")).unwrap());
        assert_eq!(facade.get("a").unwrap(), Some(json!("db")));
    }

    #[test]
    fn test_clear_and_views() {
        let (_cache, facade) = facade();
        facade.put("a", json!(1)).unwrap();
        facade.put("b", json!(2)).unwrap();
        assert_eq!(facade.size().unwrap(), 2);
        assert_eq!(facade.to_map().unwrap().len(), 2);
        assert!(facade.contains_key("a", Capabilities::empty()).unwrap());

        facade.clear().unwrap();
        assert!(facade.key_set().unwrap().is_empty());
        assert_eq!(facade.region().repair_count(), 0);
    }

    #[test]
    fn test_evict_is_advisory() {
        let (_cache, facade) = facade();
        facade.evict("missing").unwrap();
        facade.put("a", json!(1)).unwrap();
        facade.evict("a").unwrap();
        assert_eq!(facade.get("a").unwrap(), None);
    }

    #[test]
    fn test_with_capabilities_does_not_leak() {
        let (_cache, facade) = facade();
        let local = facade.with_capabilities(Capabilities::CACHE_MODE_LOCAL);
        assert!(local.capabilities().is_local());
        assert!(facade.capabilities().is_empty());
        local.put("a", json!(1)).unwrap();
        assert_eq!(facade.get("a").unwrap(), Some(json!(1)));
    }

    #[test]
    fn test_unavailable_engine_propagates() {
        let (cache, facade) = facade();
        cache.set_reachable(false);
        assert!(facade.get("a").unwrap_err().is_unavailable());
        assert!(facade.get_allowing_timeout("a").unwrap_err().is_unavailable());
    }
}
