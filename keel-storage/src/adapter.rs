//! Engine-neutral view of a clustered cache handle.
//!
//! [`CacheAdapter`] is the only place [`EngineError`]s are seen; everything
//! above it deals in [`KeelError`].
//!
//! # Error Translation
//!
//! ```text
//! EngineError::Unreachable  -> KeelError::CacheUnavailable
//! EngineError::LockTimeout  -> CacheOperationError::LockTimeout
//! EngineError::Rejected     -> CacheOperationError::Failed
//! ```

use crate::engine::{CacheListener, CacheValue, ClusteredCache, EntryMetadata, ListenerId};
use crate::topology::ClusterTopologyInspector;
use keel_core::{
    CacheOperationError, CacheTopology, Capabilities, ClusterAddress, ClusterMembership,
    ConcurrencyStrategy, DataVersion, EngineError, EntryKey, KeelError, KeelResult, RegionId,
    TypeOverrides,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Translate an engine failure into the keel taxonomy.
///
/// `region` names where the failure happened (a region id, or the engine
/// name for engine-wide queries).
pub fn translate_engine_error(
    error: EngineError,
    region: &str,
    operation: &'static str,
    key: Option<&EntryKey>,
) -> KeelError {
    match error {
        EngineError::Unreachable { reason } => KeelError::CacheUnavailable { reason },
        EngineError::LockTimeout { key: engine_key, .. } => {
            let key = key
                .and_then(|k| k.data_key().map(str::to_string))
                .unwrap_or(engine_key);
            CacheOperationError::LockTimeout {
                region: region.to_string(),
                operation,
                key,
            }
            .into()
        }
        EngineError::Rejected { reason } => CacheOperationError::Failed {
            region: region.to_string(),
            operation,
            reason,
        }
        .into(),
    }
}

/// Uniform handle over a concrete clustered cache.
///
/// Adapters are cheap to clone. [`CacheAdapter::with_capabilities`] returns
/// a new view whose capabilities apply to every call made through it; the
/// original view is unchanged.
#[derive(Clone)]
pub struct CacheAdapter {
    cache: Arc<dyn ClusteredCache>,
    inspector: Arc<ClusterTopologyInspector>,
    capabilities: Capabilities,
}

impl CacheAdapter {
    pub fn new(cache: Arc<dyn ClusteredCache>) -> Self {
        let inspector = Arc::new(ClusterTopologyInspector::new(Arc::clone(&cache)));
        Self {
            cache,
            inspector,
            capabilities: Capabilities::empty(),
        }
    }

    /// A view of the same cache with `capabilities` added to every call.
    pub fn with_capabilities(&self, capabilities: Capabilities) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            inspector: Arc::clone(&self.inspector),
            capabilities: self.capabilities | capabilities,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn cache_name(&self) -> &str {
        self.cache.name()
    }

    pub fn inspector(&self) -> &ClusterTopologyInspector {
        &self.inspector
    }

    fn flags(&self, per_call: Capabilities) -> Capabilities {
        self.capabilities | per_call
    }

    fn fail<'k>(
        key: &'k EntryKey,
        operation: &'static str,
    ) -> impl FnOnce(EngineError) -> KeelError + 'k {
        move |e| translate_engine_error(e, key.region().as_str(), operation, Some(key))
    }

    fn fail_region<'r>(
        region: &'r RegionId,
        operation: &'static str,
    ) -> impl FnOnce(EngineError) -> KeelError + 'r {
        move |e| translate_engine_error(e, region.as_str(), operation, None)
    }

    // ------------------------------------------------------------------------
    // Entry operations
    // ------------------------------------------------------------------------

    pub fn get(
        &self,
        key: &EntryKey,
        capabilities: Capabilities,
    ) -> KeelResult<Option<CacheValue>> {
        self.cache
            .get(key, self.flags(capabilities))
            .map_err(Self::fail(key, "get"))
    }

    pub fn put(
        &self,
        key: &EntryKey,
        value: CacheValue,
        capabilities: Capabilities,
    ) -> KeelResult<Option<CacheValue>> {
        self.cache
            .put(key, value, self.flags(capabilities))
            .map_err(Self::fail(key, "put"))
    }

    pub fn put_for_external_read(
        &self,
        key: &EntryKey,
        value: CacheValue,
        capabilities: Capabilities,
    ) -> KeelResult<()> {
        self.cache
            .put_for_external_read(key, value, self.flags(capabilities))
            .map_err(Self::fail(key, "put_for_external_read"))
    }

    pub fn remove(
        &self,
        key: &EntryKey,
        capabilities: Capabilities,
    ) -> KeelResult<Option<CacheValue>> {
        self.cache
            .remove(key, self.flags(capabilities))
            .map_err(Self::fail(key, "remove"))
    }

    pub fn evict(&self, key: &EntryKey) -> KeelResult<bool> {
        self.cache.evict(key).map_err(Self::fail(key, "evict"))
    }

    pub fn contains_key(&self, key: &EntryKey, capabilities: Capabilities) -> KeelResult<bool> {
        self.cache
            .contains_key(key, self.flags(capabilities))
            .map_err(Self::fail(key, "contains_key"))
    }

    // ------------------------------------------------------------------------
    // Region-wide operations
    // ------------------------------------------------------------------------

    pub fn clear(&self, region: &RegionId, capabilities: Capabilities) -> KeelResult<()> {
        self.cache
            .clear_region(region, self.flags(capabilities))
            .map_err(Self::fail_region(region, "clear"))
    }

    /// Data keys of a region, without the anchor.
    pub fn key_set(&self, region: &RegionId) -> KeelResult<BTreeSet<String>> {
        let keys = self
            .cache
            .keys(region)
            .map_err(Self::fail_region(region, "key_set"))?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.data_key().map(str::to_string))
            .collect())
    }

    pub fn size(&self, region: &RegionId) -> KeelResult<usize> {
        self.cache
            .size(region)
            .map_err(Self::fail_region(region, "size"))
    }

    /// Point-in-time copy of a region's data entries.
    ///
    /// Entries removed between listing and reading are skipped.
    pub fn to_map(&self, region: &RegionId) -> KeelResult<BTreeMap<String, CacheValue>> {
        let keys = self
            .cache
            .keys(region)
            .map_err(Self::fail_region(region, "to_map"))?;
        let mut snapshot = BTreeMap::new();
        for key in keys {
            let Some(data_key) = key.data_key() else {
                continue;
            };
            if let Some(value) = self.get(&key, Capabilities::SKIP_LOCKING)? {
                snapshot.insert(data_key.to_string(), value);
            }
        }
        Ok(snapshot)
    }

    pub fn define_region(&self, region: &RegionId, settings: &TypeOverrides) -> KeelResult<()> {
        self.cache
            .define_region(region, settings)
            .map_err(Self::fail_region(region, "define_region"))
    }

    // ------------------------------------------------------------------------
    // Entry metadata
    // ------------------------------------------------------------------------

    pub fn metadata(&self, key: &EntryKey) -> KeelResult<Option<EntryMetadata>> {
        self.cache.metadata(key).map_err(Self::fail(key, "metadata"))
    }

    pub fn set_resident(&self, key: &EntryKey, resident: bool) -> KeelResult<()> {
        self.cache
            .set_resident(key, resident)
            .map_err(Self::fail(key, "set_resident"))
    }

    pub fn set_data_version(&self, key: &EntryKey, version: DataVersion) -> KeelResult<()> {
        self.cache
            .set_data_version(key, version)
            .map_err(Self::fail(key, "set_data_version"))
    }

    pub fn set_lock_acquisition_timeout(&self, timeout: Duration) -> KeelResult<()> {
        self.cache
            .set_lock_acquisition_timeout(timeout)
            .map_err(|e| {
                translate_engine_error(e, self.cache.name(), "set_lock_acquisition_timeout", None)
            })
    }

    // ------------------------------------------------------------------------
    // Topology and listeners
    // ------------------------------------------------------------------------

    pub fn topology(&self) -> KeelResult<CacheTopology> {
        self.inspector.topology()
    }

    pub fn local_address(&self) -> KeelResult<Option<ClusterAddress>> {
        self.inspector.local_address()
    }

    pub fn members(&self) -> KeelResult<ClusterMembership> {
        self.inspector.members()
    }

    pub fn concurrency(&self) -> ConcurrencyStrategy {
        self.cache.concurrency()
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) -> ListenerId {
        self.cache.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.cache.remove_listener(id)
    }
}
