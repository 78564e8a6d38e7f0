//! Capability interface to the underlying clustered cache engine.
//!
//! This is the narrow surface keel consumes. Anything that can store entries
//! under [`EntryKey`]s, honour per-call [`Capabilities`], pin entries against
//! eviction and report its cluster topology can back a region.
//!
//! # Implementation Requirements
//!
//! - Implementations must be safe for concurrent use from many threads
//! - `CACHE_MODE_LOCAL` must keep the effect on the local member
//! - `FAIL_SILENTLY` must turn engine failures into a no-op result
//! - `ZERO_LOCK_ACQUISITION_TIMEOUT` must fail fast with
//!   [`EngineError::LockTimeout`] instead of waiting for a held lock
//! - Residency is a local flag; it is not expected to survive replication

use keel_core::{
    Capabilities, CacheTopology, ClusterAddress, ClusterMembership, ConcurrencyStrategy,
    DataVersion, EngineError, EntryKey, RegionId, TypeOverrides,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Values are opaque to keel; they are carried as JSON documents.
pub type CacheValue = serde_json::Value;

/// Per-entry bookkeeping the engine keeps next to the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Exempt from eviction on this member.
    pub resident: bool,
    pub version: DataVersion,
}

// ============================================================================
// CHANGE NOTIFICATION
// ============================================================================

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheEventKind {
    Created,
    Modified,
    Removed,
    Evicted,
}

/// A change notification delivered to registered listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    pub key: EntryKey,
    /// The change originated on this member.
    pub origin_local: bool,
}

/// Receives change notifications from the engine.
pub trait CacheListener: Send + Sync {
    fn on_event(&self, event: &CacheEvent);
}

/// Handle returned by [`ClusteredCache::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

// ============================================================================
// ENGINE TRAIT
// ============================================================================

/// The clustered key-value engine keel is layered on.
pub trait ClusteredCache: Send + Sync {
    /// Name of the engine's cache configuration.
    fn name(&self) -> &str;

    fn get(&self, key: &EntryKey, flags: Capabilities) -> Result<Option<CacheValue>, EngineError>;

    /// Store `value`, returning the previous value.
    fn put(
        &self,
        key: &EntryKey,
        value: CacheValue,
        flags: Capabilities,
    ) -> Result<Option<CacheValue>, EngineError>;

    /// Store `value` only if the key is absent. Used to populate the cache as
    /// a side effect of reading from the source of truth.
    fn put_for_external_read(
        &self,
        key: &EntryKey,
        value: CacheValue,
        flags: Capabilities,
    ) -> Result<(), EngineError>;

    fn remove(&self, key: &EntryKey, flags: Capabilities)
        -> Result<Option<CacheValue>, EngineError>;

    /// Advisory local eviction. Returns false if nothing was evicted.
    fn evict(&self, key: &EntryKey) -> Result<bool, EngineError>;

    /// Remove every data entry of a region. The anchor is left alone.
    fn clear_region(&self, region: &RegionId, flags: Capabilities) -> Result<(), EngineError>;

    /// Data keys currently stored in a region.
    fn keys(&self, region: &RegionId) -> Result<Vec<EntryKey>, EngineError>;

    fn size(&self, region: &RegionId) -> Result<usize, EngineError> {
        self.keys(region).map(|keys| keys.len())
    }

    fn contains_key(&self, key: &EntryKey, flags: Capabilities) -> Result<bool, EngineError>;

    /// Metadata of a stored entry, `None` if absent.
    fn metadata(&self, key: &EntryKey) -> Result<Option<EntryMetadata>, EngineError>;

    fn set_resident(&self, key: &EntryKey, resident: bool) -> Result<(), EngineError>;

    /// Replace an entry's version. Fails with [`EngineError::Rejected`] when
    /// `version` conflicts with the stored one.
    fn set_data_version(&self, key: &EntryKey, version: DataVersion) -> Result<(), EngineError>;

    /// Bound every later wait for an entry lock by `timeout`.
    ///
    /// Engines that configure locking out of band can ignore this.
    fn set_lock_acquisition_timeout(&self, _timeout: Duration) -> Result<(), EngineError> {
        Ok(())
    }

    /// Apply resolved region settings (eviction, expiration) to a region.
    ///
    /// Engines that configure regions out of band can ignore this.
    fn define_region(
        &self,
        _region: &RegionId,
        _settings: &TypeOverrides,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    fn topology(&self) -> Result<CacheTopology, EngineError>;

    fn concurrency(&self) -> ConcurrencyStrategy;

    /// This member's address, `None` when not clustered.
    fn local_address(&self) -> Result<Option<ClusterAddress>, EngineError>;

    /// Current cluster view.
    fn members(&self) -> Result<ClusterMembership, EngineError>;

    fn add_listener(&self, listener: Arc<dyn CacheListener>) -> ListenerId;

    /// Returns false if the listener was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;
}
