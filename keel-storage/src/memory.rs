//! In-process reference engine.
//!
//! `InMemoryClusteredCache` implements [`ClusteredCache`] entirely in memory.
//! It behaves like one member of a cluster with a configured topology, and
//! exposes hooks to simulate what a real cluster does to a member's entries:
//! replication dropping an entry, residency being lost, policy eviction, held
//! entry locks and an unreachable engine.

use crate::engine::{
    CacheEvent, CacheEventKind, CacheListener, CacheValue, ClusteredCache, EntryMetadata,
    ListenerId,
};
use dashmap::DashMap;
use keel_core::{
    Capabilities, CacheTopology, ClusterAddress, ClusterMembership, ConcurrencyStrategy,
    DataVersion, EngineError, EntryKey, RegionId, TypeOverrides,
};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_LOCK_ACQUISITION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct StoredEntry {
    value: CacheValue,
    resident: bool,
    version: DataVersion,
    touched: u64,
}

/// A held entry lock, released on drop.
pub struct EntryLockGuard {
    _guard: ArcMutexGuard<RawMutex, ()>,
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`InMemoryClusteredCache`].
#[derive(Debug, Clone)]
pub struct InMemoryClusteredCacheBuilder {
    name: String,
    topology: CacheTopology,
    concurrency: ConcurrencyStrategy,
    members: Vec<ClusterAddress>,
    max_entries: Option<NonZeroUsize>,
    lock_acquisition_timeout: Duration,
}

impl Default for InMemoryClusteredCacheBuilder {
    fn default() -> Self {
        Self {
            name: "entity".to_string(),
            topology: CacheTopology::local(),
            concurrency: ConcurrencyStrategy::Pessimistic,
            members: Vec::new(),
            max_entries: None,
            lock_acquisition_timeout: DEFAULT_LOCK_ACQUISITION_TIMEOUT,
        }
    }
}

impl InMemoryClusteredCacheBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn topology(mut self, topology: CacheTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn concurrency(mut self, concurrency: ConcurrencyStrategy) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Cluster view; the first member is this process.
    pub fn members(mut self, members: Vec<ClusterAddress>) -> Self {
        self.members = members;
        self
    }

    /// Default per-region limit on data entries that are not resident.
    pub fn max_entries(mut self, max_entries: NonZeroUsize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = timeout;
        self
    }

    pub fn build(self) -> InMemoryClusteredCache {
        let (local_address, members) = if self.topology.is_clustered() {
            let mut members = self.members;
            if members.is_empty() {
                members.push(ClusterAddress::random());
            }
            (Some(members[0].clone()), ClusterMembership::new(members))
        } else {
            (None, ClusterMembership::empty())
        };

        InMemoryClusteredCache {
            name: self.name,
            topology: self.topology,
            concurrency: self.concurrency,
            local_address,
            members: RwLock::new(members),
            lock_acquisition_timeout: RwLock::new(self.lock_acquisition_timeout),
            default_max_entries: self.max_entries.map(NonZeroUsize::get),
            region_limits: DashMap::new(),
            entries: DashMap::new(),
            key_locks: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            clock: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
            evictions: AtomicU64::new(0),
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Thread-safe in-memory engine with simulated cluster behaviour.
pub struct InMemoryClusteredCache {
    name: String,
    topology: CacheTopology,
    concurrency: ConcurrencyStrategy,
    local_address: Option<ClusterAddress>,
    members: RwLock<ClusterMembership>,
    lock_acquisition_timeout: RwLock<Duration>,
    default_max_entries: Option<usize>,
    region_limits: DashMap<RegionId, usize>,
    entries: DashMap<EntryKey, StoredEntry>,
    key_locks: DashMap<EntryKey, Arc<Mutex<()>>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn CacheListener>)>>,
    next_listener: AtomicU64,
    clock: AtomicU64,
    reachable: AtomicBool,
    evictions: AtomicU64,
}

impl Default for InMemoryClusteredCache {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl InMemoryClusteredCache {
    pub fn builder() -> InMemoryClusteredCacheBuilder {
        InMemoryClusteredCacheBuilder::default()
    }

    // ------------------------------------------------------------------------
    // Simulation hooks
    // ------------------------------------------------------------------------

    /// Remove an entry the way a replication or invalidation message would,
    /// ignoring residency and locks. Returns true if the entry existed.
    pub fn drop_entry(&self, key: &EntryKey) -> bool {
        let dropped = self.entries.remove(key).is_some();
        if dropped {
            self.notify(CacheEventKind::Removed, key, false);
        }
        dropped
    }

    /// Forget an entry's residency flag, as happens when it is replicated in.
    pub fn clear_residency(&self, key: &EntryKey) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.resident = false;
                true
            }
            None => false,
        }
    }

    /// Hold the lock of one entry until the guard is dropped.
    pub fn lock_entry(&self, key: &EntryKey) -> EntryLockGuard {
        let lock = self.key_lock(key);
        EntryLockGuard {
            _guard: lock.lock_arc(),
        }
    }

    /// Make every operation fail with [`EngineError::Unreachable`].
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Replace the cluster view.
    pub fn set_members(&self, members: Vec<ClusterAddress>) {
        *self.members.write() = ClusterMembership::new(members);
    }

    /// Number of entries evicted so far, by policy or by request.
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Total stored entries including anchors.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn key_lock(&self, key: &EntryKey) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock of `key` once nobody but the map holds it.
    fn release_key_lock(&self, key: &EntryKey) {
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn check_reachable(&self) -> Result<(), EngineError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Unreachable {
                reason: format!("cache {} is not reachable", self.name),
            })
        }
    }

    /// Run `op` with the entry lock held, honouring the per-call flags.
    fn guarded<T: Default>(
        &self,
        key: &EntryKey,
        flags: Capabilities,
        op: impl FnOnce() -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let result = self.check_reachable().and_then(|()| {
            if flags.contains(Capabilities::SKIP_LOCKING) {
                return op();
            }
            let timeout = if flags.contains(Capabilities::ZERO_LOCK_ACQUISITION_TIMEOUT) {
                Duration::ZERO
            } else {
                *self.lock_acquisition_timeout.read()
            };
            let lock = self.key_lock(key);
            let outcome = match lock.try_lock_for(timeout) {
                Some(_held) => op(),
                None => Err(EngineError::LockTimeout {
                    key: key.to_string(),
                    timeout,
                }),
            };
            drop(lock);
            self.release_key_lock(key);
            outcome
        });

        match result {
            Err(_) if flags.fails_silently() => Ok(T::default()),
            other => other,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn next_version(&self, previous: Option<DataVersion>) -> DataVersion {
        match (self.concurrency, previous) {
            (ConcurrencyStrategy::Optimistic, Some(v)) => v.increment(),
            _ => DataVersion::initial(),
        }
    }

    fn store(&self, key: &EntryKey, value: CacheValue) -> Option<CacheValue> {
        let touched = self.tick();
        let previous = self.entries.get(key).map(|e| (e.version, e.resident));
        let version = self.next_version(previous.map(|(v, _)| v));
        let resident = previous.is_some_and(|(_, r)| r);
        self.entries
            .insert(
                key.clone(),
                StoredEntry {
                    value,
                    resident,
                    version,
                    touched,
                },
            )
            .map(|e| e.value)
    }

    fn region_limit(&self, region: &RegionId) -> Option<usize> {
        self.region_limits
            .get(region)
            .map(|limit| *limit)
            .or(self.default_max_entries)
    }

    /// Evict least recently touched non-resident data entries of `region`
    /// until it is within its limit. Anchors never count against the limit.
    fn enforce_limit(&self, region: &RegionId) {
        let Some(limit) = self.region_limit(region) else {
            return;
        };

        let mut candidates: Vec<(u64, EntryKey)> = self
            .entries
            .iter()
            .filter(|e| {
                e.key().region() == region && !e.key().is_anchor() && !e.value().resident
            })
            .map(|e| (e.value().touched, e.key().clone()))
            .collect();
        if candidates.len() <= limit {
            return;
        }

        candidates.sort();
        let excess = candidates.len() - limit;
        for (_, key) in candidates.into_iter().take(excess) {
            let removed = self
                .entries
                .remove_if(&key, |_, entry| !entry.resident)
                .is_some();
            if removed {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    cache = %self.name,
                    key = %key,
                    "Evicted entry under size pressure"
                );
                self.notify(CacheEventKind::Evicted, &key, true);
            }
        }
    }

    fn notify(&self, kind: CacheEventKind, key: &EntryKey, origin_local: bool) {
        let listeners: Vec<Arc<dyn CacheListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        if listeners.is_empty() {
            return;
        }
        let event = CacheEvent {
            kind,
            key: key.clone(),
            origin_local,
        };
        for listener in listeners {
            listener.on_event(&event);
        }
    }
}

impl ClusteredCache for InMemoryClusteredCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &EntryKey, flags: Capabilities) -> Result<Option<CacheValue>, EngineError> {
        self.guarded(key, flags, || {
            let touched = self.tick();
            Ok(self.entries.get_mut(key).map(|mut entry| {
                entry.touched = touched;
                entry.value.clone()
            }))
        })
    }

    fn put(
        &self,
        key: &EntryKey,
        value: CacheValue,
        flags: Capabilities,
    ) -> Result<Option<CacheValue>, EngineError> {
        let previous = self.guarded(key, flags, || Ok(Some(self.store(key, value))))?;
        let Some(previous) = previous else {
            // Suppressed by FAIL_SILENTLY.
            return Ok(None);
        };
        let kind = if previous.is_some() {
            CacheEventKind::Modified
        } else {
            CacheEventKind::Created
        };
        self.notify(kind, key, true);
        self.enforce_limit(key.region());
        Ok(previous)
    }

    fn put_for_external_read(
        &self,
        key: &EntryKey,
        value: CacheValue,
        flags: Capabilities,
    ) -> Result<(), EngineError> {
        let created = self.guarded(key, flags, || {
            if self.entries.contains_key(key) {
                return Ok(false);
            }
            self.store(key, value);
            Ok(true)
        })?;
        if created {
            self.notify(CacheEventKind::Created, key, true);
            self.enforce_limit(key.region());
        }
        Ok(())
    }

    fn remove(
        &self,
        key: &EntryKey,
        flags: Capabilities,
    ) -> Result<Option<CacheValue>, EngineError> {
        let removed = self.guarded(key, flags, || {
            Ok(self.entries.remove(key).map(|(_, entry)| entry.value))
        })?;
        if removed.is_some() {
            self.notify(CacheEventKind::Removed, key, true);
        }
        Ok(removed)
    }

    fn evict(&self, key: &EntryKey) -> Result<bool, EngineError> {
        self.check_reachable()?;
        let evicted = self
            .entries
            .remove_if(key, |_, entry| !entry.resident)
            .is_some();
        if evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.notify(CacheEventKind::Evicted, key, true);
        }
        Ok(evicted)
    }

    fn clear_region(&self, region: &RegionId, flags: Capabilities) -> Result<(), EngineError> {
        let result = self.check_reachable().map(|()| {
            let keys: Vec<EntryKey> = self
                .entries
                .iter()
                .filter(|e| e.key().region() == region && !e.key().is_anchor())
                .map(|e| e.key().clone())
                .collect();
            for key in keys {
                if self.entries.remove(&key).is_some() {
                    self.notify(CacheEventKind::Removed, &key, true);
                }
            }
        });
        match result {
            Err(_) if flags.fails_silently() => Ok(()),
            other => other,
        }
    }

    fn keys(&self, region: &RegionId) -> Result<Vec<EntryKey>, EngineError> {
        self.check_reachable()?;
        let mut keys: Vec<EntryKey> = self
            .entries
            .iter()
            .filter(|e| e.key().region() == region && !e.key().is_anchor())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn contains_key(&self, key: &EntryKey, flags: Capabilities) -> Result<bool, EngineError> {
        let result = self
            .check_reachable()
            .map(|()| self.entries.contains_key(key));
        match result {
            Err(_) if flags.fails_silently() => Ok(false),
            other => other,
        }
    }

    fn metadata(&self, key: &EntryKey) -> Result<Option<EntryMetadata>, EngineError> {
        self.check_reachable()?;
        Ok(self.entries.get(key).map(|entry| EntryMetadata {
            resident: entry.resident,
            version: entry.version,
        }))
    }

    fn set_resident(&self, key: &EntryKey, resident: bool) -> Result<(), EngineError> {
        self.check_reachable()?;
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.resident = resident;
                Ok(())
            }
            None => Err(EngineError::Rejected {
                reason: format!("no entry at {}", key),
            }),
        }
    }

    fn set_data_version(&self, key: &EntryKey, version: DataVersion) -> Result<(), EngineError> {
        self.check_reachable()?;
        match self.entries.get_mut(key) {
            Some(entry) if version.conflicts_with(&entry.version) => {
                Err(EngineError::Rejected {
                    reason: format!(
                        "version {} at {} is older than stored {}",
                        version, key, entry.version
                    ),
                })
            }
            Some(mut entry) => {
                entry.version = version;
                Ok(())
            }
            None => Err(EngineError::Rejected {
                reason: format!("no entry at {}", key),
            }),
        }
    }

    fn define_region(
        &self,
        region: &RegionId,
        settings: &TypeOverrides,
    ) -> Result<(), EngineError> {
        self.check_reachable()?;
        match settings.eviction_max_entries {
            Some(0) => {
                return Err(EngineError::Rejected {
                    reason: format!("region {} cannot hold zero entries", region),
                })
            }
            Some(max) => {
                self.region_limits.insert(region.clone(), max);
            }
            None => {}
        }
        Ok(())
    }

    fn set_lock_acquisition_timeout(&self, timeout: Duration) -> Result<(), EngineError> {
        self.check_reachable()?;
        *self.lock_acquisition_timeout.write() = timeout;
        Ok(())
    }

    fn topology(&self) -> Result<CacheTopology, EngineError> {
        self.check_reachable()?;
        Ok(self.topology)
    }

    fn concurrency(&self) -> ConcurrencyStrategy {
        self.concurrency
    }

    fn local_address(&self) -> Result<Option<ClusterAddress>, EngineError> {
        self.check_reachable()?;
        Ok(self.local_address.clone())
    }

    fn members(&self) -> Result<ClusterMembership, EngineError> {
        self.check_reachable()?;
        Ok(self.members.read().clone())
    }

    fn add_listener(&self, listener: Arc<dyn CacheListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}
