//! Read-only view of the engine's cluster topology.

use crate::adapter::translate_engine_error;
use crate::engine::ClusteredCache;
use keel_core::{CacheTopology, ClusterAddress, ClusterMembership, KeelResult};
use once_cell::sync::OnceCell;
use std::sync::Arc;

/// Answers topology and membership questions about the underlying engine.
///
/// The engine's mode cannot change after it is configured, so the topology
/// is derived on first use and cached. Membership is read live.
pub struct ClusterTopologyInspector {
    cache: Arc<dyn ClusteredCache>,
    topology: OnceCell<CacheTopology>,
}

impl ClusterTopologyInspector {
    pub fn new(cache: Arc<dyn ClusteredCache>) -> Self {
        Self {
            cache,
            topology: OnceCell::new(),
        }
    }

    pub fn topology(&self) -> KeelResult<CacheTopology> {
        self.topology
            .get_or_try_init(|| {
                self.cache
                    .topology()
                    .map_err(|e| translate_engine_error(e, self.cache.name(), "topology", None))
            })
            .copied()
    }

    pub fn is_clustered(&self) -> KeelResult<bool> {
        Ok(self.topology()?.is_clustered())
    }

    pub fn is_synchronous(&self) -> KeelResult<bool> {
        Ok(self.topology()?.is_synchronous())
    }

    /// This member's address, `None` when the cache is not clustered.
    pub fn local_address(&self) -> KeelResult<Option<ClusterAddress>> {
        if !self.is_clustered()? {
            return Ok(None);
        }
        self.cache
            .local_address()
            .map_err(|e| translate_engine_error(e, self.cache.name(), "local_address", None))
    }

    /// The engine's current view, empty when the cache is not clustered.
    pub fn members(&self) -> KeelResult<ClusterMembership> {
        if !self.is_clustered()? {
            return Ok(ClusterMembership::empty());
        }
        self.cache
            .members()
            .map_err(|e| translate_engine_error(e, self.cache.name(), "members", None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryClusteredCache;
    use keel_core::{CacheMode, Propagation};

    #[test]
    fn test_local_cache_has_no_address_or_members() {
        let inspector = ClusterTopologyInspector::new(Arc::new(InMemoryClusteredCache::default()));
        assert!(!inspector.is_clustered().unwrap());
        assert!(!inspector.is_synchronous().unwrap());
        assert_eq!(inspector.local_address().unwrap(), None);
        assert!(inspector.members().unwrap().is_empty());
    }

    #[test]
    fn test_topology_cached_after_first_read() {
        let cache = Arc::new(
            InMemoryClusteredCache::builder()
                .topology(CacheTopology::new(CacheMode::Invalidation, Propagation::Sync))
                .build(),
        );
        let inspector = ClusterTopologyInspector::new(cache.clone());
        let first = inspector.topology().unwrap();

        cache.set_reachable(false);
        assert_eq!(inspector.topology().unwrap(), first);
        assert!(inspector.is_synchronous().unwrap());
        assert!(inspector.members().unwrap_err().is_unavailable());
    }

    #[test]
    fn test_unreachable_before_first_read() {
        let cache = Arc::new(InMemoryClusteredCache::default());
        cache.set_reachable(false);
        let inspector = ClusterTopologyInspector::new(cache);
        assert!(inspector.topology().unwrap_err().is_unavailable());
    }

    #[test]
    fn test_members_follow_current_view() {
        let cache = Arc::new(
            InMemoryClusteredCache::builder()
                .topology(CacheTopology::new(CacheMode::Replication, Propagation::Async))
                .members(vec![ClusterAddress::new("a"), ClusterAddress::new("b")])
                .build(),
        );
        let inspector = ClusterTopologyInspector::new(cache.clone());
        assert_eq!(inspector.members().unwrap().len(), 2);

        cache.set_members(vec![ClusterAddress::new("b")]);
        let view = inspector.members().unwrap();
        assert_eq!(view.iter().cloned().collect::<Vec<_>>(), vec![ClusterAddress::new("b")]);
        assert_eq!(
            inspector.local_address().unwrap(),
            Some(ClusterAddress::new("a"))
        );
    }
}
