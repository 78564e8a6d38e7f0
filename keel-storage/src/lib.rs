//! KEEL Storage - Region Lifecycle and Cache Operations
//!
//! Binds named regions onto a clustered cache engine. The engine itself sits
//! behind the [`ClusteredCache`] trait; [`InMemoryClusteredCache`] is the
//! reference implementation used in tests and single-process deployments.

pub mod access;
pub mod adapter;
pub mod engine;
pub mod facade;
pub mod factory;
pub mod memory;
pub mod put_from_load;
pub mod region;
pub mod topology;
pub mod transaction;
pub mod tx_guard;

pub use access::TransactionalAccess;
pub use adapter::{translate_engine_error, CacheAdapter};
pub use engine::{
    CacheEvent, CacheEventKind, CacheListener, CacheValue, ClusteredCache, EntryMetadata,
    ListenerId,
};
pub use facade::CacheOperationFacade;
pub use factory::{CacheRegion, RegionFactory};
pub use memory::{EntryLockGuard, InMemoryClusteredCache, InMemoryClusteredCacheBuilder};
pub use put_from_load::{PutFromLoadConfig, PutFromLoadLock, PutFromLoadValidator, PutOwner};
pub use region::{Region, RegionLifecycleManager, RegionState};
pub use topology::ClusterTopologyInspector;
pub use transaction::{ThreadTransactionManager, Transaction, TransactionManager};
pub use tx_guard::TransactionScopeGuard;
