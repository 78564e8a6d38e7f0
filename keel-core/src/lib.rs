//! KEEL Core - Region Data Model
//!
//! Pure data types shared by every keel crate: region naming, cluster
//! topology, per-call capabilities, data versions, configuration and the
//! error taxonomy. Nothing in here talks to a cache engine.

pub mod capabilities;
pub mod config;
pub mod error;
pub mod region_name;
pub mod topology;
pub mod version;

pub use capabilities::Capabilities;
pub use config::{EvictionStrategy, RegionFactoryConfig, TypeOverrides, PROPERTY_PREFIX};
pub use error::{
    CacheOperationError, ConfigError, EngineError, KeelError, KeelResult, RegionAdminError,
    TransactionError,
};
pub use region_name::{EntryKey, RegionId, RegionNameCodec, RegionType, PATH_SEPARATOR};
pub use topology::{
    CacheMode, CacheTopology, ClusterAddress, ClusterMembership, ConcurrencyStrategy,
    Propagation, TopologyParseError,
};
pub use version::DataVersion;
