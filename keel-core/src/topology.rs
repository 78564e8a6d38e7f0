//! Cluster topology and membership types.
//!
//! These describe how the underlying clustered cache was configured. They are
//! derived once per region and never change afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// CACHE MODE
// ============================================================================

/// How writes reach other cluster members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheMode {
    /// Not clustered; nothing leaves this process.
    Local,
    /// Writes send invalidation messages; other members drop their copy.
    Invalidation,
    /// Writes ship the new state to every member.
    Replication,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Local => "local",
            CacheMode::Invalidation => "invalidation",
            CacheMode::Replication => "replication",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheMode {
    type Err = TopologyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(CacheMode::Local),
            "invalidation" => Ok(CacheMode::Invalidation),
            "replication" => Ok(CacheMode::Replication),
            _ => Err(TopologyParseError(s.to_string())),
        }
    }
}

/// Whether cluster propagation waits for acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Propagation {
    Sync,
    Async,
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Propagation::Sync => f.write_str("sync"),
            Propagation::Async => f.write_str("async"),
        }
    }
}

/// Error when parsing an invalid cache mode string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyParseError(pub String);

impl fmt::Display for TopologyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid cache mode: {}", self.0)
    }
}

impl std::error::Error for TopologyParseError {}

// ============================================================================
// TOPOLOGY
// ============================================================================

/// Operating mode of the underlying cache.
///
/// `is_synchronous()` holds only for a clustered cache with synchronous
/// propagation; a local cache is never synchronous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheTopology {
    mode: CacheMode,
    propagation: Propagation,
}

impl CacheTopology {
    pub fn new(mode: CacheMode, propagation: Propagation) -> Self {
        Self { mode, propagation }
    }

    /// A non-clustered cache.
    pub fn local() -> Self {
        Self::new(CacheMode::Local, Propagation::Sync)
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    pub fn is_clustered(&self) -> bool {
        self.mode != CacheMode::Local
    }

    pub fn is_synchronous(&self) -> bool {
        self.propagation == Propagation::Sync && self.mode != CacheMode::Local
    }

    pub fn is_invalidation(&self) -> bool {
        self.mode == CacheMode::Invalidation
    }

    pub fn is_replicated(&self) -> bool {
        self.mode == CacheMode::Replication
    }
}

impl fmt::Display for CacheTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clustered() {
            write!(f, "{}/{}", self.mode, self.propagation)
        } else {
            f.write_str("local")
        }
    }
}

// ============================================================================
// CONCURRENCY STRATEGY
// ============================================================================

/// Concurrency control used by the underlying engine for entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConcurrencyStrategy {
    /// Version checks at commit; anchors need a non-locking data version.
    Optimistic,
    /// Locks taken on access.
    Pessimistic,
}

impl ConcurrencyStrategy {
    pub fn is_optimistic(&self) -> bool {
        matches!(self, ConcurrencyStrategy::Optimistic)
    }
}

// ============================================================================
// MEMBERSHIP
// ============================================================================

/// Opaque identifier for a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterAddress(String);

impl ClusterAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// A fresh, process-unique address.
    pub fn random() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cluster members in view order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembership {
    members: Vec<ClusterAddress>,
}

impl ClusterMembership {
    pub fn new(members: Vec<ClusterAddress>) -> Self {
        Self { members }
    }

    /// Membership of a cache that is not clustered.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, address: &ClusterAddress) -> bool {
        self.members.contains(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterAddress> {
        self.members.iter()
    }
}

impl IntoIterator for ClusterMembership {
    type Item = ClusterAddress;
    type IntoIter = std::vec::IntoIter<ClusterAddress>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.into_iter()
    }
}
