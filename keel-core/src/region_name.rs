//! Region identifiers and the codec that builds them.
//!
//! A logical cache region name such as `com.acme.Order` becomes a
//! hierarchical [`RegionId`] (`com/acme/Order`). When a namespace prefix is
//! configured the prefix is kept verbatim and only the remainder is escaped.
//!
//! # Escaping Rule
//!
//! ```text
//! name starts with prefix:  prefix + suffix.replace('.', '/')
//! otherwise:                prefix + "/" + name.replace('.', '/')
//! no prefix:                name.replace('.', '/')
//! ```
//!
//! The rule is a fixed point: qualifying an already-qualified id with the same
//! prefix returns it unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Separator between path segments of a [`RegionId`].
pub const PATH_SEPARATOR: char = '/';

/// Separator between a region root and a data key inside an [`EntryKey`].
const ENTRY_SEPARATOR: char = '#';

// ============================================================================
// REGION TYPE
// ============================================================================

/// Kind of data a region holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionType {
    Entity,
    ImmutableEntity,
    Collection,
    NaturalId,
    QueryResults,
    Timestamps,
}

impl RegionType {
    pub const ALL: [RegionType; 6] = [
        RegionType::Entity,
        RegionType::ImmutableEntity,
        RegionType::Collection,
        RegionType::NaturalId,
        RegionType::QueryResults,
        RegionType::Timestamps,
    ];

    /// Configuration key for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionType::Entity => "entity",
            RegionType::ImmutableEntity => "immutable-entity",
            RegionType::Collection => "collection",
            RegionType::NaturalId => "naturalid",
            RegionType::QueryResults => "query",
            RegionType::Timestamps => "timestamps",
        }
    }

    /// Name of the cache configuration used when nothing is overridden.
    pub fn default_cache_name(&self) -> &'static str {
        match self {
            RegionType::Entity | RegionType::Collection | RegionType::NaturalId => "entity",
            RegionType::ImmutableEntity => "immutable-entity",
            RegionType::QueryResults => "local-query",
            RegionType::Timestamps => "timestamps",
        }
    }
}

impl fmt::Display for RegionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegionType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RegionType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownRegionType {
                name: s.to_string(),
            })
    }
}

// ============================================================================
// REGION ID
// ============================================================================

/// Hierarchical identifier of a region root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId {
    path: String,
}

impl RegionId {
    /// Wrap an already-escaped path.
    pub fn from_path(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Append another id below this one.
    pub fn join(&self, child: &RegionId) -> RegionId {
        if self.path.is_empty() {
            return child.clone();
        }
        if child.path.is_empty() {
            return self.clone();
        }
        RegionId {
            path: format!("{}{}{}", self.path, PATH_SEPARATOR, child.path),
        }
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

// ============================================================================
// ENTRY KEY
// ============================================================================

/// Key of an entry in the underlying cache.
///
/// Every entry lives under a region root. The anchor is the entry with no
/// data key; application entries carry the caller's opaque key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    region: RegionId,
    key: Option<String>,
}

impl EntryKey {
    /// The anchor entry of a region.
    pub fn anchor(region: &RegionId) -> Self {
        Self {
            region: region.clone(),
            key: None,
        }
    }

    /// An application entry inside a region.
    pub fn data(region: &RegionId, key: impl Into<String>) -> Self {
        Self {
            region: region.clone(),
            key: Some(key.into()),
        }
    }

    pub fn region(&self) -> &RegionId {
        &self.region
    }

    /// The caller's key, `None` for the anchor.
    pub fn data_key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn is_anchor(&self) -> bool {
        self.key.is_none()
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}{}{}", self.region, ENTRY_SEPARATOR, key),
            None => write!(f, "{}", self.region),
        }
    }
}

// ============================================================================
// CODEC
// ============================================================================

/// Builds region identifiers from logical names.
pub struct RegionNameCodec;

impl RegionNameCodec {
    /// Qualify `region_name` under `region_prefix`.
    ///
    /// An empty prefix behaves like no prefix.
    pub fn qualify(region_name: &str, region_prefix: Option<&str>) -> RegionId {
        let path = match region_prefix {
            Some(prefix) if region_name.starts_with(prefix) => {
                let (head, tail) = region_name.split_at(prefix.len());
                format!("{}{}", head, escape(tail))
            }
            Some(prefix) if !prefix.is_empty() => {
                format!("{}{}{}", prefix, PATH_SEPARATOR, escape(region_name))
            }
            _ => escape(region_name),
        };
        RegionId::from_path(path)
    }

    /// `<type>/<qualified name>`, for stores that group regions by type.
    pub fn with_type_first(
        region_name: &str,
        region_prefix: Option<&str>,
        region_type: RegionType,
    ) -> RegionId {
        RegionId::from_path(region_type.as_str())
            .join(&Self::qualify(region_name, region_prefix))
    }

    /// `<qualified name>/<type>`, for stores that group types by region.
    pub fn with_type_last(
        region_name: &str,
        region_prefix: Option<&str>,
        region_type: RegionType,
    ) -> RegionId {
        Self::qualify(region_name, region_prefix)
            .join(&RegionId::from_path(region_type.as_str()))
    }
}

fn escape(name: &str) -> String {
    name.replace('.', "/")
}
