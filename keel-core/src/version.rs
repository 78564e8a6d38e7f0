//! Data versions for optimistic concurrency control.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version marker attached to an entry under optimistic concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataVersion {
    /// Never conflicts with anything. Reserved for region anchors so that
    /// region administration is never blocked by application transactions.
    NonLocking,
    /// Monotonic counter maintained by the engine.
    Numbered(u64),
}

impl DataVersion {
    pub fn initial() -> Self {
        DataVersion::Numbered(0)
    }

    pub fn is_non_locking(&self) -> bool {
        matches!(self, DataVersion::NonLocking)
    }

    /// Whether writing `self` over an entry at `current` is a conflict.
    ///
    /// A non-locking version on either side never conflicts; numbered
    /// versions conflict when the incoming one is older.
    pub fn conflicts_with(&self, current: &DataVersion) -> bool {
        match (self, current) {
            (DataVersion::NonLocking, _) | (_, DataVersion::NonLocking) => false,
            (DataVersion::Numbered(incoming), DataVersion::Numbered(existing)) => {
                incoming < existing
            }
        }
    }

    /// The version following this one. Non-locking versions stay put.
    pub fn increment(&self) -> DataVersion {
        match self {
            DataVersion::NonLocking => DataVersion::NonLocking,
            DataVersion::Numbered(n) => DataVersion::Numbered(n.saturating_add(1)),
        }
    }
}

impl fmt::Display for DataVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataVersion::NonLocking => f.write_str("non-locking"),
            DataVersion::Numbered(n) => write!(f, "v{}", n),
        }
    }
}
