//! Per-call capability overrides.
//!
//! Capabilities are passed with a single operation and never stored on a
//! region, so one caller's override cannot leak into another caller's call.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Flags that modify how the underlying engine performs one operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// Do not consult a cache loader or store on a miss
        const SKIP_CACHE_LOAD = 0b0000_0001;
        /// Do not acquire entry locks
        const SKIP_LOCKING = 0b0000_0010;
        /// Apply the effect on this member only
        const CACHE_MODE_LOCAL = 0b0000_0100;
        /// Swallow engine failures (best-effort administration)
        const FAIL_SILENTLY = 0b0000_1000;
        /// Give up immediately if a lock is held
        const ZERO_LOCK_ACQUISITION_TIMEOUT = 0b0001_0000;
        /// Replicate without waiting for acknowledgement
        const FORCE_ASYNCHRONOUS = 0b0010_0000;
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::empty()
    }
}

impl Capabilities {
    /// Flags for best-effort anchor teardown on this member only.
    pub fn teardown() -> Self {
        Capabilities::CACHE_MODE_LOCAL | Capabilities::FAIL_SILENTLY
    }

    /// Flags used for put-for-external-read.
    pub fn external_read() -> Self {
        Capabilities::ZERO_LOCK_ACQUISITION_TIMEOUT | Capabilities::FORCE_ASYNCHRONOUS
    }

    /// Flags for creating or repairing a region anchor.
    pub fn anchor_maintenance() -> Self {
        Capabilities::CACHE_MODE_LOCAL | Capabilities::SKIP_CACHE_LOAD
    }

    pub fn is_local(&self) -> bool {
        self.contains(Capabilities::CACHE_MODE_LOCAL)
    }

    pub fn fails_silently(&self) -> bool {
        self.contains(Capabilities::FAIL_SILENTLY)
    }
}

// Manual serde implementation for Capabilities (bitflags 2.x + serde)
impl Serialize for Capabilities {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Self::from_bits(bits).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid Capabilities bits: {:#04x}", bits))
        })
    }
}
