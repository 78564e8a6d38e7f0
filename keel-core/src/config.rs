//! Configuration types
//!
//! Region factory settings, either built in code or dissected from a flat
//! property map:
//!
//! ```text
//! keel.cache.region_prefix               = myapp
//! keel.cache.statistics                  = true
//! keel.cache.entity.cfg                  = replicated-entity
//! keel.cache.com.acme.Order.eviction.max_entries = 5000
//! keel.cache.query.expiration.lifespan   = 60000
//! ```

use crate::{ConfigError, KeelError, KeelResult, RegionType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every recognised property.
pub const PROPERTY_PREFIX: &str = "keel.cache.";

const CONFIG_SUFFIX: &str = ".cfg";
const STRATEGY_SUFFIX: &str = ".eviction.strategy";
const WAKE_UP_INTERVAL_SUFFIX: &str = ".eviction.wake_up_interval";
const MAX_ENTRIES_SUFFIX: &str = ".eviction.max_entries";
const LIFESPAN_SUFFIX: &str = ".expiration.lifespan";
const MAX_IDLE_SUFFIX: &str = ".expiration.max_idle";

const STATISTICS_KEY: &str = "statistics";
const REGION_PREFIX_KEY: &str = "region_prefix";
const LOCK_TIMEOUT_KEY: &str = "lock_acquisition_timeout";

// ============================================================================
// EVICTION STRATEGY
// ============================================================================

/// Eviction algorithm requested for a cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvictionStrategy {
    None,
    Unordered,
    Fifo,
    Lru,
    Lirs,
}

impl EvictionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionStrategy::None => "NONE",
            EvictionStrategy::Unordered => "UNORDERED",
            EvictionStrategy::Fifo => "FIFO",
            EvictionStrategy::Lru => "LRU",
            EvictionStrategy::Lirs => "LIRS",
        }
    }
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "NONE" => Ok(EvictionStrategy::None),
            "UNORDERED" => Ok(EvictionStrategy::Unordered),
            "FIFO" => Ok(EvictionStrategy::Fifo),
            "LRU" => Ok(EvictionStrategy::Lru),
            "LIRS" => Ok(EvictionStrategy::Lirs),
            _ => Err(ConfigError::InvalidValue {
                field: "eviction.strategy".to_string(),
                value: s.to_string(),
                reason: "expected one of NONE, UNORDERED, FIFO, LRU, LIRS".to_string(),
            }),
        }
    }
}

// ============================================================================
// TYPE OVERRIDES
// ============================================================================

/// Settings overriding a cache template for a region type or a single region.
///
/// Every field is optional; unset fields inherit from the layer below.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeOverrides {
    pub cache_name: Option<String>,
    pub eviction_strategy: Option<EvictionStrategy>,
    pub eviction_wake_up_interval: Option<Duration>,
    pub eviction_max_entries: Option<usize>,
    pub expiration_lifespan: Option<Duration>,
    pub expiration_max_idle: Option<Duration>,
    pub expose_statistics: Option<bool>,
}

impl TypeOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides that only name a cache template.
    pub fn with_cache_name(mut self, name: impl Into<String>) -> Self {
        self.cache_name = Some(name.into());
        self
    }

    pub fn with_eviction(mut self, strategy: EvictionStrategy, max_entries: usize) -> Self {
        self.eviction_strategy = Some(strategy);
        self.eviction_max_entries = Some(max_entries);
        self
    }

    pub fn with_lifespan(mut self, lifespan: Duration) -> Self {
        self.expiration_lifespan = Some(lifespan);
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.expiration_max_idle = Some(max_idle);
        self
    }

    /// Layer `other` on top of `self`; values set in `other` win.
    pub fn merged_with(&self, other: &TypeOverrides) -> TypeOverrides {
        TypeOverrides {
            cache_name: other.cache_name.clone().or_else(|| self.cache_name.clone()),
            eviction_strategy: other.eviction_strategy.or(self.eviction_strategy),
            eviction_wake_up_interval: other
                .eviction_wake_up_interval
                .or(self.eviction_wake_up_interval),
            eviction_max_entries: other.eviction_max_entries.or(self.eviction_max_entries),
            expiration_lifespan: other.expiration_lifespan.or(self.expiration_lifespan),
            expiration_max_idle: other.expiration_max_idle.or(self.expiration_max_idle),
            expose_statistics: other.expose_statistics.or(self.expose_statistics),
        }
    }

    /// Returns true if these settings would let entries be evicted.
    pub fn enables_eviction(&self) -> bool {
        let strategy_evicts = self
            .eviction_strategy
            .is_some_and(|s| s != EvictionStrategy::None);
        strategy_evicts || self.eviction_max_entries.is_some()
    }

    fn validate(&self, owner: &str) -> KeelResult<()> {
        if self.eviction_max_entries == Some(0) {
            return Err(invalid(
                format!("{}{}", owner, MAX_ENTRIES_SUFFIX),
                "0".to_string(),
                "eviction max entries must be greater than 0",
            ));
        }
        if self.expiration_lifespan.is_some_and(|d| d.is_zero()) {
            return Err(invalid(
                format!("{}{}", owner, LIFESPAN_SUFFIX),
                "0".to_string(),
                "expiration lifespan must be positive",
            ));
        }
        if self.expiration_max_idle.is_some_and(|d| d.is_zero()) {
            return Err(invalid(
                format!("{}{}", owner, MAX_IDLE_SUFFIX),
                "0".to_string(),
                "expiration max idle must be positive",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// REGION FACTORY CONFIG
// ============================================================================

/// Master configuration for a region factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionFactoryConfig {
    /// Namespace prefix applied to every region name.
    pub region_prefix: Option<String>,
    /// Global statistics switch, overriding every type and region.
    pub expose_statistics: Option<bool>,
    /// How long the engine may wait for an entry lock. Applied to the engine
    /// when the factory starts; `None` keeps the engine's own setting.
    pub lock_acquisition_timeout: Option<Duration>,
    /// Overrides keyed by region type name or concrete region name.
    pub type_overrides: BTreeMap<String, TypeOverrides>,
}

impl Default for RegionFactoryConfig {
    fn default() -> Self {
        let type_overrides = RegionType::ALL
            .into_iter()
            .map(|t| {
                (
                    t.as_str().to_string(),
                    TypeOverrides::new().with_cache_name(t.default_cache_name()),
                )
            })
            .collect();
        Self {
            region_prefix: None,
            expose_statistics: None,
            lock_acquisition_timeout: None,
            type_overrides,
        }
    }
}

impl RegionFactoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.region_prefix = Some(prefix.into());
        self
    }

    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.expose_statistics = Some(enabled);
        self
    }

    pub fn with_lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = Some(timeout);
        self
    }

    /// Layer `overrides` onto whatever is configured under `name`.
    pub fn with_override(mut self, name: impl Into<String>, overrides: TypeOverrides) -> Self {
        let entry = self.type_overrides.entry(name.into()).or_default();
        *entry = entry.merged_with(&overrides);
        self
    }

    /// Build a configuration from a flat property map.
    ///
    /// Keys outside [`PROPERTY_PREFIX`] are ignored, as are keys under the
    /// prefix with an unrecognised suffix.
    pub fn from_properties(properties: &HashMap<String, String>) -> KeelResult<Self> {
        let mut config = Self::default();

        // Sorted so later, more specific keys are applied deterministically.
        let mut keys: Vec<&String> = properties.keys().collect();
        keys.sort();

        for key in keys {
            let Some(rest) = key.strip_prefix(PROPERTY_PREFIX) else {
                continue;
            };
            let value = properties[key].trim();
            tracing::debug!(property = %key, value, "Configuration override via property");
            config.dissect_property(key, rest, value)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn dissect_property(&mut self, key: &str, rest: &str, value: &str) -> KeelResult<()> {
        match rest {
            STATISTICS_KEY => {
                self.expose_statistics = Some(parse_bool(key, value)?);
                return Ok(());
            }
            REGION_PREFIX_KEY => {
                self.region_prefix = (!value.is_empty()).then(|| value.to_string());
                return Ok(());
            }
            LOCK_TIMEOUT_KEY => {
                self.lock_acquisition_timeout = Some(parse_millis(key, value)?);
                return Ok(());
            }
            _ => {}
        }

        if let Some(name) = rest.strip_suffix(CONFIG_SUFFIX) {
            if value.is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: key.to_string(),
                }
                .into());
            }
            self.override_for(name).cache_name = Some(value.to_string());
        } else if let Some(name) = rest.strip_suffix(STRATEGY_SUFFIX) {
            let strategy = value.parse::<EvictionStrategy>().map_err(|_| {
                invalid(
                    key.to_string(),
                    value.to_string(),
                    "expected one of NONE, UNORDERED, FIFO, LRU, LIRS",
                )
            })?;
            self.override_for(name).eviction_strategy = Some(strategy);
        } else if let Some(name) = rest.strip_suffix(WAKE_UP_INTERVAL_SUFFIX) {
            let interval = parse_millis(key, value)?;
            self.override_for(name).eviction_wake_up_interval = Some(interval);
        } else if let Some(name) = rest.strip_suffix(MAX_ENTRIES_SUFFIX) {
            let max = value.parse::<usize>().map_err(|e| {
                invalid(key.to_string(), value.to_string(), &e.to_string())
            })?;
            self.override_for(name).eviction_max_entries = Some(max);
        } else if let Some(name) = rest.strip_suffix(LIFESPAN_SUFFIX) {
            let lifespan = parse_millis(key, value)?;
            self.override_for(name).expiration_lifespan = Some(lifespan);
        } else if let Some(name) = rest.strip_suffix(MAX_IDLE_SUFFIX) {
            let max_idle = parse_millis(key, value)?;
            self.override_for(name).expiration_max_idle = Some(max_idle);
        } else {
            tracing::debug!(property = %key, "Ignoring unrecognised cache property");
        }
        Ok(())
    }

    fn override_for(&mut self, name: &str) -> &mut TypeOverrides {
        self.type_overrides.entry(name.to_string()).or_default()
    }

    /// Effective settings for one region.
    ///
    /// The region-specific override (if any) is layered over the override for
    /// its type, and the global statistics switch is applied last.
    pub fn resolve(
        &self,
        region_name: &str,
        region_type: RegionType,
    ) -> KeelResult<TypeOverrides> {
        let type_default =
            TypeOverrides::new().with_cache_name(region_type.default_cache_name());
        let base = self
            .type_overrides
            .get(region_type.as_str())
            .map(|o| type_default.merged_with(o))
            .unwrap_or(type_default);

        let mut resolved = match self.type_overrides.get(region_name) {
            Some(region_override) => base.merged_with(region_override),
            None => base,
        };
        if let Some(stats) = self.expose_statistics {
            resolved.expose_statistics = Some(stats);
        }

        if region_type == RegionType::Timestamps && resolved.enables_eviction() {
            return Err(invalid(
                format!("{}{}", PROPERTY_PREFIX, region_name),
                resolved
                    .eviction_strategy
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "max_entries".to_string()),
                "timestamps regions must not use eviction",
            ));
        }
        Ok(resolved)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - every override has positive max entries, lifespan and max idle
    /// - the timestamps type does not enable eviction
    /// - lock_acquisition_timeout, when set, is positive
    pub fn validate(&self) -> KeelResult<()> {
        for (name, overrides) in &self.type_overrides {
            overrides.validate(&format!("{}{}", PROPERTY_PREFIX, name))?;
        }

        if let Some(ts) = self.type_overrides.get(RegionType::Timestamps.as_str()) {
            if ts.enables_eviction() {
                return Err(invalid(
                    format!("{}{}{}", PROPERTY_PREFIX, RegionType::Timestamps, STRATEGY_SUFFIX),
                    ts.eviction_strategy
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "max_entries".to_string()),
                    "timestamps regions must not use eviction",
                ));
            }
        }

        if self.lock_acquisition_timeout.is_some_and(|t| t.is_zero()) {
            return Err(invalid(
                format!("{}{}", PROPERTY_PREFIX, LOCK_TIMEOUT_KEY),
                "0".to_string(),
                "lock acquisition timeout must be positive",
            ));
        }

        Ok(())
    }
}

fn invalid(field: String, value: String, reason: &str) -> KeelError {
    KeelError::Config(ConfigError::InvalidValue {
        field,
        value,
        reason: reason.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> KeelResult<bool> {
    value
        .parse::<bool>()
        .map_err(|_| invalid(key.to_string(), value.to_string(), "expected true or false"))
}

fn parse_millis(key: &str, value: &str) -> KeelResult<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| invalid(key.to_string(), value.to_string(), &e.to_string()))
}
