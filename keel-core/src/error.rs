//! Error types for keel operations

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the underlying clustered cache engine.
///
/// These never escape the storage layer as-is: the cache adapter translates
/// them into [`KeelError`] before any caller sees them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Lock acquisition on {key} timed out after {timeout:?}")]
    LockTimeout { key: String, timeout: Duration },

    #[error("Cache engine unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Cache engine rejected the operation: {reason}")]
    Rejected { reason: String },
}

impl EngineError {
    /// Returns true if this is a lock-acquisition timeout.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, EngineError::LockTimeout { .. })
    }
}

/// Transaction-manager errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Failed to suspend transaction: {reason}")]
    SuspendFailed { reason: String },

    #[error("Failed to resume transaction {transaction}: {reason}")]
    ResumeFailed { transaction: String, reason: String },
}

/// Failures while activating, repairing or destroying a region's anchor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegionAdminError {
    #[error("Activation of region {region} failed: {reason}")]
    ActivationFailed { region: String, reason: String },

    #[error("Anchor repair for region {region} failed: {reason}")]
    RepairFailed { region: String, reason: String },

    #[error("Region {region} has been destroyed")]
    Destroyed { region: String },

    #[error("Region factory is not running: {reason}")]
    FactoryNotRunning { reason: String },

    #[error("Transaction error during region administration: {0}")]
    Transaction(#[from] TransactionError),
}

/// Failures of data-entry operations on a region.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheOperationError {
    #[error("Lock timeout during {operation} of {key} in region {region}")]
    LockTimeout {
        region: String,
        operation: &'static str,
        key: String,
    },

    #[error("{operation} in region {region} failed: {reason}")]
    Failed {
        region: String,
        operation: &'static str,
        reason: String,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Unknown region type: {name}")]
    UnknownRegionType { name: String },
}

/// Master error type for all keel errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeelError {
    #[error("Cache unavailable: {reason}")]
    CacheUnavailable { reason: String },

    #[error("Region admin error: {0}")]
    RegionAdmin(#[from] RegionAdminError),

    #[error("Cache operation error: {0}")]
    Operation(#[from] CacheOperationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl KeelError {
    /// Returns true if this error is the distinguished lock-timeout case.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(
            self,
            KeelError::Operation(CacheOperationError::LockTimeout { .. })
        )
    }

    /// Returns true if the underlying engine could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, KeelError::CacheUnavailable { .. })
    }
}

impl From<TransactionError> for KeelError {
    fn from(e: TransactionError) -> Self {
        KeelError::RegionAdmin(RegionAdminError::Transaction(e))
    }
}

/// Result type alias for keel operations.
pub type KeelResult<T> = Result<T, KeelError>;

// =============================================================================
// TESTS
// =============================================================================
