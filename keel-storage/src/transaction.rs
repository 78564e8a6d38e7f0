//! Transaction-manager interface.
//!
//! Keel only needs to move the ambient transaction out of the way for
//! administrative work, so the surface is `current`, `suspend` and `resume`.
//! Transactions are associated with threads, mirroring how a JTA-style
//! manager tracks them; [`ThreadTransactionManager`] keeps that association
//! per manager instance instead of in a process-wide global.

use dashmap::DashMap;
use keel_core::TransactionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::thread::{self, ThreadId};
use uuid::Uuid;

/// Handle of an ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Transaction {
    id: Uuid,
}

impl Transaction {
    pub fn new() -> Self {
        Self { id: Uuid::now_v7() }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.id)
    }
}

/// Source of the ambient transaction for the calling thread.
pub trait TransactionManager: Send + Sync {
    /// Transaction associated with the calling thread, if any.
    fn current(&self) -> Option<Transaction>;

    /// Disassociate the calling thread's transaction and return it.
    fn suspend(&self) -> Result<Option<Transaction>, TransactionError>;

    /// Re-associate `transaction` with the calling thread.
    fn resume(&self, transaction: Transaction) -> Result<(), TransactionError>;
}

// ============================================================================
// THREAD-ASSOCIATED IMPLEMENTATION
// ============================================================================

/// Transaction manager that associates transactions with threads.
#[derive(Debug, Default)]
pub struct ThreadTransactionManager {
    associations: DashMap<ThreadId, Transaction>,
}

impl ThreadTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction on the calling thread.
    pub fn begin(&self) -> Result<Transaction, TransactionError> {
        let transaction = Transaction::new();
        self.resume(transaction)?;
        Ok(transaction)
    }

    /// End the calling thread's transaction, returning it.
    pub fn end(&self) -> Option<Transaction> {
        self.associations
            .remove(&thread::current().id())
            .map(|(_, tx)| tx)
    }
}

impl TransactionManager for ThreadTransactionManager {
    fn current(&self) -> Option<Transaction> {
        self.associations
            .get(&thread::current().id())
            .map(|tx| *tx)
    }

    fn suspend(&self) -> Result<Option<Transaction>, TransactionError> {
        Ok(self.end())
    }

    fn resume(&self, transaction: Transaction) -> Result<(), TransactionError> {
        let thread = thread::current().id();
        if let Some(existing) = self.associations.get(&thread) {
            return Err(TransactionError::ResumeFailed {
                transaction: transaction.to_string(),
                reason: format!("thread already associated with {}", *existing),
            });
        }
        self.associations.insert(thread, transaction);
        Ok(())
    }
}
