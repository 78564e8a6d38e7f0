//! Running administrative work outside the ambient transaction.

use crate::transaction::{Transaction, TransactionManager};
use keel_core::{KeelResult, RegionAdminError, TransactionError};
use std::sync::Arc;

/// Suspends the caller's transaction around a body of administrative work.
///
/// The suspended transaction is resumed on every exit path: normal return,
/// an error from the body, or a panic unwinding through it.
#[derive(Clone, Default)]
pub struct TransactionScopeGuard {
    manager: Option<Arc<dyn TransactionManager>>,
}

impl TransactionScopeGuard {
    pub fn new(manager: Option<Arc<dyn TransactionManager>>) -> Self {
        Self { manager }
    }

    /// A guard with no transaction manager; bodies run unchanged.
    pub fn without_transactions() -> Self {
        Self::default()
    }

    pub fn manager(&self) -> Option<&Arc<dyn TransactionManager>> {
        self.manager.as_ref()
    }

    /// Run `body` with the calling thread's transaction suspended.
    ///
    /// A failed suspend is a [`RegionAdminError`] and `body` does not run. If
    /// both `body` and the resume fail, the body's error is returned and the
    /// resume failure is logged.
    pub fn run_suspended<T, F>(&self, body: F) -> KeelResult<T>
    where
        F: FnOnce() -> KeelResult<T>,
    {
        let Some(manager) = self.manager.as_deref() else {
            return body();
        };

        let suspended = manager
            .suspend()
            .map_err(RegionAdminError::Transaction)?;
        let mut resume = ResumeOnExit {
            manager,
            transaction: suspended,
        };

        let result = body();

        match (result, resume.resume_now()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(resume_err)) => Err(RegionAdminError::Transaction(resume_err).into()),
            (Err(body_err), Ok(())) => Err(body_err),
            (Err(body_err), Err(resume_err)) => {
                tracing::error!(
                    error = %resume_err,
                    cause = %body_err,
                    "Failed to resume transaction after administrative operation failed"
                );
                Err(body_err)
            }
        }
    }
}

/// Resumes the suspended transaction when dropped, unless already resumed.
struct ResumeOnExit<'a> {
    manager: &'a dyn TransactionManager,
    transaction: Option<Transaction>,
}

impl ResumeOnExit<'_> {
    fn resume_now(&mut self) -> Result<(), TransactionError> {
        match self.transaction.take() {
            Some(tx) => self.manager.resume(tx),
            None => Ok(()),
        }
    }
}

impl Drop for ResumeOnExit<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.transaction.take() {
            if let Err(e) = self.manager.resume(tx) {
                tracing::error!(
                    transaction = %tx,
                    error = %e,
                    "Failed to resume transaction while unwinding"
                );
            }
        }
    }
}
