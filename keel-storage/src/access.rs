//! Transactional access to a region's data.
//!
//! Combines a [`CacheOperationFacade`] with a [`PutFromLoadValidator`] so
//! that reads populate the cache only when no concurrent write invalidated
//! what was read.

use crate::engine::CacheValue;
use crate::facade::CacheOperationFacade;
use crate::put_from_load::PutFromLoadValidator;
use keel_core::{CacheOperationError, Capabilities, KeelError, KeelResult};
use std::sync::Arc;

/// Read-through and write-invalidate access to one region.
#[derive(Clone)]
pub struct TransactionalAccess {
    facade: CacheOperationFacade,
    validator: Arc<PutFromLoadValidator>,
}

impl TransactionalAccess {
    pub fn new(facade: CacheOperationFacade, validator: Arc<PutFromLoadValidator>) -> Self {
        Self { facade, validator }
    }

    pub fn facade(&self) -> &CacheOperationFacade {
        &self.facade
    }

    pub fn validator(&self) -> &Arc<PutFromLoadValidator> {
        &self.validator
    }

    /// Read a key. A miss registers a pending put for the coming load.
    pub fn get(&self, key: &str) -> KeelResult<Option<CacheValue>> {
        let value = self.facade.get_allowing_timeout(key)?;
        if value.is_none() {
            self.validator.register_pending_put(key);
        }
        Ok(value)
    }

    /// Cache a value just loaded from the source of truth.
    ///
    /// Returns false if the put was refused: the key was invalidated since
    /// the miss, the lock was busy, or `minimal_put` found the key present.
    pub fn put_from_load(
        &self,
        key: &str,
        value: CacheValue,
        minimal_put: bool,
    ) -> KeelResult<bool> {
        let Some(lock) = self.validator.acquire_put_from_load_lock(key) else {
            tracing::trace!(key, "Put from load not allowed");
            return Ok(false);
        };

        let stored = if minimal_put
            && self.facade.contains_key(key, Capabilities::SKIP_CACHE_LOAD)?
        {
            false
        } else {
            self.facade.put_for_external_read(key, value)?
        };

        self.validator.release_put_from_load_lock(lock);
        Ok(stored)
    }

    /// Cache a newly inserted value.
    pub fn insert(&self, key: &str, value: CacheValue) -> KeelResult<()> {
        self.facade
            .put_with(key, value, Capabilities::SKIP_CACHE_LOAD)
            .map(|_| ())
    }

    /// Cache an updated value.
    pub fn update(&self, key: &str, value: CacheValue) -> KeelResult<()> {
        self.facade
            .put_with(key, value, Capabilities::SKIP_CACHE_LOAD)
            .map(|_| ())
    }

    /// Remove a key. Fails without touching the cache if a put from load in
    /// progress kept the key from being invalidated.
    pub fn remove(&self, key: &str) -> KeelResult<()> {
        self.invalidate_key(key, "remove")?;
        self.facade.remove(key).map(|_| ())
    }

    pub fn remove_all(&self) -> KeelResult<()> {
        self.invalidate_region("remove_all")?;
        self.facade.clear()
    }

    pub fn evict(&self, key: &str) -> KeelResult<()> {
        self.invalidate_key(key, "evict")?;
        self.facade.evict(key)
    }

    pub fn evict_all(&self) -> KeelResult<()> {
        self.invalidate_region("evict_all")?;
        self.facade.clear()
    }

    fn invalidate_key(&self, key: &str, operation: &'static str) -> KeelResult<()> {
        if self.validator.invalidate_key(key) {
            return Ok(());
        }
        Err(self.invalidation_failed(operation, format!("could not invalidate key {}", key)))
    }

    fn invalidate_region(&self, operation: &'static str) -> KeelResult<()> {
        if self.validator.invalidate_region() {
            return Ok(());
        }
        Err(self.invalidation_failed(operation, "could not invalidate every key".to_string()))
    }

    fn invalidation_failed(&self, operation: &'static str, reason: String) -> KeelError {
        CacheOperationError::Failed {
            region: self.facade.region().root().to_string(),
            operation,
            reason,
        }
        .into()
    }
}
