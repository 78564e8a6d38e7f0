//! Guarding cache population against stale reads.
//!
//! A put-from-load caches a value read from the source of truth. If the value
//! is removed or updated between that read and the cache put, the put would
//! store stale data. The validator closes that window:
//!
//! 1. after a cache miss, the reader registers a pending put;
//! 2. a removal or update invalidates the key, cancelling pending puts;
//! 3. before putting, the reader acquires the put-from-load lock, which is
//!    only granted if its pending put survived.
//!
//! A "naked" put, one with no prior registration, is granted only if neither
//! the key nor the whole region was invalidated recently.

use crate::transaction::{Transaction, TransactionManager};
use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

// ============================================================================
// CONFIG
// ============================================================================

/// Periods and lock waits used by [`PutFromLoadValidator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutFromLoadConfig {
    /// How long after an invalidation naked puts are refused.
    pub naked_put_invalidation_period: Duration,
    /// Pending puts older than this are forgotten.
    pub max_pending_put_delay: Duration,
    /// Wait for the per-key lock when acquiring a put-from-load lock.
    pub acquire_timeout: Duration,
    /// Wait for the per-key lock when registering a pending put.
    pub register_timeout: Duration,
    /// Wait for a put in progress before invalidating.
    pub invalidate_timeout: Duration,
}

impl Default for PutFromLoadConfig {
    fn default() -> Self {
        Self {
            naked_put_invalidation_period: Duration::from_secs(20),
            max_pending_put_delay: Duration::from_secs(120),
            acquire_timeout: Duration::from_millis(100),
            register_timeout: Duration::from_secs(10),
            invalidate_timeout: Duration::from_secs(60),
        }
    }
}

impl PutFromLoadConfig {
    pub fn with_naked_put_invalidation_period(mut self, period: Duration) -> Self {
        self.naked_put_invalidation_period = period;
        self
    }

    pub fn with_max_pending_put_delay(mut self, delay: Duration) -> Self {
        self.max_pending_put_delay = delay;
        self
    }

    pub fn with_lock_timeouts(
        mut self,
        acquire: Duration,
        register: Duration,
        invalidate: Duration,
    ) -> Self {
        self.acquire_timeout = acquire;
        self.register_timeout = register;
        self.invalidate_timeout = invalidate;
        self
    }
}

// ============================================================================
// OWNERSHIP
// ============================================================================

/// Who a pending put belongs to: the active transaction, else the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PutOwner {
    Transaction(Transaction),
    Thread(ThreadId),
}

#[derive(Debug, Default)]
struct KeyRecord {
    pending: HashMap<PutOwner, Instant>,
    invalidated_at: Option<Instant>,
}

impl KeyRecord {
    /// Nothing pending and no invalidation still in force.
    fn is_idle(&self, now: Instant, period: Duration) -> bool {
        self.pending.is_empty()
            && !self
                .invalidated_at
                .is_some_and(|t| now.duration_since(t) < period)
    }
}

type Records = DashMap<String, Arc<Mutex<KeyRecord>>>;

/// Drop the record of `key` if it is idle and nobody else holds it.
fn prune(records: &Records, key: &str, period: Duration) {
    records.remove_if(key, |_, record| {
        Arc::strong_count(record) == 1
            && record
                .try_lock()
                .is_some_and(|r| r.is_idle(Instant::now(), period))
    });
}

/// Exclusive right to put one key from a load. Released on drop.
pub struct PutFromLoadLock {
    key: String,
    guard: Option<ArcMutexGuard<RawMutex, KeyRecord>>,
    records: Arc<Records>,
    period: Duration,
}

impl PutFromLoadLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for PutFromLoadLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune(&self.records, &self.key, self.period);
    }
}

impl std::fmt::Debug for PutFromLoadLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PutFromLoadLock").field("key", &self.key).finish()
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

/// Tracks pending puts and invalidations for one region.
pub struct PutFromLoadValidator {
    config: PutFromLoadConfig,
    manager: Option<Arc<dyn TransactionManager>>,
    records: Arc<Records>,
    region_invalidated_at: Mutex<Option<Instant>>,
}

impl PutFromLoadValidator {
    pub fn new(manager: Option<Arc<dyn TransactionManager>>, config: PutFromLoadConfig) -> Self {
        Self {
            config,
            manager,
            records: Arc::new(DashMap::new()),
            region_invalidated_at: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PutFromLoadConfig {
        &self.config
    }

    /// Owner a pending put registered from the calling thread would get.
    pub fn current_owner(&self) -> PutOwner {
        match self.manager.as_ref().and_then(|tm| tm.current()) {
            Some(tx) => PutOwner::Transaction(tx),
            None => PutOwner::Thread(thread::current().id()),
        }
    }

    /// Number of pending puts across all keys.
    pub fn pending_put_count(&self) -> usize {
        self.records
            .iter()
            .map(|record| record.value().lock().pending.len())
            .sum()
    }

    fn record(&self, key: &str) -> Arc<Mutex<KeyRecord>> {
        if let Some(record) = self.records.get(key) {
            return Arc::clone(record.value());
        }
        Arc::clone(
            self.records
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(KeyRecord::default())))
                .value(),
        )
    }

    /// Record that the caller missed `key` and is about to load it.
    ///
    /// Returns false if the key's lock could not be taken in time.
    pub fn register_pending_put(&self, key: &str) -> bool {
        let now = Instant::now();
        let owner = self.current_owner();
        let record = self.record(key);

        let Some(mut guard) = record.try_lock_for(self.config.register_timeout) else {
            tracing::warn!(key, "Timed out registering pending put");
            return false;
        };
        guard.pending.insert(owner, now);
        drop(guard);

        self.cleanup(now);
        true
    }

    /// Acquire the right to put `key` from a load.
    ///
    /// Returns `None` if the caller's pending put was invalidated, if a naked
    /// put falls inside an invalidation period, or if the key's lock is held.
    pub fn acquire_put_from_load_lock(&self, key: &str) -> Option<PutFromLoadLock> {
        let now = Instant::now();
        let owner = self.current_owner();
        let record = self.record(key);

        let Some(mut guard) = record.try_lock_arc_for(self.config.acquire_timeout) else {
            tracing::debug!(key, "Put-from-load lock busy");
            return None;
        };

        let region_invalidated_at = *self.region_invalidated_at.lock();
        let valid = match guard.pending.remove(&owner) {
            Some(registered_at) => !region_invalidated_at.is_some_and(|t| registered_at <= t),
            None => self.naked_put_allowed(&guard, region_invalidated_at, now),
        };

        if valid {
            Some(PutFromLoadLock {
                key: key.to_string(),
                guard: Some(guard),
                records: Arc::clone(&self.records),
                period: self.config.naked_put_invalidation_period,
            })
        } else {
            drop(guard);
            drop(record);
            prune(&self.records, key, self.config.naked_put_invalidation_period);
            tracing::debug!(key, "Put from load refused after invalidation");
            None
        }
    }

    /// Explicit release; dropping the lock does the same.
    pub fn release_put_from_load_lock(&self, lock: PutFromLoadLock) {
        drop(lock);
    }

    /// Cancel pending puts for `key` and refuse naked puts for a while.
    ///
    /// Waits for a put in progress. Returns false if that wait timed out.
    pub fn invalidate_key(&self, key: &str) -> bool {
        let record = self.record(key);
        let Some(mut guard) = record.try_lock_for(self.config.invalidate_timeout) else {
            tracing::warn!(key, "Timed out waiting to invalidate key");
            return false;
        };
        guard.pending.clear();
        guard.invalidated_at = Some(Instant::now());
        true
    }

    /// Cancel every pending put and refuse naked puts for a while.
    ///
    /// Returns false if some key could not be invalidated in time.
    pub fn invalidate_region(&self) -> bool {
        *self.region_invalidated_at.lock() = Some(Instant::now());

        let records: Vec<Arc<Mutex<KeyRecord>>> = self
            .records
            .iter()
            .map(|record| Arc::clone(record.value()))
            .collect();

        let mut complete = true;
        for record in records {
            match record.try_lock_for(self.config.invalidate_timeout) {
                Some(mut guard) => guard.pending.clear(),
                None => complete = false,
            }
        }
        if !complete {
            tracing::warn!("Timed out invalidating some keys of the region");
        }
        complete
    }

    fn naked_put_allowed(
        &self,
        record: &KeyRecord,
        region_invalidated_at: Option<Instant>,
        now: Instant,
    ) -> bool {
        let period = self.config.naked_put_invalidation_period;
        let recent = |at: Option<Instant>| at.is_some_and(|t| now.duration_since(t) < period);
        !recent(record.invalidated_at) && !recent(region_invalidated_at)
    }

    /// Number of keys with a live record.
    pub fn tracked_key_count(&self) -> usize {
        self.records.len()
    }

    /// Forget stale pending puts and drop records nobody needs.
    fn cleanup(&self, now: Instant) {
        let max_delay = self.config.max_pending_put_delay;
        let period = self.config.naked_put_invalidation_period;

        self.records.retain(|_, record| {
            // Someone else holds a handle; leave it alone.
            if Arc::strong_count(record) > 1 {
                return true;
            }
            let Some(mut guard) = record.try_lock() else {
                return true;
            };
            guard
                .pending
                .retain(|_, registered_at| now.duration_since(*registered_at) < max_delay);
            !guard.is_idle(now, period)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::ThreadTransactionManager;

    fn fast_config() -> PutFromLoadConfig {
        PutFromLoadConfig::default()
            .with_naked_put_invalidation_period(Duration::from_millis(50))
            .with_lock_timeouts(
                Duration::from_millis(10),
                Duration::from_millis(10),
                Duration::from_millis(10),
            )
    }

    fn validator() -> PutFromLoadValidator {
        PutFromLoadValidator::new(None, fast_config())
    }

    #[test]
    fn test_naked_put_allowed_without_invalidation() {
        let v = validator();
        let lock = v.acquire_put_from_load_lock("k").unwrap();
        assert_eq!(lock.key(), "k");
    }

    #[test]
    fn test_registered_put_is_consumed() {
        let v = validator();
        assert!(v.register_pending_put("k"));
        assert_eq!(v.pending_put_count(), 1);
        let lock = v.acquire_put_from_load_lock("k");
        assert!(lock.is_some());
        drop(lock);
        assert_eq!(v.pending_put_count(), 0);
    }

    #[test]
    fn test_invalidated_pending_put_refused() {
        let v = validator();
        v.register_pending_put("k");
        assert!(v.invalidate_key("k"));
        assert!(v.acquire_put_from_load_lock("k").is_none());
    }

    #[test]
    fn test_naked_put_refused_until_period_passes() {
        let v = validator();
        v.invalidate_key("k");
        assert!(v.acquire_put_from_load_lock("k").is_none());
        assert!(v.acquire_put_from_load_lock("other").is_some());

        thread::sleep(Duration::from_millis(80));
        assert!(v.acquire_put_from_load_lock("k").is_some());
    }

    #[test]
    fn test_region_invalidation() {
        let v = validator();
        v.register_pending_put("a");
        assert!(v.invalidate_region());
        assert!(v.acquire_put_from_load_lock("a").is_none());
        assert!(v.acquire_put_from_load_lock("b").is_none());

        thread::sleep(Duration::from_millis(5));
        v.register_pending_put("a");
        assert!(v.acquire_put_from_load_lock("a").is_some());
    }

    #[test]
    fn test_invalidation_waits_for_held_lock() {
        let v = Arc::new(validator());
        let lock = v.acquire_put_from_load_lock("k").unwrap();

        let other = Arc::clone(&v);
        let invalidated = thread::spawn(move || other.invalidate_key("k")).join().unwrap();
        assert!(!invalidated);

        v.release_put_from_load_lock(lock);
        assert!(v.invalidate_key("k"));
    }

    #[test]
    fn test_owner_follows_transaction() {
        let tm = Arc::new(ThreadTransactionManager::new());
        let v = PutFromLoadValidator::new(
            Some(tm.clone() as Arc<dyn TransactionManager>),
            fast_config(),
        );
        assert!(matches!(v.current_owner(), PutOwner::Thread(_)));
        let tx = tm.begin().unwrap();
        assert_eq!(v.current_owner(), PutOwner::Transaction(tx));
    }

    #[test]
    fn test_released_locks_leave_no_records() {
        let v = validator();
        for i in 0..10_000 {
            let lock = v.acquire_put_from_load_lock(&format!("k{}", i));
            assert!(lock.is_some());
        }
        assert_eq!(v.tracked_key_count(), 0);

        v.register_pending_put("registered");
        drop(v.acquire_put_from_load_lock("registered"));
        assert_eq!(v.tracked_key_count(), 0);
    }

    #[test]
    fn test_invalidated_record_kept_while_in_force() {
        let v = validator();
        assert!(v.invalidate_key("k"));
        assert!(v.acquire_put_from_load_lock("k").is_none());
        assert_eq!(v.tracked_key_count(), 1);

        thread::sleep(Duration::from_millis(80));
        drop(v.acquire_put_from_load_lock("k"));
        assert_eq!(v.tracked_key_count(), 0);
    }

    #[test]
    fn test_stale_pending_puts_are_dropped() {
        let v = PutFromLoadValidator::new(
            None,
            fast_config().with_max_pending_put_delay(Duration::from_millis(10)),
        );
        v.register_pending_put("a");
        thread::sleep(Duration::from_millis(30));
        v.register_pending_put("b");
        assert_eq!(v.pending_put_count(), 1);
    }
}
