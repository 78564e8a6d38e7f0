//! Region factory.
//!
//! The factory owns the engine handle, the optional transaction manager and
//! the configuration, and hands out one [`CacheRegion`] per region name. It is
//! an explicit object with a `start`/`stop` lifecycle; nothing is global.

use crate::access::TransactionalAccess;
use crate::adapter::CacheAdapter;
use crate::engine::ClusteredCache;
use crate::facade::CacheOperationFacade;
use crate::put_from_load::{PutFromLoadConfig, PutFromLoadValidator};
use crate::region::{Region, RegionLifecycleManager};
use crate::transaction::TransactionManager;
use crate::tx_guard::TransactionScopeGuard;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use keel_core::{
    Capabilities, KeelError, KeelResult, RegionAdminError, RegionFactoryConfig,
    RegionNameCodec, RegionType, TypeOverrides,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const NEW: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

// ============================================================================
// CACHE REGION
// ============================================================================

/// A built region: its facade, settings and put-from-load validator.
#[derive(Clone)]
pub struct CacheRegion {
    region_type: RegionType,
    settings: TypeOverrides,
    facade: CacheOperationFacade,
    validator: Arc<PutFromLoadValidator>,
}

impl std::fmt::Debug for CacheRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegion")
            .field("region_type", &self.region_type)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CacheRegion {
    pub fn region_type(&self) -> RegionType {
        self.region_type
    }

    /// Resolved settings this region was built with.
    pub fn settings(&self) -> &TypeOverrides {
        &self.settings
    }

    pub fn region(&self) -> &Arc<Region> {
        self.facade.region()
    }

    pub fn facade(&self) -> &CacheOperationFacade {
        &self.facade
    }

    /// Transactional access guarded by this region's validator.
    pub fn access(&self) -> TransactionalAccess {
        TransactionalAccess::new(self.facade.clone(), Arc::clone(&self.validator))
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Builds and owns the regions of one process.
pub struct RegionFactory {
    config: RegionFactoryConfig,
    adapter: CacheAdapter,
    transactions: Option<Arc<dyn TransactionManager>>,
    lifecycle: Arc<RegionLifecycleManager>,
    put_from_load: PutFromLoadConfig,
    regions: DashMap<String, CacheRegion>,
    state: AtomicU8,
}

impl RegionFactory {
    pub fn new(
        cache: Arc<dyn ClusteredCache>,
        transactions: Option<Arc<dyn TransactionManager>>,
        config: RegionFactoryConfig,
    ) -> Self {
        let adapter = CacheAdapter::new(cache);
        let guard = TransactionScopeGuard::new(transactions.clone());
        let lifecycle = Arc::new(RegionLifecycleManager::new(adapter.clone(), guard));
        Self {
            config,
            adapter,
            transactions,
            lifecycle,
            put_from_load: PutFromLoadConfig::default(),
            regions: DashMap::new(),
            state: AtomicU8::new(NEW),
        }
    }

    /// Override the put-from-load periods used by regions built afterwards.
    pub fn with_put_from_load_config(mut self, config: PutFromLoadConfig) -> Self {
        self.put_from_load = config;
        self
    }

    pub fn config(&self) -> &RegionFactoryConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<RegionLifecycleManager> {
        &self.lifecycle
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Validate the configuration and start accepting region builds.
    ///
    /// Starting a running factory does nothing; a stopped factory cannot be
    /// restarted.
    pub fn start(&self) -> KeelResult<()> {
        self.config.validate()?;
        match self
            .state
            .compare_exchange(NEW, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let topology = self.adapter.topology()?;
                if let Some(timeout) = self.config.lock_acquisition_timeout {
                    self.adapter.set_lock_acquisition_timeout(timeout)?;
                }
                tracing::debug!(
                    cache = %self.adapter.cache_name(),
                    topology = %topology,
                    prefix = ?self.config.region_prefix,
                    lock_acquisition_timeout = ?self.config.lock_acquisition_timeout,
                    "Started region factory"
                );
                Ok(())
            }
            Err(RUNNING) => Ok(()),
            Err(_) => Err(RegionAdminError::FactoryNotRunning {
                reason: "factory has been stopped".to_string(),
            }
            .into()),
        }
    }

    /// Destroy every region and stop. Stopping twice does nothing.
    pub fn stop(&self) {
        let previous = self.state.swap(STOPPED, Ordering::AcqRel);
        if previous == STOPPED {
            return;
        }

        let names: Vec<String> = self.regions.iter().map(|r| r.key().clone()).collect();
        for name in names {
            if let Some((_, built)) = self.regions.remove(&name) {
                self.lifecycle.destroy(built.region());
            }
        }
        tracing::debug!(cache = %self.adapter.cache_name(), "Stopped region factory");
    }

    /// Timestamp with 100 ms resolution, used to order cache writes.
    pub fn next_timestamp(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() / 100
    }

    pub fn region(&self, name: &str) -> Option<CacheRegion> {
        self.regions.get(name).map(|r| r.value().clone())
    }

    pub fn region_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.regions.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------------

    pub fn build_entity_region(&self, name: &str) -> KeelResult<CacheRegion> {
        self.build_region(name, RegionType::Entity)
    }

    pub fn build_immutable_entity_region(&self, name: &str) -> KeelResult<CacheRegion> {
        self.build_region(name, RegionType::ImmutableEntity)
    }

    pub fn build_collection_region(&self, name: &str) -> KeelResult<CacheRegion> {
        self.build_region(name, RegionType::Collection)
    }

    pub fn build_natural_id_region(&self, name: &str) -> KeelResult<CacheRegion> {
        self.build_region(name, RegionType::NaturalId)
    }

    pub fn build_query_results_region(&self, name: &str) -> KeelResult<CacheRegion> {
        self.build_region(name, RegionType::QueryResults)
    }

    pub fn build_timestamps_region(&self, name: &str) -> KeelResult<CacheRegion> {
        self.build_region(name, RegionType::Timestamps)
    }

    /// Build (or return the already built) region `name` of `region_type`.
    ///
    /// Activation runs without holding the region map, so concurrent builds
    /// of one name may both activate; the first to register wins and the
    /// other handle is dropped. Both share the same anchor.
    pub fn build_region(&self, name: &str, region_type: RegionType) -> KeelResult<CacheRegion> {
        if !self.is_running() {
            return Err(not_running(name));
        }
        if let Some(existing) = self.regions.get(name) {
            return reuse(name, existing.value(), region_type);
        }

        let created = self.create_region(name, region_type)?;
        let built = match self.regions.entry(name.to_string()) {
            Entry::Occupied(existing) => reuse(name, existing.get(), region_type)?,
            Entry::Vacant(slot) => slot.insert(created).value().clone(),
        };

        // A stop that ran while we were activating may have missed us.
        if !self.is_running() {
            if let Some((_, stranded)) = self.regions.remove(name) {
                self.lifecycle.destroy(stranded.region());
            }
            return Err(not_running(name));
        }
        Ok(built)
    }

    fn create_region(&self, name: &str, region_type: RegionType) -> KeelResult<CacheRegion> {
        let settings = self.config.resolve(name, region_type)?;
        let prefix = self.config.region_prefix.as_deref();

        let root = RegionNameCodec::qualify(name, prefix);
        self.adapter.define_region(&root, &settings)?;

        let region = self.lifecycle.activate(name, prefix)?;
        let mut facade = CacheOperationFacade::new(region, Arc::clone(&self.lifecycle));

        // Query results are never invalidated cluster-wide.
        if region_type == RegionType::QueryResults && self.adapter.topology()?.is_invalidation() {
            facade = facade.with_capabilities(Capabilities::CACHE_MODE_LOCAL);
        }

        let validator = Arc::new(PutFromLoadValidator::new(
            self.transactions.clone(),
            self.put_from_load.clone(),
        ));

        tracing::debug!(
            region = %root,
            region_type = %region_type,
            cache_name = ?settings.cache_name,
            "Built cache region"
        );

        Ok(CacheRegion {
            region_type,
            settings,
            facade,
            validator,
        })
    }
}

fn not_running(name: &str) -> KeelError {
    RegionAdminError::FactoryNotRunning {
        reason: format!("cannot build region {}", name),
    }
    .into()
}

fn reuse(name: &str, built: &CacheRegion, region_type: RegionType) -> KeelResult<CacheRegion> {
    if built.region_type != region_type {
        return Err(RegionAdminError::ActivationFailed {
            region: name.to_string(),
            reason: format!(
                "already built as a {} region, requested {}",
                built.region_type, region_type
            ),
        }
        .into());
    }
    Ok(built.clone())
}

impl Drop for RegionFactory {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) == RUNNING {
            self.stop();
        }
    }
}
