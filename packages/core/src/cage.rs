// ============================================================================
// File: packages/core/src/cage.rs
// ----------------------------------------------------------------------------
// Cage: the process-wide entry point wiring ModuleLoader, SharedPoolRegistry
// and the per-resource ParticipantWorkerPools together, the way §2's
// "component overview" table describes a single running process hosting all
// of this. One Cage per process; immortal once built.
// ============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::config::ResourceConfig;
use crate::error::{CoordinatorError, PoolError};
use crate::module_loader::ModuleLoader;
use crate::pool::{ResourcePool, SharedPoolRegistry, Sweeper};
use crate::request_context::RequestContext;
use crate::resource::ResourceInstance;
use crate::transaction::{Participant, ParticipantWorkerPool, Transaction, execute_single};

pub type ResourceFactoryFn = dyn Fn(&ResourceConfig) -> Arc<dyn ResourceInstance> + Send + Sync;

struct ResourceBinding {
    pool: Arc<ResourcePool>,
    workers: Arc<ParticipantWorkerPool>,
}

/// One running cage process: the module loader, the pool registry, and the
/// worker pools backing every registered resource.
pub struct Cage {
    pub module_loader: ModuleLoader,
    config_dir: PathBuf,
    sweeper: Arc<Sweeper>,
    bindings: Mutex<HashMap<String, Arc<ResourceBinding>>>,
    request_timeout: Duration,
}

impl Cage {
    pub fn new(module_search_dirs: Vec<PathBuf>, config_dir: PathBuf, sweep_period: Duration, request_timeout: Duration) -> Self {
        Self {
            module_loader: ModuleLoader::new(module_search_dirs, Duration::from_secs(1)),
            config_dir,
            sweeper: Sweeper::new(sweep_period),
            bindings: Mutex::new(HashMap::new()),
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Registers a resource name with a factory, loading its config file and
    /// constructing the `(ResourcePool, ParticipantWorkerPool)` pair through
    /// `SharedPoolRegistry`, same as `§4.7`'s lazily-created, immortal
    /// process-wide map.
    pub fn register_resource(&self, name: &str, factory: Arc<ResourceFactoryFn>) -> anyhow::Result<()> {
        let (base, suffix) = SharedPoolRegistry::split_name(name);
        let mut config = ResourceConfig::load(&self.config_dir, base).unwrap_or_default();
        if let Some(suffix) = suffix {
            config.resource_name = Some(suffix.to_string());
        }

        let pool_size = config.pool_size;
        let pool = SharedPoolRegistry::global().get_or_create(name, || {
            let cache = config.cache_size.map(|size| {
                crate::cache::ReadWriteCache::new(size, config.cache_policy, config.cache_default_ttl, config.cache_evict_period, config.cache_group_interval)
            });
            let factory = Arc::clone(&factory);
            let config_for_factory = config.clone();
            ResourcePool::new(
                name.to_string(),
                Arc::new(move || factory(&config_for_factory)),
                config.pool_size,
                config.pool_standby,
                cache,
            )
        });
        self.sweeper.register(Arc::clone(&pool));

        let workers = Arc::new(ParticipantWorkerPool::new(pool_size));

        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::new(ResourceBinding { pool, workers }));
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<(Arc<ResourcePool>, Arc<ParticipantWorkerPool>), CoordinatorError> {
        let bindings = self.bindings.lock().unwrap_or_else(|e| e.into_inner());
        let binding = bindings
            .get(name)
            .ok_or_else(|| CoordinatorError::Resource(crate::error::ResourceError::new(format!("unknown resource '{name}'"), true, true)))?;
        Ok((Arc::clone(&binding.pool), Arc::clone(&binding.workers)))
    }

    /// Builds a `Transaction` bound to this cage's resolver; callers attach
    /// participants and call `execute`.
    pub fn transaction(&self, source_module: &str) -> Transaction {
        Transaction::new(source_module)
    }

    pub fn execute(&self, xa: Transaction, ctx: &RequestContext) -> Result<Value, CoordinatorError> {
        xa.execute(ctx, |name| self.resolve(name))
    }

    /// Single-participant shortcut sugar: `resource_name.attr_chain(args)`
    /// executed directly, unwrapped from its singleton tuple.
    pub fn call(&self, source_module: &str, participant: Participant, ctx: &RequestContext) -> Result<Value, CoordinatorError> {
        execute_single(participant, source_module, ctx, |name| self.resolve(name))
    }

    pub fn spawn_sweeper(self: &Arc<Self>) {
        Arc::clone(&self.sweeper).spawn();
    }

    pub fn stop(&self) {
        SharedPoolRegistry::global().stop_all();
    }

    pub fn pool_error_for(name: &str) -> PoolError {
        PoolError::Empty(name.to_string())
    }
}
