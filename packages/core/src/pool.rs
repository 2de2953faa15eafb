// ============================================================================
// File: packages/core/src/pool.rs
// ----------------------------------------------------------------------------
// ResourcePool: a fixed-size LIFO free-list of connectable instances for one
// logical resource name, plus background sweep/warmup/stop. Grounded
// directly in resource_pool.py's ResourcePool/RegisteredResourcePool: the
// free/busy bookkeeping lives under one mutex, connect/disconnect always run
// outside it, and sweep/warmup/stop are each single-permit operations.
// ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, TryLockError};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::cache::ReadWriteCache;
use crate::error::PoolError;
use crate::resource::ResourceInstance;

/// Slack above `size` the busy list may transiently hold while a sweep or
/// warmup pass is moving an instance between free and busy. Fixed at 2,
/// named rather than hard-coded inline.
pub const POOL_SLACK: usize = 2;

/// Produces a fresh, unconnected `ResourceInstance` for a pool, given the
/// config map passed through from the resource's config file.
pub type ResourceFactory = dyn Fn() -> Arc<dyn ResourceInstance> + Send + Sync;

struct Lists {
    free: Vec<Arc<dyn ResourceInstance>>,
    busy: Vec<Arc<dyn ResourceInstance>>,
}

/// A fixed-cap pool of resource instances for one logical resource name.
pub struct ResourcePool {
    name: String,
    factory: Arc<ResourceFactory>,
    size: usize,
    standby: usize,
    lists: Mutex<Lists>,
    stopped: std::sync::atomic::AtomicBool,
    cache: Option<ReadWriteCache>,
    sweep_permit: Mutex<()>,
    warmup_permit: Mutex<()>,
    stop_permit: Mutex<()>,
    self_ref: std::sync::Weak<ResourcePool>,
}

impl ResourcePool {
    /// Always Arc-wrapped: warmup needs a 'static handle on itself to spawn
    /// its background thread from, so the pool keeps a `Weak` back-reference
    /// set at construction via `Arc::new_cyclic`.
    pub fn new(name: impl Into<String>, factory: Arc<ResourceFactory>, size: usize, standby: usize, cache: Option<ReadWriteCache>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak| Self {
            name,
            factory,
            size,
            standby: standby.min(size),
            lists: Mutex::new(Lists {
                free: Vec::with_capacity(size),
                busy: Vec::with_capacity(size + POOL_SLACK),
            }),
            stopped: std::sync::atomic::AtomicBool::new(false),
            cache,
            sweep_permit: Mutex::new(()),
            warmup_permit: Mutex::new(()),
            stop_permit: Mutex::new(()),
            self_ref: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn cache(&self) -> Option<&ReadWriteCache> {
        self.cache.as_ref()
    }

    pub fn free_count(&self) -> usize {
        self.lists.lock().unwrap_or_else(|e| e.into_inner()).free.len()
    }

    pub fn busy_count(&self) -> usize {
        self.lists.lock().unwrap_or_else(|e| e.into_inner()).busy.len()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Returns a connected, non-expired instance, or `PoolError::Empty` /
    /// `PoolError::Stopped`.
    ///
    /// 1. Under the pool mutex, pop from free LIFO; if expired, push to busy
    ///    (so its slot is held while we disconnect outside the mutex) and
    ///    loop.
    /// 2. If free is empty and busy has room, create via the factory, push
    ///    to busy, release the mutex, connect outside it; on failure, re-lock
    ///    and remove from busy, propagate the error.
    /// 3. Each successful allocate schedules a background warmup if
    ///    `|free| < standby` and `|free|+|busy| < size`.
    pub fn allocate(&self) -> Result<Arc<dyn ResourceInstance>, PoolError> {
        if self.is_stopped() {
            return Err(PoolError::Stopped(self.name.clone()));
        }

        loop {
            enum Step {
                Got(Arc<dyn ResourceInstance>),
                NeedsDisconnect(Arc<dyn ResourceInstance>),
                NeedsConnect(Arc<dyn ResourceInstance>),
                Empty,
            }

            let step = {
                let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(candidate) = lists.free.pop() {
                    if candidate.lifecycle().expired() {
                        lists.busy.push(Arc::clone(&candidate));
                        Step::NeedsDisconnect(candidate)
                    } else {
                        lists.busy.push(Arc::clone(&candidate));
                        Step::Got(candidate)
                    }
                } else if lists.busy.len() < self.size {
                    let fresh = (self.factory)();
                    lists.busy.push(Arc::clone(&fresh));
                    Step::NeedsConnect(fresh)
                } else {
                    Step::Empty
                }
            };

            match step {
                Step::Got(instance) => {
                    self.maybe_spawn_warmup();
                    return Ok(instance);
                }
                Step::NeedsDisconnect(instance) => {
                    instance.disconnect();
                    let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
                    lists.busy.retain(|r| !Arc::ptr_eq(r, &instance));
                    continue;
                }
                Step::NeedsConnect(instance) => {
                    match instance.connect() {
                        Ok(()) => {
                            instance.lifecycle().mark_connected();
                            self.maybe_spawn_warmup();
                            return Ok(instance);
                        }
                        Err(e) => {
                            let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
                            lists.busy.retain(|r| !Arc::ptr_eq(r, &instance));
                            instance.lifecycle().mark_gone();
                            return Err(PoolError::FactoryFailed(e.description));
                        }
                    }
                }
                Step::Empty => return Err(PoolError::Empty(self.name.clone())),
            }
        }
    }

    /// Moves `instance` from busy to free (if not expired) or disconnects it
    /// (outside the mutex) and drops it if expired. Schedules warmup either
    /// way.
    pub fn release(&self, instance: Arc<dyn ResourceInstance>) {
        let expired = instance.lifecycle().expired();
        {
            let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
            lists.busy.retain(|r| !Arc::ptr_eq(r, &instance));
            if !expired {
                lists.free.push(instance.clone());
            }
        }
        if expired {
            instance.disconnect();
        }
        self.maybe_spawn_warmup();
    }

    /// Schedules, rather than runs, a warmup pass: spawns one light thread
    /// per invocation (the thread itself single-flights via `warmup_permit`,
    /// so a burst of these collapses to one active warmer).
    fn maybe_spawn_warmup(&self) {
        let (free, busy) = {
            let lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
            (lists.free.len(), lists.busy.len())
        };
        if free < self.standby && free + busy < self.size {
            match self.self_ref.upgrade() {
                Some(handle) => {
                    thread::spawn(move || handle.warmup());
                }
                None => self.warmup(),
            }
        }
    }

    /// Background: while `|free| < standby`, pool not stopped, and there is
    /// room, create+connect+release one instance at a time. A connect
    /// failure terminates the attempt silently (sweeper/warmer never
    /// surface errors).
    pub fn warmup(&self) {
        let _permit = match self.warmup_permit.try_lock() {
            Ok(p) => p,
            Err(TryLockError::WouldBlock) => return,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        loop {
            if self.is_stopped() {
                return;
            }
            let (free, busy) = {
                let lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
                (lists.free.len(), lists.busy.len())
            };
            if !(free < self.standby && free + busy < self.size) {
                return;
            }

            let fresh = (self.factory)();
            {
                let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
                lists.busy.push(Arc::clone(&fresh));
            }
            match fresh.connect() {
                Ok(()) => {
                    fresh.lifecycle().mark_connected();
                    self.release(fresh);
                }
                Err(e) => {
                    warn!("warmup of pool '{}' failed to connect a new instance: {}", self.name, e.description);
                    let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
                    lists.busy.retain(|r| !Arc::ptr_eq(r, &fresh));
                    fresh.lifecycle().mark_gone();
                    return;
                }
            }
        }
    }

    /// Background: repeatedly pick any expired instance from free,
    /// atomically move it to busy, drop the mutex, disconnect it, re-lock
    /// and remove it from busy. Also triggers a warmup pass.
    pub fn sweep(&self) {
        let _permit = match self.sweep_permit.try_lock() {
            Ok(p) => p,
            Err(TryLockError::WouldBlock) => return,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        loop {
            let candidate = {
                let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
                let pos = lists.free.iter().position(|r| r.lifecycle().expired());
                match pos {
                    Some(i) => {
                        let r = lists.free.remove(i);
                        lists.busy.push(Arc::clone(&r));
                        Some(r)
                    }
                    None => None,
                }
            };

            let Some(instance) = candidate else { break };
            instance.disconnect();
            let mut lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
            lists.busy.retain(|r| !Arc::ptr_eq(r, &instance));
        }

        debug!("pool '{}' sweep complete: {} free, {} busy", self.name, self.free_count(), self.busy_count());
        drop(_permit);
        self.warmup();
    }

    /// Sets the stopped latch, marks all current instances expired, then
    /// runs a final sweep.
    pub fn stop(&self) {
        let _permit = match self.stop_permit.try_lock() {
            Ok(p) => p,
            Err(TryLockError::WouldBlock) => return,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        {
            let lists = self.lists.lock().unwrap_or_else(|e| e.into_inner());
            for r in lists.free.iter().chain(lists.busy.iter()) {
                r.lifecycle().expire();
            }
        }
        info!("pool '{}' stopping", self.name);
        drop(_permit);
        self.sweep();
    }
}

/// Owns the background sweeper thread shared by all registered pools,
/// visiting each at an amortized interval of `sweep_period / pool_count`.
pub struct Sweeper {
    pools: Mutex<Vec<Arc<ResourcePool>>>,
    period: Duration,
}

impl Sweeper {
    pub fn new(period: Duration) -> Arc<Self> {
        Arc::new(Self { pools: Mutex::new(Vec::new()), period })
    }

    pub fn register(&self, pool: Arc<ResourcePool>) {
        self.pools.lock().unwrap_or_else(|e| e.into_inner()).push(pool);
    }

    /// Spawns the single heavy sweeper thread. The returned `JoinHandle` is
    /// detached by the caller (the thread runs for the process lifetime).
    pub fn spawn(self: Arc<Self>) -> thread::JoinHandle<()> {
        thread::spawn(move || loop {
            let pools: Vec<Arc<ResourcePool>> = self.pools.lock().unwrap_or_else(|e| e.into_inner()).clone();
            if pools.is_empty() {
                thread::sleep(self.period);
                continue;
            }
            let per_pool = self.period / pools.len() as u32;
            for pool in pools {
                pool.sweep();
                thread::sleep(per_pool);
            }
        })
    }
}

/// Process-wide registry dispensing `(resource_pool)` by name, created
/// lazily on first access and immortal thereafter. A name containing a
/// double-underscore (`rpc__cagename`) loads the base config under the
/// prefix and injects the suffix as a constructor parameter, so one config
/// file backs many per-target pools.
pub struct SharedPoolRegistry {
    pools: Mutex<HashMap<String, Arc<ResourcePool>>>,
}

static REGISTRY: OnceLock<SharedPoolRegistry> = OnceLock::new();

impl SharedPoolRegistry {
    pub fn global() -> &'static SharedPoolRegistry {
        REGISTRY.get_or_init(|| SharedPoolRegistry { pools: Mutex::new(HashMap::new()) })
    }

    /// Splits `name` on the first `__` into (base, suffix). Used by callers
    /// that need to load `config_resource_<base>.toml` and inject `suffix`
    /// as `pool__resource_name`.
    pub fn split_name(name: &str) -> (&str, Option<&str>) {
        match name.split_once("__") {
            Some((base, suffix)) => (base, Some(suffix)),
            None => (name, None),
        }
    }

    /// Returns the existing pool for `name`, or inserts `make()`'s result if
    /// absent. `make` is only invoked while the registry's own short-held
    /// lock is taken, matching spec §5's "registry locks held only around
    /// map insert".
    pub fn get_or_create(&self, name: &str, make: impl FnOnce() -> Arc<ResourcePool>) -> Arc<ResourcePool> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools.entry(name.to_string()).or_insert_with(make).clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResourcePool>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }

    pub fn stop_all(&self) {
        let pools: Vec<Arc<ResourcePool>> = self.pools.lock().unwrap_or_else(|e| e.into_inner()).values().cloned().collect();
        for pool in pools {
            pool.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResourceError;
    use crate::request_context::RequestContext;
    use crate::resource::{next_instance_name, Lifecycle, TransactionContext};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestResource {
        name: String,
        lifecycle: Lifecycle,
        connect_calls: AtomicUsize,
    }

    impl TestResource {
        fn factory(pool_name: &'static str) -> Arc<ResourceFactory> {
            Arc::new(move || {
                Arc::new(TestResource {
                    name: next_instance_name(pool_name),
                    lifecycle: Lifecycle::new(Duration::from_secs(60), Duration::from_secs(3600), Duration::ZERO, None),
                    connect_calls: AtomicUsize::new(0),
                }) as Arc<dyn ResourceInstance>
            })
        }
    }

    impl ResourceInstance for TestResource {
        fn name(&self) -> &str {
            &self.name
        }
        fn pool_name(&self) -> &str {
            "test"
        }
        fn lifecycle(&self) -> &Lifecycle {
            &self.lifecycle
        }
        fn connect(&self) -> Result<(), ResourceError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn disconnect(&self) {}
        fn begin_transaction(&self, _ctx: TransactionContext) -> Result<(), ResourceError> {
            self.lifecycle.mark_in_transaction();
            Ok(())
        }
        fn commit(&self) -> Result<(), ResourceError> {
            self.lifecycle.mark_idle();
            Ok(())
        }
        fn rollback(&self) -> Result<(), ResourceError> {
            self.lifecycle.mark_idle();
            Ok(())
        }
        fn call(&self, _m: &str, _a: &[serde_json::Value], _k: &serde_json::Map<String, serde_json::Value>, _ctx: &RequestContext) -> Result<serde_json::Value, ResourceError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn allocate_respects_size_cap() {
        let pool = ResourcePool::new("p", TestResource::factory("p"), 1, 0, None);
        let a = pool.allocate().unwrap();
        assert!(matches!(pool.allocate(), Err(PoolError::Empty(_))));
        pool.release(a);
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn free_list_is_reused_lifo() {
        let pool = ResourcePool::new("p", TestResource::factory("p"), 2, 0, None);
        let a = pool.allocate().unwrap();
        let name_a = a.name().to_string();
        pool.release(a);
        let b = pool.allocate().unwrap();
        assert_eq!(b.name(), name_a);
    }

    #[test]
    fn expired_instance_is_not_reused() {
        let pool = ResourcePool::new("p", TestResource::factory("p"), 1, 0, None);
        let a = pool.allocate().unwrap();
        let name_a = a.name().to_string();
        a.lifecycle().expire();
        pool.release(a);
        let b = pool.allocate().unwrap();
        assert_ne!(b.name(), name_a);
    }

    #[test]
    fn stop_marks_everything_expired() {
        let pool = ResourcePool::new("p", TestResource::factory("p"), 2, 0, None);
        let a = pool.allocate().unwrap();
        pool.release(a.clone());
        pool.stop();
        assert!(a.lifecycle().expired());
        assert!(matches!(pool.allocate(), Err(PoolError::Stopped(_))));
    }

    #[test]
    fn registry_splits_double_underscore_names() {
        let (base, suffix) = SharedPoolRegistry::split_name("rpc__cagename");
        assert_eq!(base, "rpc");
        assert_eq!(suffix, Some("cagename"));
        let (base, suffix) = SharedPoolRegistry::split_name("plain");
        assert_eq!(base, "plain");
        assert_eq!(suffix, None);
    }

    #[test]
    fn registry_is_insert_once() {
        let registry = SharedPoolRegistry::global();
        let made = std::sync::atomic::AtomicUsize::new(0);
        for _ in 0..3 {
            registry.get_or_create("pool-registry-test-unique", || {
                made.fetch_add(1, Ordering::SeqCst);
                ResourcePool::new("pool-registry-test-unique", TestResource::factory("p"), 1, 0, None)
            });
        }
        assert_eq!(made.load(Ordering::SeqCst), 1);
    }
}
