//! The pool key table: one worker pool per canonical profile.

use crate::pool::{PoolConfig, WorkerPool};
use cordon_core::{CapabilityProfile, Error, ImageRef, PoolKey, Result, VmConfig, VmRunner, pool_key};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Maps pool keys to pools, constructing them lazily.
///
/// Lookups take a read lock, so once a pool exists concurrent callers
/// never contend; only first creation serializes on the write lock, and
/// exactly one pool is ever constructed per key.
pub struct PoolManager {
    runner: Arc<dyn VmRunner>,
    pool_config: PoolConfig,
    cpus: u32,
    image: Option<ImageRef>,
    pools: RwLock<HashMap<PoolKey, Arc<WorkerPool>>>,
    shutting_down: AtomicBool,
}

impl PoolManager {
    pub fn new(
        runner: Arc<dyn VmRunner>,
        pool_config: PoolConfig,
        cpus: u32,
        image: Option<ImageRef>,
    ) -> Result<Self> {
        pool_config.validate()?;
        if cpus == 0 {
            return Err(Error::InvalidConfig("cpus must be at least 1".into()));
        }
        Ok(Self {
            runner,
            pool_config,
            cpus,
            image,
            pools: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Returns the pool for a profile, constructing it on first use.
    ///
    /// Idempotent and safe under concurrent first use: all callers
    /// observe the same instance.
    pub fn get_or_create(&self, profile: &CapabilityProfile) -> Result<Arc<WorkerPool>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let key = pool_key(profile)?;

        if let Some(pool) = self.pools.read().unwrap().get(&key) {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.pools.write().unwrap();
        // A racing caller may have created it between the locks.
        if let Some(pool) = pools.get(&key) {
            return Ok(Arc::clone(pool));
        }

        tracing::info!(pool = %key.short(), "creating worker pool");
        let vm_config = VmConfig::from_profile(profile, self.cpus, self.image.clone());
        let pool = WorkerPool::new(
            profile.clone(),
            key,
            self.pool_config.clone(),
            vm_config,
            Arc::clone(&self.runner),
        )?;
        pools.insert(key, Arc::clone(&pool));
        Ok(pool)
    }

    /// Number of live pools.
    pub fn pool_count(&self) -> usize {
        self.pools.read().unwrap().len()
    }

    /// Drains every pool: no new acquisitions, waiters cancelled with
    /// [`Error::Shutdown`], VMs killed, snapshots dropped. Idempotent.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let pools: Vec<Arc<WorkerPool>> = self.pools.write().unwrap().drain().map(|(_, p)| p).collect();
        futures::future::join_all(pools.iter().map(|pool| pool.shutdown())).await;
    }
}
