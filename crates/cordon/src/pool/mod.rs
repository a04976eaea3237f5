//! Per-profile pools of warm micro-VMs.
//!
//! A [`WorkerPool`] owns every VM for one capability profile: it boots or
//! restores them, hands them out one acquirer at a time, recycles them on
//! success, and kills them on any fault. Waiters are served in FIFO
//! order, and a VM released while the queue is non-empty goes to the head
//! waiter before it can re-enter the Ready set.
//!
//! Pool state sits behind a single mutex held only across O(1)
//! transitions; all waiting happens on oneshot channels outside the lock,
//! and all VM work (boot, restore, kill, install) happens in spawned
//! tasks.
//!
//! VM lifecycle:
//!
//! ```text
//! Booting ──ok──▶ Provisioning? ──ok──▶ Ready ──acquire──▶ InUse
//!    │                  │                   │                │
//!    │                  └──fail──▶ Dead     │                ├──ok/under-cap──▶ Ready
//!    └──fail──▶ Dead                        └──idle-reap──▶ Dead
//!                                                            └──fault/over-cap──▶ Tainted ──▶ Dead
//! ```

mod vm;

pub(crate) use vm::WorkerVm;

use crate::rpc::RpcClient;
use cordon_core::{CapabilityProfile, Error, PoolKey, Result, Snapshot, VmConfig, VmRunner};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tuning knobs for one worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Warm VMs the pool keeps available.
    pub min_size: usize,
    /// Hard ceiling on live VMs (ready + in use + booting).
    pub max_size: usize,
    /// Calls a VM may serve before it is retired.
    pub max_calls_per_vm: u32,
    /// Idle time after which surplus ready VMs are reaped.
    pub max_idle: Duration,
    /// Cadence of the replenish/reap task.
    pub maintenance_interval: Duration,
    /// Extra acquisition budget on top of a call's own deadline.
    pub pool_wait_slack: Duration,
    /// Bound on the dependency install step during provisioning.
    pub install_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            max_calls_per_vm: 64,
            max_idle: Duration::from_secs(30),
            maintenance_interval: Duration::from_millis(250),
            pool_wait_slack: Duration::from_millis(250),
            install_timeout: Duration::from_secs(120),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_max_calls_per_vm(mut self, max_calls: u32) -> Self {
        self.max_calls_per_vm = max_calls;
        self
    }

    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn with_pool_wait_slack(mut self, slack: Duration) -> Self {
        self.pool_wait_slack = slack;
        self
    }

    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::InvalidConfig("max_size must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(Error::InvalidConfig(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        if self.max_calls_per_vm == 0 {
            return Err(Error::InvalidConfig(
                "max_calls_per_vm must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// How a leased VM came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Call completed; result decoded.
    Ok,
    /// Guest function raised; the VM itself is healthy.
    RemoteException,
    Timeout,
    ProtocolError,
    RemoteCrash,
    Cancelled,
}

impl CallOutcome {
    /// Outcomes that leave the VM in an unknown state.
    pub fn taints(self) -> bool {
        !matches!(self, CallOutcome::Ok | CallOutcome::RemoteException)
    }

    /// Classifies the error a call surfaced.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::Timeout => CallOutcome::Timeout,
            Error::RemoteCrash => CallOutcome::RemoteCrash,
            Error::Cancelled => CallOutcome::Cancelled,
            Error::RemoteException { .. } => CallOutcome::RemoteException,
            _ => CallOutcome::ProtocolError,
        }
    }
}

/// Snapshot of pool occupancy, for observability and tests.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub ready: usize,
    pub in_use: usize,
    pub booting: usize,
    pub waiting: usize,
    pub poisoned: bool,
    /// Call counts of the VMs currently in the Ready set.
    pub ready_call_counts: Vec<u32>,
}

enum ProvisionState {
    /// Profile has no dependencies; VMs boot straight from the base image.
    NotRequired,
    /// Dependencies declared, pipeline not yet started.
    Pending,
    InProgress,
    /// Snapshot captured; VMs are produced by restore.
    Complete,
    /// Install or snapshot failed; the pool fails fast forever.
    Poisoned(String),
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<WorkerVm>>,
}

struct PoolState {
    ready: VecDeque<WorkerVm>,
    in_use: usize,
    booting: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    provision: ProvisionState,
    snapshot: Option<Snapshot>,
    shutting_down: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.ready.len() + self.in_use + self.booting
    }

    fn can_admit(&self) -> bool {
        matches!(
            self.provision,
            ProvisionState::NotRequired | ProvisionState::Complete
        )
    }
}

/// A pool of warm VMs for one capability profile.
pub struct WorkerPool {
    key: PoolKey,
    profile: CapabilityProfile,
    config: PoolConfig,
    vm_config: VmConfig,
    runner: Arc<dyn VmRunner>,
    state: Mutex<PoolState>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new(
        profile: CapabilityProfile,
        key: PoolKey,
        config: PoolConfig,
        vm_config: VmConfig,
        runner: Arc<dyn VmRunner>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        profile.validate()?;

        let provision = if profile.dependencies.is_empty() {
            ProvisionState::NotRequired
        } else {
            ProvisionState::Pending
        };

        let pool = Arc::new(Self {
            key,
            profile,
            config,
            vm_config,
            runner,
            state: Mutex::new(PoolState {
                ready: VecDeque::new(),
                in_use: 0,
                booting: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
                provision,
                snapshot: None,
                shutting_down: false,
            }),
            maintenance: Mutex::new(None),
        });

        let handle = Self::spawn_maintenance(&pool);
        *pool.maintenance.lock().unwrap() = Some(handle);
        Ok(pool)
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn profile(&self) -> &CapabilityProfile {
        &self.profile
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock().unwrap();
        PoolStatus {
            ready: state.ready.len(),
            in_use: state.in_use,
            booting: state.booting,
            waiting: state.waiters.len(),
            poisoned: matches!(state.provision, ProvisionState::Poisoned(_)),
            ready_call_counts: state.ready.iter().map(|vm| vm.call_count).collect(),
        }
    }

    /// Checks a VM out of the pool, waiting up to `deadline`.
    ///
    /// # Errors
    ///
    /// [`Error::PoolExhausted`] when the deadline expires with every VM
    /// busy, [`Error::ProvisioningError`] for a poisoned profile, and
    /// [`Error::Shutdown`] while draining.
    pub async fn acquire(self: &Arc<Self>, deadline: Duration) -> Result<VmLease> {
        self.acquire_cancellable(deadline, &CancellationToken::new())
            .await
    }

    /// [`acquire`](Self::acquire) with a cancellation signal. A waiter
    /// cancelled in the queue leaves no VM side effects.
    pub async fn acquire_cancellable(
        self: &Arc<Self>,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<VmLease> {
        let (waiter_id, mut rx) = {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                return Err(Error::Shutdown);
            }
            match &state.provision {
                ProvisionState::Poisoned(reason) => {
                    return Err(Error::ProvisioningError(reason.clone()));
                }
                ProvisionState::Pending => {
                    state.provision = ProvisionState::InProgress;
                    self.spawn_provisioner();
                }
                _ => {}
            }

            if let Some(mut worker) = state.ready.pop_front() {
                worker.last_used_at = std::time::Instant::now();
                state.in_use += 1;
                return Ok(VmLease::new(Arc::clone(self), worker));
            }

            if state.can_admit() && state.total() < self.config.max_size {
                state.booting += 1;
                self.spawn_admission(state.snapshot.clone());
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = tokio::time::timeout(deadline, &mut rx) => Some(outcome),
        };
        match outcome {
            Some(Ok(Ok(reply))) => reply.map(|worker| VmLease::new(Arc::clone(self), worker)),
            // Sender dropped without a reply only happens on drain.
            Some(Ok(Err(_))) => Err(Error::Shutdown),
            Some(Err(_)) => {
                self.abandon_waiter(waiter_id, rx);
                Err(Error::PoolExhausted)
            }
            None => {
                self.abandon_waiter(waiter_id, rx);
                Err(Error::Cancelled)
            }
        }
    }

    /// Dequeues a waiter that gave up (deadline or cancellation).
    ///
    /// If a dispatcher popped the waiter in the same instant, the VM it
    /// sent is still sitting in `rx`; reclaim it so nothing leaks.
    fn abandon_waiter(
        self: &Arc<Self>,
        waiter_id: u64,
        mut rx: oneshot::Receiver<Result<WorkerVm>>,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
            state.waiters.remove(pos);
            return;
        }
        if let Ok(Ok(worker)) = rx.try_recv() {
            state.in_use -= 1;
            Self::dispatch(&mut state, worker);
        }
    }

    /// Checks a VM back in with the outcome of its call.
    fn release(self: &Arc<Self>, mut worker: WorkerVm, outcome: CallOutcome) {
        let mut state = self.state.lock().unwrap();
        state.in_use -= 1;

        if state.shutting_down {
            drop(state);
            self.spawn_kill(worker);
            return;
        }

        if !outcome.taints() {
            worker.call_count += 1;
            if worker.call_count < self.config.max_calls_per_vm {
                Self::dispatch(&mut state, worker);
                return;
            }
            tracing::debug!(pool = %self.key.short(), "retiring VM at call cap");
        } else {
            tracing::debug!(pool = %self.key.short(), ?outcome, "tainting VM");
        }

        // Tainted or retired: kill it and backfill toward min_size.
        if state.total() < self.config.min_size
            && state.can_admit()
            && state.total() < self.config.max_size
        {
            state.booting += 1;
            self.spawn_admission(state.snapshot.clone());
        }
        drop(state);
        self.spawn_kill(worker);
    }

    /// Hands a VM to the head waiter, or parks it in the Ready set.
    fn dispatch(state: &mut PoolState, worker: WorkerVm) {
        let mut worker = worker;
        worker.last_used_at = std::time::Instant::now();
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(Ok(worker)) {
                Ok(()) => {
                    state.in_use += 1;
                    return;
                }
                // The waiter's task was dropped outright; offer the VM
                // to the next one.
                Err(rejected) => match rejected {
                    Ok(reclaimed) => worker = reclaimed,
                    Err(_) => return,
                },
            }
        }
        state.ready.push_back(worker);
    }

    fn spawn_admission(self: &Arc<Self>, snapshot: Option<Snapshot>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let admitted = pool.admit(snapshot).await;
            let mut state = pool.state.lock().unwrap();
            state.booting -= 1;
            match admitted {
                Ok(worker) => {
                    if state.shutting_down {
                        drop(state);
                        pool.spawn_kill(worker);
                    } else {
                        Self::dispatch(&mut state, worker);
                    }
                }
                Err(e) => {
                    drop(state);
                    tracing::error!(pool = %pool.key.short(), "failed to admit VM: {e}");
                }
            }
        });
    }

    /// Boots a fresh VM or clones one from the pool snapshot.
    async fn admit(&self, snapshot: Option<Snapshot>) -> Result<WorkerVm> {
        let origin = snapshot.as_ref().map(|s| s.id);
        let vm = match &snapshot {
            Some(snapshot) => self.runner.restore(snapshot).await?,
            None => self.runner.boot(&self.vm_config).await?,
        };
        let stream = vm.stream().await?;
        Ok(WorkerVm::new(vm, stream, origin))
    }

    fn spawn_provisioner(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            match pool.provision().await {
                Ok(snapshot) => {
                    let mut state = pool.state.lock().unwrap();
                    state.provision = ProvisionState::Complete;
                    state.snapshot = Some(snapshot);
                    if state.shutting_down {
                        return;
                    }
                    // Cover the queued demand, or at least the floor.
                    let wanted = state
                        .waiters
                        .len()
                        .max(pool.config.min_size)
                        .min(pool.config.max_size);
                    while state.total() < wanted {
                        state.booting += 1;
                        pool.spawn_admission(state.snapshot.clone());
                    }
                }
                Err(ProvisionFailure::Fatal(reason)) => {
                    tracing::error!(pool = %pool.key.short(), "provisioning failed: {reason}");
                    let mut state = pool.state.lock().unwrap();
                    state.provision = ProvisionState::Poisoned(reason.clone());
                    for waiter in state.waiters.drain(..) {
                        let _ = waiter
                            .tx
                            .send(Err(Error::ProvisioningError(reason.clone())));
                    }
                }
                Err(ProvisionFailure::Retry(error)) => {
                    // Base boot flaked; the next acquisition retries.
                    tracing::warn!(pool = %pool.key.short(), "provisioning boot failed: {error}");
                    let mut state = pool.state.lock().unwrap();
                    state.provision = ProvisionState::Pending;
                }
            }
        });
    }

    /// First-use pipeline: base boot, dependency install, snapshot.
    async fn provision(&self) -> std::result::Result<Snapshot, ProvisionFailure> {
        tracing::info!(pool = %self.key.short(), "provisioning profile snapshot");

        let vm = self
            .runner
            .boot(&self.vm_config)
            .await
            .map_err(ProvisionFailure::Retry)?;
        let stream = vm.stream().await.map_err(ProvisionFailure::Retry)?;
        let mut rpc = RpcClient::new(stream);

        let packages = self.install_set();
        rpc.install(&packages, self.config.install_timeout)
            .await
            .map_err(|e| ProvisionFailure::Fatal(e.to_string()))?;

        let snapshot = self
            .runner
            .snapshot(vm.as_ref())
            .await
            .map_err(|e| ProvisionFailure::Fatal(e.to_string()))?;

        if let Err(e) = vm.shutdown().await {
            tracing::warn!(pool = %self.key.short(), "provisioner shutdown failed: {e}");
            let _ = vm.hard_kill().await;
        }

        tracing::info!(pool = %self.key.short(), snapshot = %snapshot.id, "profile snapshot captured");
        Ok(snapshot)
    }

    /// Dependency specifiers, deduplicated under canonical names.
    fn install_set(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.profile
            .dependencies
            .iter()
            .filter(|dep| seen.insert(dep.canonical_name()))
            .map(|dep| dep.specifier())
            .collect()
    }

    fn spawn_kill(self: &Arc<Self>, worker: WorkerVm) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = worker.vm.hard_kill().await {
                tracing::error!(pool = %pool.key.short(), "hard kill failed: {e}");
            }
        });
    }

    fn spawn_maintenance(pool: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(pool);
        let interval = pool.config.maintenance_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { return };
                if pool.run_maintenance() {
                    return;
                }
            }
        })
    }

    /// One bounded maintenance pass. Returns true once the pool drains.
    fn run_maintenance(self: &Arc<Self>) -> bool {
        let mut reaped = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                return true;
            }

            if state.can_admit() {
                while state.total() < self.config.min_size {
                    state.booting += 1;
                    self.spawn_admission(state.snapshot.clone());
                }
            }

            // The Ready queue is released-order, so the head is the most
            // idle VM.
            while state.ready.len() > self.config.min_size {
                let expired = state
                    .ready
                    .front()
                    .is_some_and(|vm| vm.idle_for() > self.config.max_idle);
                if !expired {
                    break;
                }
                if let Some(worker) = state.ready.pop_front() {
                    reaped.push(worker);
                }
            }
        }

        for worker in reaped {
            tracing::debug!(pool = %self.key.short(), "reaping idle VM");
            self.spawn_kill(worker);
        }
        false
    }

    /// Drains the pool: waiters are failed with [`Error::Shutdown`],
    /// warm VMs are killed, and the profile snapshot is removed.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let (workers, waiters, snapshot) = {
            let mut state = self.state.lock().unwrap();
            state.shutting_down = true;
            (
                state.ready.drain(..).collect::<Vec<_>>(),
                state.waiters.drain(..).collect::<Vec<_>>(),
                state.snapshot.take(),
            )
        };

        if let Some(handle) = self.maintenance.lock().unwrap().take() {
            handle.abort();
        }

        for waiter in waiters {
            let _ = waiter.tx.send(Err(Error::Shutdown));
        }

        futures::future::join_all(workers.into_iter().map(|worker| async move {
            let _ = worker.vm.hard_kill().await;
        }))
        .await;

        if let Some(snapshot) = snapshot {
            if let Err(e) = std::fs::remove_file(&snapshot.artifact) {
                tracing::debug!("snapshot artifact cleanup failed: {e}");
            }
        }
    }
}

enum ProvisionFailure {
    /// Transient base-boot failure; provisioning may be retried.
    Retry(Error),
    /// Install or snapshot failure; the profile is poisoned.
    Fatal(String),
}

/// A VM checked out of a pool for exactly one caller.
///
/// Dropping a lease without releasing it counts as a fault: the VM is
/// tainted and killed, mirroring what happens to an abandoned call.
pub struct VmLease {
    pool: Arc<WorkerPool>,
    worker: Option<WorkerVm>,
}

impl std::fmt::Debug for VmLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmLease").finish_non_exhaustive()
    }
}

impl VmLease {
    fn new(pool: Arc<WorkerPool>, worker: WorkerVm) -> Self {
        Self {
            pool,
            worker: Some(worker),
        }
    }

    /// The RPC channel to this VM's executor.
    pub fn client(&mut self) -> &mut RpcClient {
        &mut self.worker.as_mut().expect("lease already released").rpc
    }

    /// Calls served by this VM so far.
    pub fn call_count(&self) -> u32 {
        self.worker.as_ref().expect("lease already released").call_count
    }

    /// Snapshot this VM was restored from, if any.
    pub fn snapshot_origin(&self) -> Option<uuid::Uuid> {
        self.worker
            .as_ref()
            .expect("lease already released")
            .snapshot_origin
    }

    /// Time since this VM was admitted to the pool.
    pub fn age(&self) -> Duration {
        self.worker
            .as_ref()
            .expect("lease already released")
            .created_at
            .elapsed()
    }

    /// Returns the VM to the pool with the outcome of its call.
    pub fn release(mut self, outcome: CallOutcome) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker, outcome);
        }
    }
}

impl Drop for VmLease {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.release(worker, CallOutcome::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod pool_config {
        use super::*;

        #[test]
        fn default_is_valid() {
            assert!(PoolConfig::default().validate().is_ok());
        }

        #[test]
        fn zero_max_size_rejected() {
            let config = PoolConfig::new().with_max_size(0);
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }

        #[test]
        fn min_above_max_rejected() {
            let config = PoolConfig::new().with_min_size(5).with_max_size(2);
            assert!(config.validate().is_err());
        }

        #[test]
        fn zero_call_cap_rejected() {
            let config = PoolConfig::new().with_max_calls_per_vm(0);
            assert!(config.validate().is_err());
        }

        #[test]
        fn builders_compose() {
            let config = PoolConfig::new()
                .with_min_size(2)
                .with_max_size(8)
                .with_max_idle(Duration::from_secs(5));
            assert_eq!(config.min_size, 2);
            assert_eq!(config.max_size, 8);
            assert_eq!(config.max_idle, Duration::from_secs(5));
        }
    }

    mod call_outcome {
        use super::*;

        #[test]
        fn taint_classification() {
            assert!(!CallOutcome::Ok.taints());
            assert!(!CallOutcome::RemoteException.taints());
            assert!(CallOutcome::Timeout.taints());
            assert!(CallOutcome::ProtocolError.taints());
            assert!(CallOutcome::RemoteCrash.taints());
            assert!(CallOutcome::Cancelled.taints());
        }

        #[test]
        fn from_error_matches_taxonomy() {
            assert_eq!(
                CallOutcome::from_error(&Error::Timeout),
                CallOutcome::Timeout
            );
            assert_eq!(
                CallOutcome::from_error(&Error::RemoteCrash),
                CallOutcome::RemoteCrash
            );
            assert_eq!(
                CallOutcome::from_error(&Error::RemoteException {
                    kind: "ValueError".into(),
                    message: String::new(),
                    remote_trace: String::new(),
                }),
                CallOutcome::RemoteException
            );
        }
    }
}
