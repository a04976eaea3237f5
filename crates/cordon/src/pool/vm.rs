//! Per-VM bookkeeping inside a worker pool.

use crate::rpc::RpcClient;
use cordon_core::{GuestStream, RunnerVm};
use std::time::Instant;
use uuid::Uuid;

/// A warm VM owned by exactly one pool.
pub(crate) struct WorkerVm {
    pub(crate) vm: Box<dyn RunnerVm>,
    pub(crate) rpc: RpcClient,
    pub(crate) call_count: u32,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
    pub(crate) snapshot_origin: Option<Uuid>,
}

impl WorkerVm {
    pub(crate) fn new(
        vm: Box<dyn RunnerVm>,
        stream: GuestStream,
        snapshot_origin: Option<Uuid>,
    ) -> Self {
        let now = Instant::now();
        Self {
            vm,
            rpc: RpcClient::new(stream),
            call_count: 0,
            created_at: now,
            last_used_at: now,
            snapshot_origin,
        }
    }

    pub(crate) fn idle_for(&self) -> std::time::Duration {
        self.last_used_at.elapsed()
    }
}
