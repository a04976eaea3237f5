//! Top-level dispatch: one call, one VM, one translated result.

use crate::manager::PoolManager;
use crate::pool::{CallOutcome, PoolConfig, WorkerPool};
use cordon_core::{CapabilityProfile, Error, ImageRef, Result, VmRunner};
use cordon_protocol::{Codec, CodecError, TaggedCodec, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Host-side grace added to `cpu_ms` for request/response transit. The
/// host deadline is authoritative and never exceeds `cpu_ms` plus this.
pub const NETWORK_GRACE: Duration = Duration::from_millis(25);

/// Configuration for a [`SandboxManager`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Per-profile pool tuning.
    pub pool: PoolConfig,
    /// vCPUs per VM.
    pub cpus: u32,
    /// Base kernel/rootfs; backends with built-in images accept `None`.
    pub image: Option<ImageRef>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            cpus: 1,
            image: None,
        }
    }
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn with_image(mut self, image: ImageRef) -> Self {
        self.image = Some(image);
        self
    }
}

struct ManagerInner {
    pools: PoolManager,
    codec: Arc<dyn Codec>,
}

/// The dispatcher shims talk to.
///
/// Cheap to clone; all clones share one pool table. Shims should hold a
/// [`WeakSandboxManager`] so a registered function never keeps the
/// manager (and its VMs) alive.
#[derive(Clone)]
pub struct SandboxManager {
    inner: Arc<ManagerInner>,
}

impl SandboxManager {
    /// Builds a manager with the default tagged codec.
    pub fn new(runner: Arc<dyn VmRunner>, config: SandboxConfig) -> Result<Self> {
        Self::with_codec(runner, config, Arc::new(TaggedCodec))
    }

    /// Builds a manager with an explicit argument codec.
    pub fn with_codec(
        runner: Arc<dyn VmRunner>,
        config: SandboxConfig,
        codec: Arc<dyn Codec>,
    ) -> Result<Self> {
        let pools = PoolManager::new(runner, config.pool, config.cpus, config.image)?;
        Ok(Self {
            inner: Arc::new(ManagerInner { pools, codec }),
        })
    }

    /// Downgrades to a handle that does not keep the manager alive.
    pub fn downgrade(&self) -> WeakSandboxManager {
        WeakSandboxManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The pool serving a profile, created on first use. Exposed for
    /// warm-up and observability.
    pub fn pool(&self, profile: &CapabilityProfile) -> Result<Arc<WorkerPool>> {
        self.inner.pools.get_or_create(profile)
    }

    /// Number of live pools.
    pub fn pool_count(&self) -> usize {
        self.inner.pools.pool_count()
    }

    /// Runs `function_ref` in a VM matching `profile`.
    ///
    /// Arguments are encoded before any VM is touched, so an
    /// unencodable value has no sandbox side effects. The VM is
    /// released with the outcome of the call: recycled on success or a
    /// guest-raised failure, tainted and killed on timeout, protocol
    /// damage, crash, or cancellation.
    pub async fn execute(
        &self,
        function_ref: &str,
        args: &[Value],
        kwargs: &[(String, Value)],
        profile: &CapabilityProfile,
    ) -> Result<Value> {
        self.execute_cancellable(function_ref, args, kwargs, profile, &CancellationToken::new())
            .await
    }

    /// [`execute`](Self::execute) with a caller cancellation signal.
    ///
    /// Cancellation while queued for a VM has no side effects;
    /// cancellation mid-call taints the VM.
    pub async fn execute_cancellable(
        &self,
        function_ref: &str,
        args: &[Value],
        kwargs: &[(String, Value)],
        profile: &CapabilityProfile,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let codec = self.inner.codec.as_ref();
        let args_bytes = codec
            .encode(&Value::Seq(args.to_vec()))
            .map_err(encode_error)?;
        let kwargs_bytes = codec
            .encode(&Value::Map(kwargs.to_vec()))
            .map_err(encode_error)?;

        let pool = self.inner.pools.get_or_create(profile)?;
        let call_budget = Duration::from_millis(u64::from(profile.cpu_ms));
        let acquire_deadline = call_budget + pool.config().pool_wait_slack;
        let mut lease = pool.acquire_cancellable(acquire_deadline, cancel).await?;

        let result = lease
            .client()
            .invoke_cancellable(
                function_ref,
                args_bytes,
                kwargs_bytes,
                profile.cpu_ms,
                call_budget + NETWORK_GRACE,
                cancel,
            )
            .await;

        match result {
            Ok(bytes) => match codec.decode(&bytes) {
                Ok(value) => {
                    lease.release(CallOutcome::Ok);
                    Ok(value)
                }
                Err(e) => {
                    lease.release(CallOutcome::ProtocolError);
                    Err(Error::ProtocolError(format!("undecodable result: {e}")))
                }
            },
            Err(error) => {
                lease.release(CallOutcome::from_error(&error));
                Err(error)
            }
        }
    }

    /// Drains every pool and rejects further calls. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.pools.shutdown().await;
    }
}

/// A non-owning handle to a [`SandboxManager`].
#[derive(Clone)]
pub struct WeakSandboxManager {
    inner: Weak<ManagerInner>,
}

impl WeakSandboxManager {
    /// Upgrades if the manager is still alive.
    pub fn upgrade(&self) -> Option<SandboxManager> {
        self.inner.upgrade().map(|inner| SandboxManager { inner })
    }
}

fn encode_error(e: CodecError) -> Error {
    match e {
        CodecError::Unencodable(msg) => Error::UnencodableArgument(msg),
        CodecError::Malformed(msg) => Error::ProtocolError(msg),
    }
}
