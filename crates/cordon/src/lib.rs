//! Cordon - function-level sandboxing on pools of warm micro-VMs.
//!
//! A caller declares a [`CapabilityProfile`] (paths, network, CPU budget,
//! memory ceiling, preinstalled packages); cordon keeps a pool of
//! pre-booted micro-VMs per canonical profile and dispatches each call to
//! an isolated VM whose environment matches the declaration exactly.
//! Isolation comes from the VM boundary, not the host process.
//!
//! # Example
//!
//! ```rust,no_run
//! use cordon::{CapabilityProfile, SandboxConfig, SandboxManager, Value};
//! use cordon::runner::select_runner;
//!
//! # async fn example() -> cordon::Result<()> {
//! let manager = SandboxManager::new(select_runner()?, SandboxConfig::new())?;
//!
//! let profile = CapabilityProfile::new(200, 256).dependency("requests");
//! let result = manager
//!     .execute("handlers:fetch_size", &[Value::Str("https://example.com".into())], &[], &profile)
//!     .await?;
//! println!("{result:?}");
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod manager;
mod pool;
mod rpc;
pub mod runner;
mod sandbox;

pub use manager::PoolManager;
pub use pool::{CallOutcome, PoolConfig, PoolStatus, VmLease, WorkerPool};
pub use rpc::RpcClient;
pub use sandbox::{NETWORK_GRACE, SandboxConfig, SandboxManager, WeakSandboxManager};

pub use cordon_core::{
    CANONICAL_VERSION, CapabilityProfile, Dependency, Endpoint, Error, GUEST_MIN_MEM_MB,
    GuestStream, ImageRef, MountMode, MountSpec, NetPolicy, PoolKey, Result, RunnerVm, Snapshot,
    VmConfig, VmRunner, canonicalize, pool_key,
};
pub use cordon_protocol::{Codec, TaggedCodec, TrustedCodec, Value};
