//! The runner surface: everything the control plane asks of a hypervisor.
//!
//! A [`VmRunner`] boots, snapshots, and restores micro-VMs; each running
//! VM is handed back as a boxed [`RunnerVm`]. The pool is the only caller
//! and enforces single-use: two concurrent operations on one handle are
//! undefined behavior at this layer.

use crate::error::Result;
use crate::profile::{CapabilityProfile, MountSpec, NetPolicy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// Kernel and root filesystem a VM boots from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRef {
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
}

impl ImageRef {
    pub fn new(kernel: impl Into<PathBuf>, rootfs: impl Into<PathBuf>) -> Self {
        Self {
            kernel: kernel.into(),
            rootfs: rootfs.into(),
        }
    }
}

/// Boot-time configuration for one VM, derived from a capability profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub cpus: u32,
    pub memory_mb: u32,
    pub mounts: Vec<MountSpec>,
    pub net: NetPolicy,
    /// Kernel/rootfs reference; backends with built-in images accept `None`.
    pub image: Option<ImageRef>,
}

impl VmConfig {
    /// Derives a VM configuration from the declared capabilities.
    pub fn from_profile(profile: &CapabilityProfile, cpus: u32, image: Option<ImageRef>) -> Self {
        Self {
            cpus,
            memory_mb: profile.mem_mb,
            mounts: profile.fs.clone(),
            net: profile.net,
            image,
        }
    }
}

/// Where a VM exposes one of its host-visible channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A Unix domain socket on the host.
    UnixSocket(PathBuf),
    /// An in-memory channel (mock backend), identified for logging only.
    InMemory(Uuid),
}

/// A provisioned memory+disk image, restorable into fresh warm VMs.
///
/// Created at most once per pool; read-only afterwards, so any number of
/// concurrent restores may share it. Destroyed only with its pool.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: Uuid,
    pub artifact: PathBuf,
}

pub type GuestStream = Box<dyn GuestIo + Send>;

pub trait GuestIo: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> GuestIo for T {}

/// A single running micro-VM.
#[async_trait]
pub trait RunnerVm: Send + Sync {
    fn id(&self) -> Uuid;

    /// Hypervisor control channel descriptor.
    fn control_endpoint(&self) -> Endpoint;

    /// Host↔guest stream channel descriptor.
    fn stream_endpoint(&self) -> Endpoint;

    /// Takes the guest stream established during boot.
    ///
    /// The handshake byte has already been consumed; the stream is
    /// positioned at the first frame. Can be taken exactly once.
    async fn stream(&self) -> Result<GuestStream>;

    /// Requests a graceful guest shutdown.
    async fn shutdown(&self) -> Result<()>;

    /// Terminates the VM immediately. Idempotent; returns within a
    /// bounded time even if the hypervisor is wedged.
    async fn hard_kill(&self) -> Result<()>;
}

/// A hypervisor backend.
///
/// `boot` and `restore` return only once the guest's stream endpoint is
/// accepting connections and its handshake byte has been observed, so a
/// returned handle is immediately callable.
#[async_trait]
pub trait VmRunner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this backend can run on the current host.
    fn is_available(&self) -> bool;

    /// Whether `snapshot`/`restore` are implemented.
    fn supports_snapshots(&self) -> bool;

    /// Boots a fresh VM from the base image.
    async fn boot(&self, config: &VmConfig) -> Result<Box<dyn RunnerVm>>;

    /// Captures a memory+disk snapshot of a quiesced VM.
    async fn snapshot(&self, vm: &dyn RunnerVm) -> Result<Snapshot>;

    /// Clones a new VM from a snapshot.
    async fn restore(&self, snapshot: &Snapshot) -> Result<Box<dyn RunnerVm>>;
}
