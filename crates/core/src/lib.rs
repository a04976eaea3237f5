pub mod error;
pub mod keying;
pub mod profile;
pub mod runner;

pub use error::{Error, Result};
pub use keying::{CANONICAL_VERSION, PoolKey, canonicalize, pool_key};
pub use profile::{
    CapabilityProfile, Dependency, GUEST_MIN_MEM_MB, MountMode, MountSpec, NetPolicy,
};
pub use runner::{Endpoint, GuestIo, GuestStream, ImageRef, RunnerVm, Snapshot, VmConfig, VmRunner};
