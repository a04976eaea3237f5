//! Capability profiles.
//!
//! A [`CapabilityProfile`] declares everything a sandboxed function is
//! allowed to see: host paths, network egress, a wall-clock budget, a
//! memory ceiling, and the packages preinstalled in its environment.
//! Profiles are immutable once hashed; two semantically equal profiles
//! map to the same worker pool (see [`crate::keying`]).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Smallest guest memory ceiling a profile may declare, in MiB.
///
/// Below this the guest kernel and executor daemon cannot boot.
pub const GUEST_MIN_MEM_MB: u32 = 64;

/// Access mode for a host path exposed to the guest.
///
/// Ordering is significant for canonicalization: `Read < ReadWrite`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    /// Guest can read but not modify files.
    #[default]
    Read,
    /// Guest can read and write files.
    ReadWrite,
}

impl MountMode {
    /// Stable tag used by the canonical encoding.
    pub fn tag(self) -> u8 {
        match self {
            MountMode::Read => 0,
            MountMode::ReadWrite => 1,
        }
    }
}

/// A host path bind-mounted into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub path: PathBuf,
    pub mode: MountMode,
}

impl MountSpec {
    pub fn new(path: impl Into<PathBuf>, mode: MountMode) -> Self {
        Self {
            path: path.into(),
            mode,
        }
    }
}

/// Network egress policy for the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetPolicy {
    /// No network device is attached to the VM.
    #[default]
    None,
    /// Egress limited to TCP/443 by host-side filtering.
    HttpsOnly,
    /// Unrestricted egress.
    All,
}

impl NetPolicy {
    /// Stable tag used by the canonical encoding.
    pub fn tag(self) -> u8 {
        match self {
            NetPolicy::None => 0,
            NetPolicy::HttpsOnly => 1,
            NetPolicy::All => 2,
        }
    }
}

/// A package specifier: a name with an optional version constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub constraint: Option<String>,
}

impl Dependency {
    /// Parses a specifier such as `"requests"` or `"requests>=2.31"`.
    ///
    /// The name is everything before the first constraint operator; the
    /// constraint is kept verbatim apart from whitespace trimming. An
    /// empty constraint collapses to `None`.
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        match spec.find(['<', '>', '=', '!', '~']) {
            Some(idx) => {
                let (name, constraint) = spec.split_at(idx);
                let constraint = constraint.trim();
                Self {
                    name: name.trim().to_string(),
                    constraint: (!constraint.is_empty()).then(|| constraint.to_string()),
                }
            }
            None => Self {
                name: spec.to_string(),
                constraint: None,
            },
        }
    }

    /// Name under case-folding, used for equality and ordering.
    pub fn canonical_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Full specifier string as handed to the guest installer.
    pub fn specifier(&self) -> String {
        match &self.constraint {
            Some(c) => format!("{}{}", self.name, c),
            None => self.name.clone(),
        }
    }
}

/// The declared permissions that define one sandbox environment.
///
/// Profiles are plain immutable values. A mutated copy is a different
/// profile, hashes to a different pool key, and therefore gets its own
/// worker pool.
///
/// # Example
///
/// ```
/// use cordon_core::{CapabilityProfile, MountMode, NetPolicy};
///
/// let profile = CapabilityProfile::new(200, 256)
///     .mount("/data", MountMode::Read)
///     .net(NetPolicy::HttpsOnly)
///     .dependency("requests>=2.31");
/// assert!(profile.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    /// Host paths exposed to the guest; empty means none.
    pub fs: Vec<MountSpec>,
    /// Network egress policy.
    pub net: NetPolicy,
    /// Wall-clock timeout per call, in milliseconds.
    pub cpu_ms: u32,
    /// Guest memory ceiling, in MiB.
    pub mem_mb: u32,
    /// Packages preinstalled into the pool snapshot.
    pub dependencies: Vec<Dependency>,
}

impl CapabilityProfile {
    pub fn new(cpu_ms: u32, mem_mb: u32) -> Self {
        Self {
            fs: Vec::new(),
            net: NetPolicy::None,
            cpu_ms,
            mem_mb,
            dependencies: Vec::new(),
        }
    }

    /// Exposes a host path to the guest with the given mode.
    pub fn mount(mut self, path: impl Into<PathBuf>, mode: MountMode) -> Self {
        self.fs.push(MountSpec::new(path, mode));
        self
    }

    /// Sets the network egress policy.
    pub fn net(mut self, policy: NetPolicy) -> Self {
        self.net = policy;
        self
    }

    /// Adds a package specifier to preinstall.
    pub fn dependency(mut self, spec: &str) -> Self {
        self.dependencies.push(Dependency::parse(spec));
        self
    }

    /// Checks the profile invariants.
    ///
    /// Runs before hashing and before pool construction, so a profile
    /// that reaches a pool is always well-formed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProfile`] when a mount path is relative
    /// or duplicated, when `cpu_ms` is zero, when `mem_mb` is below
    /// [`GUEST_MIN_MEM_MB`], or when two dependencies share a canonical
    /// name with conflicting constraints.
    pub fn validate(&self) -> Result<()> {
        let mut seen_paths: HashSet<&Path> = HashSet::new();
        for mount in &self.fs {
            if !mount.path.is_absolute() {
                return Err(Error::InvalidProfile(format!(
                    "mount path is not absolute: {}",
                    mount.path.display()
                )));
            }
            if !seen_paths.insert(mount.path.as_path()) {
                return Err(Error::InvalidProfile(format!(
                    "mount path declared twice: {}",
                    mount.path.display()
                )));
            }
        }

        if self.cpu_ms == 0 {
            return Err(Error::InvalidProfile("cpu_ms must be positive".into()));
        }
        if self.mem_mb < GUEST_MIN_MEM_MB {
            return Err(Error::InvalidProfile(format!(
                "mem_mb must be at least {GUEST_MIN_MEM_MB}"
            )));
        }

        let mut seen_deps: HashSet<String> = HashSet::new();
        for dep in &self.dependencies {
            let name = dep.canonical_name();
            if name.is_empty() {
                return Err(Error::InvalidProfile(
                    "dependency specifier has no package name".into(),
                ));
            }
            if !seen_deps.insert(name.clone()) {
                let duplicate = self
                    .dependencies
                    .iter()
                    .filter(|d| d.canonical_name() == name)
                    .any(|d| d.constraint != dep.constraint);
                if duplicate {
                    return Err(Error::InvalidProfile(format!(
                        "dependency '{name}' declared with conflicting constraints"
                    )));
                }
            }
        }

        Ok(())
    }
}
