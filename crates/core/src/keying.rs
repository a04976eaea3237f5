//! Profile canonicalization and pool keying.
//!
//! Two profiles that differ only in mount order, dependency order, or
//! dependency name casing must land in the same worker pool; any semantic
//! difference must produce a different key. [`canonicalize`] produces a
//! self-delimiting length-prefixed byte form with all unordered fields
//! sorted, and [`pool_key`] digests it with SHA-256.

use crate::error::Result;
use crate::profile::CapabilityProfile;
use sha2::{Digest, Sha256};
use std::fmt;

/// Leading byte of the canonical encoding. Bumped whenever the canonical
/// form changes, so old and new encodings can never alias into one pool.
pub const CANONICAL_VERSION: u8 = 1;

/// Content-addressed identity of a capability profile.
///
/// Equal keys imply semantically equivalent profiles.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey([u8; 32]);

impl PoolKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short prefix used in log lines.
    pub fn short(&self) -> String {
        self.0[..6].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolKey({})", self.short())
    }
}

/// Produces the canonical byte form of a validated profile.
///
/// Layout, all integers big-endian, all variable-length fields prefixed
/// with a `u32` byte count:
///
/// 1. version byte
/// 2. mounts sorted by `(path, mode)` with `read < read_write`
/// 3. network policy tag
/// 4. `cpu_ms`, `mem_mb` as fixed-width `u32`
/// 5. dependencies with case-folded names and whitespace-trimmed verbatim
///    constraints, sorted by `(name, constraint)`, identical entries
///    collapsed
///
/// # Errors
///
/// Propagates [`crate::Error::InvalidProfile`] from validation; an
/// invalid profile has no canonical form.
pub fn canonicalize(profile: &CapabilityProfile) -> Result<Vec<u8>> {
    profile.validate()?;

    let mut buf = Vec::with_capacity(128);
    buf.push(CANONICAL_VERSION);

    let mut mounts: Vec<(&[u8], u8)> = profile
        .fs
        .iter()
        .map(|m| (m.path.as_os_str().as_encoded_bytes(), m.mode.tag()))
        .collect();
    mounts.sort();
    put_u32(&mut buf, mounts.len() as u32);
    for (path, mode) in mounts {
        put_bytes(&mut buf, path);
        buf.push(mode);
    }

    buf.push(profile.net.tag());
    put_u32(&mut buf, profile.cpu_ms);
    put_u32(&mut buf, profile.mem_mb);

    let mut deps: Vec<(String, String)> = profile
        .dependencies
        .iter()
        .map(|d| {
            (
                d.canonical_name(),
                d.constraint.as_deref().unwrap_or("").trim().to_string(),
            )
        })
        .collect();
    deps.sort();
    deps.dedup();
    put_u32(&mut buf, deps.len() as u32);
    for (name, constraint) in deps {
        put_bytes(&mut buf, name.as_bytes());
        put_bytes(&mut buf, constraint.as_bytes());
    }

    Ok(buf)
}

/// Derives the pool key for a profile: SHA-256 over its canonical bytes.
pub fn pool_key(profile: &CapabilityProfile) -> Result<PoolKey> {
    let canonical = canonicalize(profile)?;
    let digest = Sha256::digest(&canonical);
    Ok(PoolKey(digest.into()))
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{MountMode, NetPolicy};

    fn base() -> CapabilityProfile {
        CapabilityProfile::new(200, 256)
    }

    #[test]
    fn key_is_stable_for_equal_profiles() {
        let a = base().mount("/d", MountMode::Read);
        let b = base().mount("/d", MountMode::Read);
        assert_eq!(pool_key(&a).unwrap(), pool_key(&b).unwrap());
    }

    #[test]
    fn mount_order_does_not_change_key() {
        let a = base()
            .mount("/d", MountMode::Read)
            .mount("/e", MountMode::ReadWrite);
        let b = base()
            .mount("/e", MountMode::ReadWrite)
            .mount("/d", MountMode::Read);
        assert_eq!(pool_key(&a).unwrap(), pool_key(&b).unwrap());
    }

    #[test]
    fn dependency_order_and_case_do_not_change_key() {
        let a = base().dependency("b").dependency("A>=1");
        let b = base().dependency("a>=1").dependency("b");
        assert_eq!(pool_key(&a).unwrap(), pool_key(&b).unwrap());
    }

    // The canonical-key-equality scenario: full profiles differing only
    // in field ordering hash identically.
    #[test]
    fn permuted_profiles_share_a_key() {
        let a = base()
            .mount("/d", MountMode::Read)
            .mount("/e", MountMode::ReadWrite)
            .net(NetPolicy::None)
            .dependency("b")
            .dependency("A>=1");
        let b = base()
            .mount("/e", MountMode::ReadWrite)
            .mount("/d", MountMode::Read)
            .net(NetPolicy::None)
            .dependency("a>=1")
            .dependency("b");
        assert_eq!(pool_key(&a).unwrap(), pool_key(&b).unwrap());
    }

    #[test]
    fn mode_changes_key() {
        let a = base().mount("/d", MountMode::Read);
        let b = base().mount("/d", MountMode::ReadWrite);
        assert_ne!(pool_key(&a).unwrap(), pool_key(&b).unwrap());
    }

    #[test]
    fn net_policy_changes_key() {
        let a = base().net(NetPolicy::None);
        let b = base().net(NetPolicy::HttpsOnly);
        assert_ne!(pool_key(&a).unwrap(), pool_key(&b).unwrap());
    }

    #[test]
    fn limits_change_key() {
        assert_ne!(
            pool_key(&CapabilityProfile::new(200, 256)).unwrap(),
            pool_key(&CapabilityProfile::new(201, 256)).unwrap()
        );
        assert_ne!(
            pool_key(&CapabilityProfile::new(200, 256)).unwrap(),
            pool_key(&CapabilityProfile::new(200, 512)).unwrap()
        );
    }

    #[test]
    fn constraint_changes_key() {
        let a = base().dependency("requests>=2");
        let b = base().dependency("requests>=3");
        assert_ne!(pool_key(&a).unwrap(), pool_key(&b).unwrap());
    }

    #[test]
    fn identical_duplicate_dependencies_collapse() {
        let a = base().dependency("requests").dependency("Requests");
        let b = base().dependency("requests");
        assert_eq!(pool_key(&a).unwrap(), pool_key(&b).unwrap());
    }

    #[test]
    fn canonical_form_is_self_delimiting() {
        // A path whose bytes happen to contain what looks like another
        // field must not collide with a genuinely different profile.
        let a = base().mount("/d\u{0}x", MountMode::Read);
        let b = base().mount("/d", MountMode::Read);
        assert_ne!(pool_key(&a).unwrap(), pool_key(&b).unwrap());
    }

    #[test]
    fn invalid_profile_has_no_key() {
        assert!(pool_key(&CapabilityProfile::new(0, 256)).is_err());
    }

    #[test]
    fn display_is_64_hex_chars() {
        let key = pool_key(&base()).unwrap();
        let hex = key.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
