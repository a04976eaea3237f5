//! Runner backends.

mod mock;
mod subprocess;

pub use mock::MockRunner;
pub use subprocess::SubprocessRunner;

use cordon_core::{Error, Result, VmRunner};
use std::sync::Arc;

/// Selects the hypervisor-backed runner for this host.
///
/// # Errors
///
/// [`Error::NoRunnerAvailable`] when no hypervisor binary can be found;
/// tests and development use [`MockRunner`] directly instead.
pub fn select_runner() -> Result<Arc<dyn VmRunner>> {
    let runner = SubprocessRunner::new();
    if runner.is_available() {
        tracing::debug!(backend = runner.name(), "selected VM runner");
        return Ok(Arc::new(runner));
    }
    Err(Error::NoRunnerAvailable)
}
