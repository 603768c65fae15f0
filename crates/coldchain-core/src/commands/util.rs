use std::path::Path;

use coldchain_types::error::Result;

use crate::lock;

/// Run `action` while holding the state-directory lock.
/// The lock is released even when the action fails.
pub fn with_state_lock<T>(state_dir: &Path, action: impl FnOnce() -> Result<T>) -> Result<T> {
    let guard = lock::acquire_lock(state_dir)?;
    let result = action();

    match guard.release() {
        Ok(()) => result,
        Err(release_err) => {
            if result.is_err() {
                tracing::warn!("failed to release state lock: {release_err}");
                result
            } else {
                Err(release_err)
            }
        }
    }
}
