//! Poisoned-lock recovery for in-process shared state.
//!
//! Used for the reload schedule slot, reload statistics, the in-memory
//! enforcement cache and the in-memory policy store. Every mutation behind
//! these locks is a single insert, remove or overwrite, so a poisoned lock
//! is logged and recovered instead of taking the process down.

use std::sync::{Mutex, MutexGuard};
use tracing::error;

/// Acquire a Mutex lock, recovering from poisoning if necessary.
///
/// # Example
/// ```ignore
/// let schedule = lock_or_recover(&self.schedule, "reload schedule");
/// ```
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!(
                "Mutex poisoned for '{}' - recovering with last written state",
                context
            );
            poisoned.into_inner()
        }
    }
}
