pub mod tcp;

use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, taking the data even if a holder panicked. Every structure
/// guarded this way stays valid between statements.
#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
