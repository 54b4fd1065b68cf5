//! Lock helpers shared by the USB thread and completion handlers

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, recovering the guard if a previous holder panicked
///
/// State behind these mutexes stays consistent across a panic in a
/// completion handler, so the lock is taken over instead of propagating the
/// poison.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
