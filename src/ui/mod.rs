pub mod console;
pub mod ide;

use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Operator toggle: when set, DBGp traffic is echoed to the terminal.
pub static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Lock a mutex, surviving poisoning. The IDE loop recovers from panics, so a
/// poisoned engine mutex is expected and its state stays usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
