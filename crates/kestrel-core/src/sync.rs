//! Poison-tolerant lock helpers.
//!
//! A panic in one handler must not wedge the whole server, so poisoned
//! mutexes are recovered and logged rather than propagated.

use std::panic::Location;
use std::sync::{Condvar, Mutex, MutexGuard};

#[track_caller]
pub fn lock<'a, T>(mutex: &'a Mutex<T>, context: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(err) => {
            let loc = Location::caller();
            tracing::error!(
                target = "kestrel.core",
                context,
                file = loc.file(),
                line = loc.line(),
                error = %err,
                "mutex poisoned; continuing with recovered guard"
            );
            err.into_inner()
        }
    }
}

#[track_caller]
pub fn wait<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    context: &'static str,
) -> MutexGuard<'a, T> {
    match cv.wait(guard) {
        Ok(guard) => guard,
        Err(err) => {
            let loc = Location::caller();
            tracing::error!(
                target = "kestrel.core",
                context,
                file = loc.file(),
                line = loc.line(),
                error = %err,
                "mutex poisoned while waiting; continuing with recovered guard"
            );
            err.into_inner()
        }
    }
}
