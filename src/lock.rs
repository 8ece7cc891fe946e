//! Poison-recovering lock guards.
//!
//! Engine state behind std `RwLock`s must stay readable even after a
//! panic in another task; recovery is logged once per acquisition so a
//! poisoned lock is visible without being fatal.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn warn_poisoned(target: &'static str, op: &'static str, lock_kind: &'static str) {
    warn!(
        op,
        target_module = target,
        lock_kind,
        result = "poisoned_recovered",
        hint = "state may be stale after panic in another task",
        "Recovered from poisoned engine lock"
    );
}

pub(crate) fn read_guard<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn_poisoned(target, op, "rwlock.read");
        poisoned.into_inner()
    })
}

pub(crate) fn write_guard<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn_poisoned(target, op, "rwlock.write");
        poisoned.into_inner()
    })
}
