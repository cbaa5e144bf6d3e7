//! Lock-guarded containers shared between a stage's worker, its hardware
//! completion thread and the control plane.
//!
//! Both containers take their lock for the duration of one call only, and
//! never call back into user code except through the predicate/closure
//! passed to that call.

pub mod keyed_store;
pub mod work_queue;

pub use keyed_store::KeyedStore;
pub use work_queue::{Updated, WorkQueue};

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}
