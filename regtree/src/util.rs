/*!
Lock helpers.

Critical sections in this crate only replace whole fields, so a poisoned lock
still guards consistent state and is recovered.
*/

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Number of bytes needed to hold `bits` bits. Zero bits still occupy one byte.
pub(crate) fn byte_count(bits: usize) -> usize {
    if bits == 0 {
        1
    } else {
        bits.div_ceil(8)
    }
}
