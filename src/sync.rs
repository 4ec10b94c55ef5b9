// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! The memory tier, the pending-group table and the download queue are all
//! guarded by std locks that are held only for short, non-async sections.
//! A panic inside a user callback can never happen under one of these locks
//! (callbacks run after the guard is dropped), but a panic inside a codec or
//! a transform hook on another thread could still poison one. These helpers
//! log the event and keep serving the inner data instead of propagating the
//! panic to every later caller.
//!
//! ```no_run
//! use std::sync::Mutex;
//! use webimg::sync::resilient_lock;
//!
//! let table = Mutex::new(Vec::<u32>::new());
//! resilient_lock(&table).push(7);
//! ```

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock a mutex, recovering the guard if a previous holder panicked.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(
                target: "webimg::sync",
                event = "MUTEX_POISONED",
                "Mutex was poisoned by a panicking holder; continuing with its data"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(
                target: "webimg::sync",
                event = "RWLOCK_POISONED_READ",
                "RwLock was poisoned by a panicking writer; continuing with its data"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!(
                target: "webimg::sync",
                event = "RWLOCK_POISONED_WRITE",
                "RwLock was poisoned by a panicking writer; continuing with its data"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_resilient_lock_normal() {
        let lock = Mutex::new(1);
        *resilient_lock(&lock) += 1;
        assert_eq!(*resilient_lock(&lock), 2);
    }

    #[test]
    fn test_resilient_lock_poisoned() {
        let lock = Arc::new(Mutex::new(vec![1, 2, 3]));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.lock().unwrap();
            panic!("intentional panic to poison mutex");
        });
        let _ = handle.join();

        assert!(lock.is_poisoned());
        resilient_lock(&lock).push(4);
        assert_eq!(resilient_lock(&lock).len(), 4);
    }

    #[test]
    fn test_resilient_rwlock_poisoned() {
        let lock = Arc::new(RwLock::new(42));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.write().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        *resilient_write(&lock) = 100;
        assert_eq!(*resilient_read(&lock), 100);
    }
}
