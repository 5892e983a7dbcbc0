//! Pooled kernel wait objects.
//!
//! Creating and destroying kernel wait primitives is expensive relative to a
//! short-lived lock, so every `FastMutex` and `WaitCondition` draws its
//! blocking object from a process-wide free list and returns it on drop.
//! The list is guarded by a raw spin lock rather than a `FastMutex`, which
//! would otherwise need a wait object of its own.

use crate::platform::WaitObject;
use crossbeam::utils::Backoff;
use lazy_static::lazy_static;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

lazy_static! {
    static ref GLOBAL_CACHE: KernelWaitObjectCache = KernelWaitObjectCache::new();
}

/// Returns the process-wide cache.
pub fn global() -> &'static KernelWaitObjectCache {
    &GLOBAL_CACHE
}

/// Minimal test-and-set spin lock protecting the free list.
struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// Exclusive access to `value` is enforced by `locked`.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    fn new(value: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        let result = f(unsafe { &mut *self.value.get() });
        self.locked.store(false, Ordering::Release);
        result
    }
}

/// Free list of [`WaitObject`]s.
///
/// After [`shutdown`](KernelWaitObjectCache::shutdown) the cache stops
/// pooling: `acquire` creates fresh objects and `release` destroys them, so
/// late lock teardown during process exit stays safe.
pub struct KernelWaitObjectCache {
    entries: SpinLock<Vec<WaitObject>>,
    dead: AtomicBool,
}

impl KernelWaitObjectCache {
    pub fn new() -> Self {
        KernelWaitObjectCache {
            entries: SpinLock::new(Vec::new()),
            dead: AtomicBool::new(false),
        }
    }

    /// Takes a non-signalled wait object from the free list, creating one if
    /// the list is empty.
    pub fn acquire(&self) -> WaitObject {
        if !self.dead.load(Ordering::Acquire) {
            if let Some(wo) = self.entries.with(|entries| entries.pop()) {
                return wo;
            }
        }
        WaitObject::new()
    }

    /// Returns a wait object to the free list, draining any pending permits
    /// first so the next owner starts non-signalled.
    pub fn release(&self, wo: WaitObject) {
        if self.dead.load(Ordering::Acquire) {
            return;
        }
        wo.drain();
        self.entries.with(|entries| entries.push(wo));
    }

    /// Empties the cache and stops pooling.
    pub fn shutdown(&self) {
        self.dead.store(true, Ordering::Release);
        self.entries.with(|entries| entries.clear());
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.with(|entries| entries.len())
    }
}

impl Default for KernelWaitObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn release_then_acquire_reuses_the_object() {
        let cache = KernelWaitObjectCache::new();
        cache.release(WaitObject::new());
        assert_eq!(cache.len(), 1);
        let _wo = cache.acquire();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn released_objects_come_back_non_signalled() {
        let cache = KernelWaitObjectCache::new();
        let wo = WaitObject::new();
        wo.post(5);
        cache.release(wo);
        let wo = cache.acquire();
        assert!(!wo.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn shutdown_stops_pooling() {
        let cache = KernelWaitObjectCache::new();
        cache.release(WaitObject::new());
        cache.shutdown();
        assert_eq!(cache.len(), 0);
        cache.release(WaitObject::new());
        assert_eq!(cache.len(), 0);
        // acquire still works, it just creates fresh objects
        let wo = cache.acquire();
        wo.post(1);
        assert!(wo.wait(None));
    }
}
