//! Recursive spin-then-wait mutex.
//!
//! `FastMutex` stays in user space on the uncontended path: a single atomic
//! add acquires a free lock, a single atomic sub releases it. Contended
//! threads spin on a wake token for a configurable number of iterations
//! before falling back to a pooled kernel wait object, and cooperative
//! cancellation is suspended for the kernel wait so a cancelled thread never
//! unwinds while queued inside the lock.

use crate::atomic::AtomicCounter;
use crate::platform::WaitObject;
use crate::thread::{self, TerminationGuard};
use crate::{cache, platform};
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Default number of spin iterations before a contended lock sleeps.
pub const DEFAULT_SPIN_COUNT: u32 = 4000;

/// A recursive mutex combining a user-space fast path with a kernel wait.
///
/// The same thread may call [`lock`](FastMutex::lock) any number of times;
/// the lock is released when [`unlock`](FastMutex::unlock) has been called
/// as many times. Unlocking from a thread that is not the owner is a
/// programming error and trips a debug assertion.
pub struct FastMutex {
    /// -1 when free; >= 0 while held. The excess over zero counts threads
    /// queued in the slow path.
    lock_count: AtomicCounter,
    /// Set by unlock, consumed by exactly one spinning or waking thread.
    wake_token: AtomicU32,
    owner: AtomicU64,
    recursion: AtomicU32,
    spin_count: AtomicU32,
    wait_obj: Option<WaitObject>,
}

impl FastMutex {
    pub fn new() -> Self {
        Self::with_spin_count(DEFAULT_SPIN_COUNT)
    }

    pub fn with_spin_count(spin_count: u32) -> Self {
        FastMutex {
            lock_count: AtomicCounter::new(-1),
            wake_token: AtomicU32::new(0),
            owner: AtomicU64::new(0),
            recursion: AtomicU32::new(0),
            spin_count: AtomicU32::new(spin_count),
            wait_obj: Some(cache::global().acquire()),
        }
    }

    pub fn spin_count(&self) -> u32 {
        self.spin_count.load(Ordering::Relaxed)
    }

    pub fn set_spin_count(&self, spins: u32) {
        self.spin_count.store(spins, Ordering::Relaxed);
    }

    /// Whether some thread currently holds the lock. Advisory only.
    pub fn is_locked(&self) -> bool {
        self.lock_count.load() >= 0
    }

    fn wait_obj(&self) -> &WaitObject {
        // Only `drop` takes the object out.
        self.wait_obj.as_ref().unwrap_or_else(|| unreachable!())
    }

    pub fn lock(&self) {
        let me = thread::current_thread_id();
        if self.lock_count.add_fetch(1) == 0 {
            // Was free; we own it now.
            self.owner.store(me, Ordering::SeqCst);
            self.recursion.store(1, Ordering::SeqCst);
        } else if self.owner.load(Ordering::SeqCst) == me {
            // Recursive re-entry keeps a single count on the lock.
            self.recursion.fetch_add(1, Ordering::SeqCst);
            self.lock_count.fetch_sub(1);
        } else {
            self.lock_contended(me);
        }
    }

    #[cold]
    fn lock_contended(&self, me: u64) {
        let uniprocessor = platform::is_uniprocessor();
        loop {
            if self.wake_token.swap(0, Ordering::SeqCst) != 0 {
                break;
            }
            let mut acquired = false;
            let backoff = Backoff::new();
            for _ in 0..self.spin_count.load(Ordering::Relaxed) {
                if uniprocessor {
                    platform::yield_now();
                } else {
                    backoff.spin();
                }
                if self.wake_token.swap(0, Ordering::SeqCst) != 0 {
                    acquired = true;
                    break;
                }
            }
            if acquired {
                break;
            }
            // Queue on the kernel object. Cancellation stays disabled here:
            // unwinding a thread that is accounted for in lock_count would
            // strand every later waiter.
            let _no_cancel = TerminationGuard::new();
            self.wait_obj().wait(None);
        }
        self.owner.store(me, Ordering::SeqCst);
        self.recursion.store(1, Ordering::SeqCst);
    }

    /// Acquires the lock only if that cannot block. Recursive re-entry by
    /// the owner always succeeds.
    pub fn try_lock(&self) -> bool {
        let me = thread::current_thread_id();
        if self.lock_count.add_fetch(1) == 0 {
            self.owner.store(me, Ordering::SeqCst);
            self.recursion.store(1, Ordering::SeqCst);
            true
        } else if self.owner.load(Ordering::SeqCst) == me {
            self.recursion.fetch_add(1, Ordering::SeqCst);
            self.lock_count.fetch_sub(1);
            true
        } else {
            self.lock_count.fetch_sub(1);
            false
        }
    }

    pub fn unlock(&self) {
        let me = thread::current_thread_id();
        debug_assert!(
            self.owner.load(Ordering::SeqCst) == me,
            "FastMutex unlocked by a thread that does not own it"
        );
        if self.recursion.fetch_sub(1, Ordering::SeqCst) > 1 {
            return;
        }
        self.owner.store(0, Ordering::SeqCst);
        if self.lock_count.sub_fetch(1) >= 0 {
            // Somebody is queued; hand the lock over through the token and
            // wake at most one sleeper.
            self.wake_token.store(1, Ordering::SeqCst);
            self.wait_obj().post(1);
        }
    }
}

impl Default for FastMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FastMutex {
    fn drop(&mut self) {
        debug_assert!(!self.is_locked(), "FastMutex dropped while locked");
        if let Some(wo) = self.wait_obj.take() {
            cache::global().release(wo);
        }
    }
}

// All state transfer happens through atomics and the wait object.
unsafe impl Send for FastMutex {}
unsafe impl Sync for FastMutex {}

impl std::fmt::Debug for FastMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastMutex")
            .field("locked", &self.is_locked())
            .field("spin_count", &self.spin_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn lock_unlock_cycles_back_to_free() {
        let m = FastMutex::new();
        assert!(!m.is_locked());
        m.lock();
        assert!(m.is_locked());
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn recursive_lock_releases_at_matching_depth() {
        let m = FastMutex::new();
        m.lock();
        m.lock();
        m.lock();
        m.unlock();
        m.unlock();
        assert!(m.is_locked());
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn try_lock_fails_while_another_thread_owns() {
        let m = Arc::new(FastMutex::new());
        m.lock();
        let m2 = m.clone();
        let observed = std::thread::spawn(move || m2.try_lock()).join().unwrap();
        assert!(!observed);
        m.unlock();
    }

    #[test]
    fn try_lock_succeeds_recursively_for_owner() {
        let m = FastMutex::new();
        m.lock();
        assert!(m.try_lock());
        m.unlock();
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn contended_threads_serialize() {
        let m = Arc::new(FastMutex::with_spin_count(50));
        let shared = Arc::new(std::cell::UnsafeCell::new(0u64));
        struct Shared(Arc<std::cell::UnsafeCell<u64>>);
        unsafe impl Send for Shared {}

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                let shared = Shared(shared.clone());
                std::thread::spawn(move || {
                    let shared = shared;
                    for _ in 0..5_000 {
                        m.lock();
                        unsafe { *shared.0.get() += 1 };
                        m.unlock();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        m.lock();
        assert_eq!(unsafe { *shared.get() }, 40_000);
        m.unlock();
    }

    #[test]
    fn waiters_are_woken_one_at_a_time() {
        let m = Arc::new(FastMutex::with_spin_count(0));
        m.lock();
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    m.lock();
                    m.unlock();
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(50));
        m.unlock();
        for w in workers {
            w.join().unwrap();
        }
        assert!(!m.is_locked());
    }
}
