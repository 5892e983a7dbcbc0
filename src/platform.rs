//! Platform primitives.
//!
//! The one per-OS seam in the crate. Everything above this module is written
//! against `WaitObject`, `yield_now`, the processor count and the thread
//! affinity/priority setters, so porting means reimplementing this file only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A counting kernel-level wait primitive.
///
/// `post(n)` deposits `n` permits; `wait` blocks until it can consume one.
/// This is the blocking half of every lock in the crate. Objects are pooled
/// by the [`cache`](crate::cache) module, which drains them back to zero
/// permits before reuse.
#[derive(Debug, Default)]
pub struct WaitObject {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl WaitObject {
    pub fn new() -> Self {
        WaitObject {
            permits: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Deposits `n` permits and wakes blocked waiters.
    pub fn post(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut permits = self.permits.lock().unwrap();
        *permits += n;
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    /// Blocks until a permit is available, or until the timeout elapses.
    /// `None` waits forever. Returns whether a permit was consumed.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut permits = self.permits.lock().unwrap();
        match timeout {
            None => {
                while *permits == 0 {
                    permits = self.cond.wait(permits).unwrap();
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *permits == 0 {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self.cond.wait_timeout(permits, deadline - now).unwrap();
                    permits = guard;
                }
            }
        }
        *permits -= 1;
        true
    }

    /// Discards all pending permits.
    pub fn drain(&self) {
        *self.permits.lock().unwrap() = 0;
    }
}

pub fn yield_now() {
    std::thread::yield_now();
}

/// Number of logical processors, sampled once.
pub fn processor_count() -> usize {
    static COUNT: AtomicUsize = AtomicUsize::new(0);
    let cached = COUNT.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    COUNT.store(count, Ordering::Relaxed);
    count
}

/// On uniprocessor machines spinning can never observe another core making
/// progress, so lock spin loops yield instead.
pub fn is_uniprocessor() -> bool {
    processor_count() == 1
}

/// Pins the calling thread to one logical core. Returns whether the OS
/// accepted the request.
pub fn set_current_affinity(core: usize) -> bool {
    core_affinity::set_for_current(core_affinity::CoreId { id: core })
}

/// Applies a portable priority in `-127..=127` (0 = normal) to the calling
/// thread, mapped onto the scheduler's priority range for its current
/// policy. Best effort; many schedulers expose an empty range.
#[cfg(unix)]
pub fn set_current_priority(priority: i8) {
    unsafe {
        let thread = libc::pthread_self();
        let mut policy: libc::c_int = 0;
        let mut param: libc::sched_param = std::mem::zeroed();
        if libc::pthread_getschedparam(thread, &mut policy, &mut param) != 0 {
            return;
        }
        let min = libc::sched_get_priority_min(policy);
        let max = libc::sched_get_priority_max(policy);
        if min >= max {
            return;
        }
        param.sched_priority = min + ((priority as i32 + 127) * (max - min)) / 254;
        let _ = libc::pthread_setschedparam(thread, policy, &param);
    }
}

#[cfg(not(unix))]
pub fn set_current_priority(_priority: i8) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn wait_consumes_posted_permit() {
        let wo = WaitObject::new();
        wo.post(1);
        assert!(wo.wait(Some(Duration::from_millis(10))));
        assert!(!wo.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn wait_times_out_without_permit() {
        let wo = WaitObject::new();
        let start = Instant::now();
        assert!(!wo.wait(Some(Duration::from_millis(50))));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn post_wakes_a_blocked_waiter() {
        let wo = Arc::new(WaitObject::new());
        let waiter = {
            let wo = wo.clone();
            std::thread::spawn(move || wo.wait(Some(Duration::from_secs(5))))
        };
        std::thread::sleep(Duration::from_millis(20));
        wo.post(1);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn drain_discards_permits() {
        let wo = WaitObject::new();
        wo.post(3);
        wo.drain();
        assert!(!wo.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn processor_count_is_stable() {
        let a = processor_count();
        let b = processor_count();
        assert!(a >= 1);
        assert_eq!(a, b);
    }
}
