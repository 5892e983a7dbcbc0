//! Wakeable wait condition.
//!
//! `WaitCondition` is a binary signal threads can block on. In auto-reset
//! mode a signal admits exactly one waiter and flips back; in manual-reset
//! mode it stays signalled until `reset()`. `wake_one` wakes at most one
//! already-blocked waiter and is a no-op otherwise, it is never queued.
//!
//! A blocked `wait` is a cancellation checkpoint: it sleeps in bounded
//! slices and polls the calling thread's cancellation token between them,
//! so `request_termination` interrupts it within a bounded delay.

use crate::atomic::{AtomicCounter, NegativePolicy};
use crate::mutex::FastMutex;
use crate::platform::WaitObject;
use crate::scoped::ScopedLock;
use crate::{cache, thread};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Upper bound on one uninterruptible sleep inside `wait`.
const CANCEL_POLL_SLICE: Duration = Duration::from_millis(50);

pub struct WaitCondition {
    guard: FastMutex,
    waiters: AtomicCounter,
    signalled: AtomicBool,
    auto_reset: bool,
    permits: Option<WaitObject>,
}

impl WaitCondition {
    /// `auto_reset` controls whether a signal admits one waiter or all;
    /// `initially_signalled` sets the starting state.
    pub fn new(auto_reset: bool, initially_signalled: bool) -> Self {
        WaitCondition {
            guard: FastMutex::new(),
            waiters: AtomicCounter::new(0),
            signalled: AtomicBool::new(initially_signalled),
            auto_reset,
            permits: Some(cache::global().acquire()),
        }
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::SeqCst)
    }

    /// Forces the condition back to non-signalled.
    pub fn reset(&self) {
        let _h = ScopedLock::new(&self.guard);
        self.signalled.store(false, Ordering::SeqCst);
    }

    fn permits(&self) -> &WaitObject {
        // Only `drop` takes the object out.
        self.permits.as_ref().unwrap_or_else(|| unreachable!())
    }

    /// Blocks until signalled or until `timeout` elapses (`None` waits
    /// forever). Returns whether the condition was signalled.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut h = ScopedLock::new(&self.guard);
        if self.signalled.load(Ordering::SeqCst) {
            if self.auto_reset {
                self.signalled.store(false, Ordering::SeqCst);
            }
            return true;
        }
        self.waiters.fetch_add(1);
        let registered = WaiterRegistration(self);
        h.unlock();

        let woken = self.wait_for_permit(timeout);

        h.relock();
        drop(registered);
        if self.auto_reset {
            self.signalled.store(false, Ordering::SeqCst);
        }
        woken
    }

    /// Sleeps on the permit object in slices, checking for cooperative
    /// cancellation between slices. Unwinds from the checkpoint if the
    /// calling thread has been told to terminate.
    fn wait_for_permit(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let slice = match deadline {
                None => CANCEL_POLL_SLICE,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    (deadline - now).min(CANCEL_POLL_SLICE)
                }
            };
            if self.permits().wait(Some(slice)) {
                return true;
            }
            thread::check_for_terminate();
        }
    }

    /// Wakes one blocked waiter. Does nothing, and records nothing, if no
    /// thread is blocked.
    pub fn wake_one(&self) {
        let _h = ScopedLock::new(&self.guard);
        if self.waiters.load() > 0 {
            self.permits().post(1);
        }
    }

    /// Wakes every blocked waiter. With no waiters, or in manual-reset mode,
    /// the condition becomes signalled so subsequent waits pass (one wait in
    /// auto-reset mode, every wait until `reset()` otherwise).
    pub fn wake_all(&self) {
        let _h = ScopedLock::new(&self.guard);
        let waiters = self.waiters.load();
        if waiters > 0 {
            self.permits().post(waiters as usize);
        }
        if waiters == 0 || !self.auto_reset {
            self.signalled.store(true, Ordering::SeqCst);
        }
    }
}

impl Drop for WaitCondition {
    fn drop(&mut self) {
        debug_assert!(self.waiters.load() == 0, "WaitCondition dropped with waiters");
        if let Some(wo) = self.permits.take() {
            cache::global().release(wo);
        }
    }
}

/// Keeps the waiter count balanced even when a cancellation checkpoint
/// unwinds out of `wait`.
struct WaiterRegistration<'a>(&'a WaitCondition);

impl Drop for WaiterRegistration<'_> {
    fn drop(&mut self) {
        self.0.waiters.sub_fetch_with(1, NegativePolicy::DebugCheck);
    }
}

impl std::fmt::Debug for WaitCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitCondition")
            .field("auto_reset", &self.auto_reset)
            .field("signalled", &self.is_signalled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn initially_signalled_passes_immediately() {
        let wc = WaitCondition::new(true, true);
        assert!(wc.wait(Some(Duration::from_millis(10))));
        // auto-reset consumed the signal
        assert!(!wc.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn manual_reset_stays_signalled_until_reset() {
        let wc = WaitCondition::new(false, false);
        wc.wake_all();
        assert!(wc.wait(Some(Duration::from_millis(10))));
        assert!(wc.wait(Some(Duration::from_millis(10))));
        wc.reset();
        assert!(!wc.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn wake_one_without_waiters_is_not_queued() {
        let wc = WaitCondition::new(false, false);
        wc.wake_one();
        assert!(!wc.is_signalled());
        assert!(!wc.wait(Some(Duration::from_millis(20))));
    }

    #[test]
    fn wake_all_without_waiters_latches_in_auto_reset_mode() {
        let wc = WaitCondition::new(true, false);
        wc.wake_all();
        assert!(wc.wait(Some(Duration::from_millis(10))));
        assert!(!wc.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn wake_one_admits_exactly_one_of_two_waiters() {
        let wc = Arc::new(WaitCondition::new(true, false));
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let wc = wc.clone();
                std::thread::spawn(move || wc.wait(Some(Duration::from_millis(400))))
            })
            .collect();
        std::thread::sleep(Duration::from_millis(100));
        wc.wake_one();
        let results: Vec<bool> = waiters.into_iter().map(|w| w.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|&&r| r).count(), 1);
    }

    #[test]
    fn manual_reset_wake_reaches_a_waiter_arriving_after_wake_all() {
        let wc = Arc::new(WaitCondition::new(false, false));
        let registered = {
            let wc = wc.clone();
            std::thread::spawn(move || wc.wait(Some(Duration::from_secs(5))))
        };
        std::thread::sleep(Duration::from_millis(100));
        wc.wake_all();
        // A waiter arriving only now must pass as well.
        assert!(wc.wait(Some(Duration::from_secs(5))));
        assert!(registered.join().unwrap());
    }

    #[test]
    fn wake_all_admits_every_waiter() {
        let wc = Arc::new(WaitCondition::new(true, false));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let wc = wc.clone();
                std::thread::spawn(move || wc.wait(Some(Duration::from_secs(5))))
            })
            .collect();
        std::thread::sleep(Duration::from_millis(100));
        wc.wake_all();
        for w in waiters {
            assert!(w.join().unwrap());
        }
    }

    #[test]
    fn wait_times_out() {
        let wc = WaitCondition::new(true, false);
        let start = Instant::now();
        assert!(!wc.wait(Some(Duration::from_millis(120))));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
