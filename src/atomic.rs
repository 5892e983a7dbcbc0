//! Lock-free atomic counter.
//!
//! `AtomicCounter` is the basic building block the locks are assembled from.
//! Every operation is a single hardware atomic with sequentially consistent
//! ordering, so counters double as publication points between threads.

use std::sync::atomic::{AtomicI32, Ordering};

/// Policy applied when a decrement would drive a counter negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativePolicy {
    /// Assert in debug builds; release builds let the value go negative.
    DebugCheck,
    /// Saturate at zero.
    Clamp,
}

/// A shared `i32` counter with atomic read-modify-write operations.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicI32);

impl AtomicCounter {
    pub const fn new(value: i32) -> Self {
        AtomicCounter(AtomicI32::new(value))
    }

    pub fn load(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn store(&self, value: i32) {
        self.0.store(value, Ordering::SeqCst);
    }

    /// Adds `n`, returning the previous value.
    pub fn fetch_add(&self, n: i32) -> i32 {
        self.0.fetch_add(n, Ordering::SeqCst)
    }

    /// Adds `n`, returning the new value.
    pub fn add_fetch(&self, n: i32) -> i32 {
        self.0.fetch_add(n, Ordering::SeqCst) + n
    }

    /// Subtracts `n`, returning the previous value.
    pub fn fetch_sub(&self, n: i32) -> i32 {
        self.0.fetch_sub(n, Ordering::SeqCst)
    }

    /// Subtracts `n`, returning the new value.
    pub fn sub_fetch(&self, n: i32) -> i32 {
        self.0.fetch_sub(n, Ordering::SeqCst) - n
    }

    /// Subtracts `n` under the given negative-value policy, returning the
    /// new value.
    pub fn sub_fetch_with(&self, n: i32, policy: NegativePolicy) -> i32 {
        match policy {
            NegativePolicy::DebugCheck => {
                let value = self.sub_fetch(n);
                debug_assert!(value >= 0, "counter decremented below zero: {value}");
                value
            }
            NegativePolicy::Clamp => loop {
                let current = self.0.load(Ordering::SeqCst);
                let next = (current - n).max(0);
                if self
                    .0
                    .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return next;
                }
            },
        }
    }

    /// Stores `value`, returning the previous value.
    pub fn swap(&self, value: i32) -> i32 {
        self.0.swap(value, Ordering::SeqCst)
    }

    /// If the current value equals `compare`, stores `new`. Returns the value
    /// observed before the operation, so success is `result == compare`.
    pub fn compare_and_swap(&self, compare: i32, new: i32) -> i32 {
        match self
            .0
            .compare_exchange(compare, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(previous) => previous,
            Err(previous) => previous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn add_and_sub_report_new_and_old_values() {
        let c = AtomicCounter::new(0);
        assert_eq!(c.fetch_add(1), 0);
        assert_eq!(c.add_fetch(1), 2);
        assert_eq!(c.fetch_sub(1), 2);
        assert_eq!(c.sub_fetch(1), 0);
    }

    #[test]
    fn compare_and_swap_returns_observed_value() {
        let c = AtomicCounter::new(5);
        assert_eq!(c.compare_and_swap(5, 9), 5);
        assert_eq!(c.load(), 9);
        assert_eq!(c.compare_and_swap(5, 1), 9);
        assert_eq!(c.load(), 9);
    }

    #[test]
    fn debug_check_policy_passes_valid_decrements() {
        let c = AtomicCounter::new(2);
        assert_eq!(c.sub_fetch_with(1, NegativePolicy::DebugCheck), 1);
        assert_eq!(c.sub_fetch_with(1, NegativePolicy::DebugCheck), 0);
    }

    #[test]
    fn clamp_policy_saturates_at_zero() {
        let c = AtomicCounter::new(1);
        assert_eq!(c.sub_fetch_with(3, NegativePolicy::Clamp), 0);
        assert_eq!(c.load(), 0);
    }

    #[test]
    fn swap_is_total() {
        let c = AtomicCounter::new(-1);
        assert_eq!(c.swap(7), -1);
        assert_eq!(c.swap(0), 7);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let c = Arc::new(AtomicCounter::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = c.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        c.fetch_add(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.load(), 80_000);
    }
}
