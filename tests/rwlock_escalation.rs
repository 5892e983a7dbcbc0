use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use threadcore::{LockState, ReadWriteLock, ScopedRwLock};

/// An array that must only ever be observed with all slots equal.
struct Slots(UnsafeCell<[u64; 64]>);
unsafe impl Sync for Slots {}
unsafe impl Send for Slots {}

#[test]
fn readers_never_observe_partial_writes() {
    let lock = Arc::new(ReadWriteLock::new());
    let slots = Arc::new(Slots(UnsafeCell::new([0; 64])));
    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..3)
        .map(|w| {
            let lock = lock.clone();
            let slots = slots.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut stamp = w as u64;
                while !stop.load(Ordering::SeqCst) {
                    stamp += 3;
                    let h = ScopedRwLock::new(&lock, true);
                    let slots = unsafe { &mut *slots.0.get() };
                    for slot in slots.iter_mut() {
                        *slot = stamp;
                    }
                    drop(h);
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let lock = lock.clone();
            let slots = slots.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let h = ScopedRwLock::new(&lock, false);
                    let slots = unsafe { &*slots.0.get() };
                    let first = slots[0];
                    assert!(
                        slots.iter().all(|&s| s == first),
                        "observed a write in progress"
                    );
                    drop(h);
                }
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(400));
    stop.store(true, Ordering::SeqCst);
    for h in writers.into_iter().chain(readers) {
        h.join().unwrap();
    }
}

#[test]
fn concurrent_escalation_warns_the_loser() {
    let lock = Arc::new(ReadWriteLock::new());
    let barrier = Arc::new(Barrier::new(2));
    let losses = Arc::new(AtomicUsize::new(0));

    let escalators: Vec<_> = (0..2)
        .map(|_| {
            let lock = lock.clone();
            let barrier = barrier.clone();
            let losses = losses.clone();
            std::thread::spawn(move || {
                lock.lock(false);
                barrier.wait();
                let lost = lock.lock(true);
                if lost {
                    losses.fetch_add(1, Ordering::SeqCst);
                }
                lock.unlock(true);
                lock.unlock(false);
            })
        })
        .collect();
    for h in escalators {
        h.join().unwrap();
    }
    // Both escalated; exactly one went second and lost its read lock.
    assert_eq!(losses.load(Ordering::SeqCst), 1);
}

#[test]
fn three_way_escalation_all_losers_warned() {
    let lock = Arc::new(ReadWriteLock::new());
    let barrier = Arc::new(Barrier::new(3));
    let losses = Arc::new(AtomicUsize::new(0));

    let escalators: Vec<_> = (0..3)
        .map(|_| {
            let lock = lock.clone();
            let barrier = barrier.clone();
            let losses = losses.clone();
            std::thread::spawn(move || {
                lock.lock(false);
                barrier.wait();
                let lost = lock.lock(true);
                if lost {
                    losses.fetch_add(1, Ordering::SeqCst);
                }
                lock.unlock(true);
                lock.unlock(false);
            })
        })
        .collect();
    for h in escalators {
        h.join().unwrap();
    }
    assert_eq!(losses.load(Ordering::SeqCst), 2);
}

#[test]
fn writers_are_preferred_over_new_readers() {
    let lock = Arc::new(ReadWriteLock::new());
    lock.lock(false);

    let writer_lock = lock.clone();
    let writer = std::thread::spawn(move || {
        writer_lock.lock(true);
        writer_lock.unlock(true);
    });
    // Give the writer time to register as pending.
    std::thread::sleep(Duration::from_millis(50));

    // A first-time reader must now queue behind the pending writer.
    let reader_lock = lock.clone();
    assert!(!std::thread::spawn(move || reader_lock.try_lock(false))
        .join()
        .unwrap());

    lock.unlock(false);
    writer.join().unwrap();
}

// Wakes from write unlocks race the gap between a waiter's predicate check
// and its block; every queued reader and writer must still get through.
#[test]
fn writer_churn_never_strands_first_time_readers() {
    let lock = Arc::new(ReadWriteLock::new());
    let writer_lock = lock.clone();
    let writer = std::thread::spawn(move || {
        for _ in 0..200 {
            writer_lock.lock(true);
            writer_lock.unlock(true);
        }
    });
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let lock = lock.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    lock.lock(false);
                    lock.unlock(false);
                }
            })
        })
        .collect();
    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(lock.state(), LockState::Unlocked);
}

#[test]
fn escalation_guard_reports_lock_lost() {
    let lock = ReadWriteLock::new();
    let read = ScopedRwLock::new(&lock, false);
    let write = ScopedRwLock::new(&lock, true);
    assert!(!write.lock_lost());
    drop(write);
    drop(read);
}
