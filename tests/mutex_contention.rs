use std::cell::UnsafeCell;
use std::sync::Arc;
use threadcore::{FastMutex, ScopedLock};

/// Plain data protected by an external FastMutex.
struct Protected(UnsafeCell<u64>);
unsafe impl Sync for Protected {}
unsafe impl Send for Protected {}

#[test]
fn counter_protected_by_fast_mutex_is_exact() {
    const THREADS: usize = 64;
    const INCREMENTS: usize = 10_000;

    let lock = Arc::new(FastMutex::new());
    let value = Arc::new(Protected(UnsafeCell::new(0)));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let lock = lock.clone();
            let value = value.clone();
            std::thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    let _h = ScopedLock::new(&lock);
                    unsafe { *value.0.get() += 1 };
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let _h = ScopedLock::new(&lock);
    assert_eq!(unsafe { *value.0.get() }, (THREADS * INCREMENTS) as u64);
}

#[test]
fn nested_locks_block_other_threads_until_fully_released() {
    let lock = Arc::new(FastMutex::new());
    lock.lock();
    lock.lock();

    let observer = lock.clone();
    assert!(!std::thread::spawn(move || observer.try_lock()).join().unwrap());

    lock.unlock();
    // Still one level deep; other threads must still fail.
    let observer = lock.clone();
    assert!(!std::thread::spawn(move || observer.try_lock()).join().unwrap());

    lock.unlock();
    let observer = lock.clone();
    let acquired = std::thread::spawn(move || {
        let got = observer.try_lock();
        if got {
            observer.unlock();
        }
        got
    })
    .join()
    .unwrap();
    assert!(acquired);
}

#[test]
fn low_spin_count_still_serializes_under_contention() {
    let lock = Arc::new(FastMutex::with_spin_count(0));
    let value = Arc::new(Protected(UnsafeCell::new(0)));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let lock = lock.clone();
            let value = value.clone();
            std::thread::spawn(move || {
                for _ in 0..2_000 {
                    lock.lock();
                    unsafe { *value.0.get() += 1 };
                    lock.unlock();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    lock.lock();
    assert_eq!(unsafe { *value.0.get() }, 32_000);
    lock.unlock();
}

#[test]
fn spin_count_is_adjustable_at_runtime() {
    let lock = FastMutex::new();
    assert_eq!(lock.spin_count(), 4000);
    lock.set_spin_count(128);
    assert_eq!(lock.spin_count(), 128);
    lock.lock();
    lock.unlock();
}

#[test]
fn guard_releases_even_when_the_holder_unwinds() {
    let lock = Arc::new(FastMutex::new());
    let inner = lock.clone();
    let _ = std::thread::spawn(move || {
        let _h = ScopedLock::new(&inner);
        panic!("holder dies");
    })
    .join();

    // The lock must be usable again.
    let observer = lock.clone();
    let acquired = std::thread::spawn(move || {
        let got = observer.try_lock();
        if got {
            observer.unlock();
        }
        got
    })
    .join()
    .unwrap();
    assert!(acquired);
}
