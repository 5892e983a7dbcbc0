use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use threadcore::{FastMutex, ReadWriteLock, ScopedLock};

fn bench_locks(c: &mut Criterion) {
    let mutex = FastMutex::new();
    c.bench_function("fast_mutex_uncontended", |b| {
        b.iter(|| {
            mutex.lock();
            black_box(&mutex);
            mutex.unlock();
        })
    });

    c.bench_function("fast_mutex_recursive_pair", |b| {
        b.iter(|| {
            mutex.lock();
            mutex.lock();
            mutex.unlock();
            mutex.unlock();
        })
    });

    c.bench_function("fast_mutex_scoped_guard", |b| {
        b.iter(|| {
            let _h = ScopedLock::new(&mutex);
            black_box(&mutex);
        })
    });

    let rwlock = ReadWriteLock::new();
    c.bench_function("rwlock_read_uncontended", |b| {
        b.iter(|| {
            rwlock.lock(false);
            black_box(&rwlock);
            rwlock.unlock(false);
        })
    });

    c.bench_function("rwlock_write_uncontended", |b| {
        b.iter(|| {
            rwlock.lock(true);
            black_box(&rwlock);
            rwlock.unlock(true);
        })
    });
}

criterion_group!(benches, bench_locks);
criterion_main!(benches);
