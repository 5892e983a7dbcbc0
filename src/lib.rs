//! # threadcore
//!
//! A cross-platform concurrency runtime: fast user-space locks, a
//! reader-writer lock with read-to-write escalation, wakeable wait
//! conditions, cancellable threads with guaranteed cleanup, and a worker
//! thread pool with delayed dispatch.
//!
//! ## Architecture
//!
//! - [`AtomicCounter`] is the lock-free base everything else counts with.
//! - [`FastMutex`] acquires in user space and only touches a pooled kernel
//!   wait object (see [`cache`]) under contention.
//! - [`WaitCondition`] and [`ReadWriteLock`] are built on `FastMutex`;
//!   escalating a read lock to write can lose the read lock to a competing
//!   writer, which [`ReadWriteLock::lock`] reports so callers revalidate.
//! - [`CancellableThread`] adds cooperative cancellation to native threads:
//!   termination is requested, noticed at checkpoints, and unwinds into an
//!   exactly-once cleanup phase.
//! - [`ThreadPool`] runs opaque jobs on cancellable workers; delayed jobs
//!   wait with the process-wide [`timekeeper`].
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use threadcore::ThreadPool;
//!
//! let pool = ThreadPool::new(4).unwrap();
//! let job = pool.dispatch(|| println!("hello from a worker"), Duration::ZERO);
//! pool.wait(&job, None);
//! ```

pub mod atomic;
pub mod cache;
pub mod error;
pub mod exit;
pub mod mutex;
pub mod platform;
pub mod pool;
pub mod rwlock;
pub mod scoped;
pub mod thread;
pub mod timekeeper;
pub mod wait;

pub use atomic::{AtomicCounter, NegativePolicy};
pub use cache::KernelWaitObjectCache;
pub use error::Error;
pub use exit::{register_exit_hook, run_exit_hooks, unregister_exit_hook, ExitHookId};
pub use mutex::FastMutex;
pub use pool::{CancelOutcome, JobHandle, JobPhase, JobState, PoolConfig, ThreadPool};
pub use rwlock::{LockState, ReadWriteLock};
pub use scoped::{ScopedLock, ScopedRwLock};
pub use thread::{
    add_creation_upcall, check_for_terminate, current, current_thread_id, remove_creation_upcall,
    CancellableThread, Task, TerminationGuard, ThreadControl, ThreadState,
};
pub use timekeeper::TimeKeeper;
pub use wait::WaitCondition;
