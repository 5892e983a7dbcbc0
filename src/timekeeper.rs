//! Delayed-job timekeeper.
//!
//! One background thread serves every pool in the process. It keeps the
//! delayed jobs in due-time order, sleeps until the earliest is due, and
//! re-dispatches due jobs to their pool as immediate work. Inserting or
//! re-timing an entry wakes the thread early so a shortened delay takes
//! effect at once.
//!
//! The singleton starts lazily on the first delayed dispatch. Pools purge
//! their entries when dropped; entries whose pool disappeared anyway are
//! cancelled instead of fired.

use crate::pool::{self, JobHandle, PoolShared};
use crate::thread::{self, CancellableThread, Task};
use crate::wait::WaitCondition;
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

lazy_static! {
    static ref GLOBAL: TimeKeeper = TimeKeeper::new();
}

static STARTED: AtomicBool = AtomicBool::new(false);

/// The process-wide timekeeper, started on first use.
pub fn global() -> &'static TimeKeeper {
    STARTED.store(true, Ordering::SeqCst);
    &GLOBAL
}

/// Purges a pool's entries without forcing the singleton into existence.
pub(crate) fn purge_if_running(pool_id: u64) {
    if STARTED.load(Ordering::SeqCst) {
        GLOBAL.purge_pool(pool_id);
    }
}

struct Entry {
    due: Instant,
    job: JobHandle,
    target: Weak<PoolShared>,
}

struct KeeperShared {
    /// Sorted by due time, earliest first.
    entries: Mutex<Vec<Entry>>,
    wake: WaitCondition,
}

pub struct TimeKeeper {
    shared: Arc<KeeperShared>,
    thread: Mutex<Option<CancellableThread>>,
}

impl TimeKeeper {
    /// Starts a keeper with its own background thread. Production code uses
    /// [`global`]; standalone instances exist so tests can run in isolation.
    pub fn new() -> Self {
        let shared = Arc::new(KeeperShared {
            entries: Mutex::new(Vec::new()),
            wake: WaitCondition::new(true, false),
        });
        let mut keeper = CancellableThread::new(
            "timekeeper",
            KeeperTask {
                shared: shared.clone(),
            },
        );
        if let Err(error) = keeper.start(false) {
            tracing::warn!(%error, "could not start timekeeper; delayed jobs will not fire");
        }
        TimeKeeper {
            shared,
            thread: Mutex::new(Some(keeper)),
        }
    }

    pub(crate) fn insert(&self, due: Instant, target: Weak<PoolShared>, job: JobHandle) {
        {
            let mut entries = self.shared.entries.lock().unwrap();
            let pos = entries.partition_point(|e| e.due <= due);
            entries.insert(pos, Entry { due, job, target });
        }
        self.shared.wake.wake_all();
    }

    /// Removes the entry for `job_id`. Returns whether it was present.
    pub(crate) fn remove(&self, job_id: u64) -> bool {
        let removed = {
            let mut entries = self.shared.entries.lock().unwrap();
            match entries.iter().position(|e| e.job.id() == job_id) {
                Some(pos) => {
                    entries.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.shared.wake.wake_all();
        }
        removed
    }

    /// Moves the entry for `job_id` to a new due time. Returns whether it
    /// was still parked here.
    pub(crate) fn reset(&self, job_id: u64, due: Instant) -> bool {
        let found = {
            let mut entries = self.shared.entries.lock().unwrap();
            match entries.iter().position(|e| e.job.id() == job_id) {
                Some(pos) => {
                    let mut entry = entries.remove(pos);
                    entry.due = due;
                    let pos = entries.partition_point(|e| e.due <= due);
                    entries.insert(pos, entry);
                    true
                }
                None => false,
            }
        };
        if found {
            self.shared.wake.wake_all();
        }
        found
    }

    /// Drops, and cancels, every entry belonging to `pool_id`.
    pub(crate) fn purge_pool(&self, pool_id: u64) {
        let purged: Vec<Entry> = {
            let mut entries = self.shared.entries.lock().unwrap();
            let (purged, kept): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut *entries)
                .into_iter()
                .partition(|e| e.job.pool_id() == pool_id);
            *entries = kept;
            purged
        };
        for entry in &purged {
            pool::cancel_unclaimed(&entry.job);
        }
        if !purged.is_empty() {
            self.shared.wake.wake_all();
        }
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.shared.entries.lock().unwrap().len()
    }
}

impl Default for TimeKeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimeKeeper {
    fn drop(&mut self) {
        if let Some(keeper) = self.thread.lock().unwrap().take() {
            keeper.request_termination();
            self.shared.wake.wake_all();
            keeper.wait(None);
        }
    }
}

struct KeeperTask {
    shared: Arc<KeeperShared>,
}

impl Task for KeeperTask {
    fn run(&mut self) {
        let mut until_next: Option<Duration> = None;
        loop {
            self.shared.wake.wait(until_next);
            thread::check_for_terminate();
            let now = Instant::now();
            let due: Vec<Entry> = {
                let mut entries = self.shared.entries.lock().unwrap();
                let split = entries.partition_point(|e| e.due <= now);
                entries.drain(..split).collect()
            };
            for entry in due {
                match entry.target.upgrade() {
                    Some(pool) => pool::dispatch_queued(&pool, entry.job),
                    None => {
                        // The pool died without purging; never fire the job.
                        pool::cancel_unclaimed(&entry.job);
                    }
                }
            }
            until_next = self
                .shared
                .entries
                .lock()
                .unwrap()
                .first()
                .map(|e| e.due.saturating_duration_since(Instant::now()));
        }
    }
}
