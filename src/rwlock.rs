//! Recursive reader-writer lock with read-to-write escalation.
//!
//! Any number of threads may hold the read lock; one thread holds the write
//! lock. Both modes are recursive per thread, and a thread already holding
//! the read lock may escalate to write. Escalation has to park the caller's
//! own read claims while the remaining readers drain, so a competing writer
//! can run in the gap; [`lock`](ReadWriteLock::lock) returns `lock_lost =
//! true` when that happened and the caller must revalidate anything it read
//! before escalating.
//!
//! Writers are preferred: once a writer is waiting, new first-time readers
//! queue behind it.

use crate::atomic::{AtomicCounter, NegativePolicy};
use crate::mutex::FastMutex;
use crate::scoped::ScopedLock;
use crate::thread::{self, TerminationGuard};
use crate::wait::WaitCondition;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

/// Momentary lock state, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockState {
    Unlocked = 0,
    ReadOnly = 1,
    ReadWrite = 2,
}

impl LockState {
    fn from_u8(value: u8) -> LockState {
        match value {
            1 => LockState::ReadOnly,
            2 => LockState::ReadWrite,
            _ => LockState::Unlocked,
        }
    }
}

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Read-lock recursion depth per lock, for the calling thread.
    static READ_COUNTS: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

pub struct ReadWriteLock {
    id: u64,
    guard: FastMutex,
    /// Total read claims across threads, including a writer's own reads.
    readers: AtomicCounter,
    /// Writers (and escalators) between deciding to write and acquiring.
    pending_writers: AtomicCounter,
    /// Read claims parked by escalators currently draining readers.
    parked_reads: AtomicCounter,
    writer: AtomicU64,
    writer_recursion: AtomicCounter,
    /// Hand-off flag from one escalator to the others it overtook.
    read_lock_lost: AtomicBool,
    state: AtomicU8,
    writer_drained: WaitCondition,
    reader_drained: WaitCondition,
    writer_path_clear: WaitCondition,
}

impl ReadWriteLock {
    pub fn new() -> Self {
        ReadWriteLock {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            guard: FastMutex::new(),
            readers: AtomicCounter::new(0),
            pending_writers: AtomicCounter::new(0),
            parked_reads: AtomicCounter::new(0),
            writer: AtomicU64::new(0),
            writer_recursion: AtomicCounter::new(0),
            read_lock_lost: AtomicBool::new(false),
            state: AtomicU8::new(LockState::Unlocked as u8),
            // Manual reset: a wake landing between a predicate check and the
            // wait latches instead of going to whoever registered first, so
            // drain loops never miss it. Waiters reset before blocking.
            writer_drained: WaitCondition::new(false, false),
            reader_drained: WaitCondition::new(false, false),
            writer_path_clear: WaitCondition::new(false, false),
        }
    }

    pub fn state(&self) -> LockState {
        LockState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn own_read_count(&self) -> usize {
        READ_COUNTS.with(|counts| counts.borrow().get(&self.id).copied().unwrap_or(0))
    }

    fn set_own_read_count(&self, count: usize) {
        READ_COUNTS.with(|counts| {
            let mut counts = counts.borrow_mut();
            if count == 0 {
                counts.remove(&self.id);
            } else {
                counts.insert(self.id, count);
            }
        });
    }

    /// Acquires in read (`write = false`) or write (`write = true`) mode.
    ///
    /// Returns whether a read lock was lost during escalation: `true` means
    /// another writer ran between this thread's last read observation and
    /// its acquisition of the write lock. Plain read acquisition and
    /// recursive re-entry always return `false`.
    pub fn lock(&self, write: bool) -> bool {
        if write {
            self.lock_write()
        } else {
            self.lock_read();
            false
        }
    }

    fn lock_write(&self) -> bool {
        let me = thread::current_thread_id();
        let mut h = ScopedLock::new(&self.guard);
        if self.writer.load(Ordering::SeqCst) == me {
            self.writer_recursion.fetch_add(1);
            return false;
        }
        self.pending_writers.fetch_add(1);
        let own_reads = self.own_read_count() as i32;
        let overtook_escalator;
        loop {
            while self.writer.load(Ordering::SeqCst) != 0 {
                self.writer_drained.reset();
                h.unlock();
                {
                    let _no_cancel = TerminationGuard::new();
                    self.writer_drained.wait(None);
                }
                h.relock();
            }
            // Park our own read claims so the drain below can reach zero,
            // and so other escalators can drain past us.
            self.readers.sub_fetch_with(own_reads, NegativePolicy::DebugCheck);
            self.parked_reads.fetch_add(own_reads);
            while self.readers.load() > 0 {
                self.reader_drained.reset();
                h.unlock();
                {
                    let _no_cancel = TerminationGuard::new();
                    self.reader_drained.wait(None);
                }
                h.relock();
            }
            self.readers.fetch_add(own_reads);
            self.parked_reads.sub_fetch_with(own_reads, NegativePolicy::DebugCheck);
            if self.writer.load(Ordering::SeqCst) == 0 {
                overtook_escalator = self.parked_reads.load() != 0;
                break;
            }
        }
        self.writer.store(me, Ordering::SeqCst);
        self.writer_recursion.store(1);
        self.pending_writers.sub_fetch_with(1, NegativePolicy::DebugCheck);
        self.state.store(LockState::ReadWrite as u8, Ordering::SeqCst);
        let mut lock_lost = false;
        if own_reads > 0 {
            // We escalated; a writer that overtook us left the flag set.
            lock_lost = self.read_lock_lost.swap(false, Ordering::SeqCst);
        }
        if overtook_escalator {
            self.read_lock_lost.store(true, Ordering::SeqCst);
        }
        lock_lost
    }

    fn lock_read(&self) {
        let me = thread::current_thread_id();
        let mut h = ScopedLock::new(&self.guard);
        let own = self.own_read_count();
        if own == 0 && self.writer.load(Ordering::SeqCst) != me {
            // First-time readers queue behind pending and active writers.
            while self.pending_writers.load() > 0 || self.writer.load(Ordering::SeqCst) != 0 {
                self.writer_path_clear.reset();
                h.unlock();
                {
                    let _no_cancel = TerminationGuard::new();
                    self.writer_path_clear.wait(None);
                }
                h.relock();
            }
            self.state.store(LockState::ReadOnly as u8, Ordering::SeqCst);
        }
        self.readers.fetch_add(1);
        self.set_own_read_count(own + 1);
    }

    /// Releases one acquisition made in the given mode.
    pub fn unlock(&self, write: bool) {
        if write {
            self.unlock_write();
        } else {
            self.unlock_read();
        }
    }

    fn unlock_write(&self) {
        let me = thread::current_thread_id();
        let _h = ScopedLock::new(&self.guard);
        debug_assert!(
            self.writer.load(Ordering::SeqCst) == me,
            "write unlock by a thread that does not hold the write lock"
        );
        if self.writer_recursion.sub_fetch(1) > 0 {
            return;
        }
        self.writer.store(0, Ordering::SeqCst);
        let next = if self.readers.load() > 0 || self.parked_reads.load() > 0 {
            LockState::ReadOnly
        } else {
            LockState::Unlocked
        };
        self.state.store(next as u8, Ordering::SeqCst);
        self.writer_drained.wake_all();
        self.writer_path_clear.wake_all();
    }

    fn unlock_read(&self) {
        let _h = ScopedLock::new(&self.guard);
        let own = self.own_read_count();
        debug_assert!(own > 0, "read unlock by a thread that holds no read lock");
        if own == 0 {
            return;
        }
        self.set_own_read_count(own - 1);
        if self.readers.sub_fetch_with(1, NegativePolicy::DebugCheck) == 0 {
            if self.writer.load(Ordering::SeqCst) == 0 && self.parked_reads.load() == 0 {
                self.state.store(LockState::Unlocked as u8, Ordering::SeqCst);
            }
            self.reader_drained.wake_all();
        }
    }

    /// Attempts the acquisition without ever blocking, including the reader
    /// drain a blocking write acquisition would perform.
    pub fn try_lock(&self, write: bool) -> bool {
        let me = thread::current_thread_id();
        if !self.guard.try_lock() {
            return false;
        }
        let _h = scopeguard_release(&self.guard);
        if write {
            if self.writer.load(Ordering::SeqCst) == me {
                self.writer_recursion.fetch_add(1);
                return true;
            }
            let own = self.own_read_count() as i32;
            if self.writer.load(Ordering::SeqCst) == 0 && self.readers.load() == own {
                self.writer.store(me, Ordering::SeqCst);
                self.writer_recursion.store(1);
                self.state.store(LockState::ReadWrite as u8, Ordering::SeqCst);
                true
            } else {
                false
            }
        } else {
            let own = self.own_read_count();
            if own > 0
                || self.writer.load(Ordering::SeqCst) == me
                || (self.writer.load(Ordering::SeqCst) == 0 && self.pending_writers.load() == 0)
            {
                if self.writer.load(Ordering::SeqCst) == 0 {
                    self.state.store(LockState::ReadOnly as u8, Ordering::SeqCst);
                }
                self.readers.fetch_add(1);
                self.set_own_read_count(own + 1);
                true
            } else {
                false
            }
        }
    }
}

/// Unlocks an already-locked FastMutex on scope exit.
fn scopeguard_release(m: &FastMutex) -> impl Drop + '_ {
    struct Release<'a>(&'a FastMutex);
    impl Drop for Release<'_> {
        fn drop(&mut self) {
            self.0.unlock();
        }
    }
    Release(m)
}

impl Default for ReadWriteLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReadWriteLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadWriteLock")
            .field("state", &self.state())
            .field("readers", &self.readers.load())
            .field("pending_writers", &self.pending_writers.load())
            .finish()
    }
}
