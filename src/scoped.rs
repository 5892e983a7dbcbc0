//! RAII lock holds.

use crate::mutex::FastMutex;
use crate::rwlock::ReadWriteLock;

/// Holds a [`FastMutex`] for a scope, with mid-scope `unlock`/`relock`.
/// The mutex is released on every exit path, including unwinding.
pub struct ScopedLock<'a> {
    mutex: &'a FastMutex,
    locked: bool,
}

impl<'a> ScopedLock<'a> {
    pub fn new(mutex: &'a FastMutex) -> Self {
        mutex.lock();
        ScopedLock { mutex, locked: true }
    }

    /// Takes the hold without locking; `relock` acquires later.
    pub fn deferred(mutex: &'a FastMutex) -> Self {
        ScopedLock { mutex, locked: false }
    }

    pub fn unlock(&mut self) {
        if self.locked {
            self.locked = false;
            self.mutex.unlock();
        }
    }

    pub fn relock(&mut self) {
        if !self.locked {
            self.mutex.lock();
            self.locked = true;
        }
    }
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Holds a [`ReadWriteLock`] for a scope, in read or write mode.
pub struct ScopedRwLock<'a> {
    lock: &'a ReadWriteLock,
    write: bool,
    locked: bool,
    lock_lost: bool,
}

impl<'a> ScopedRwLock<'a> {
    pub fn new(lock: &'a ReadWriteLock, write: bool) -> Self {
        let lock_lost = lock.lock(write);
        ScopedRwLock {
            lock,
            write,
            locked: true,
            lock_lost,
        }
    }

    /// Whether taking this hold in write mode had to give up a previously
    /// held read lock while other writers ran.
    pub fn lock_lost(&self) -> bool {
        self.lock_lost
    }

    pub fn unlock(&mut self) {
        if self.locked {
            self.locked = false;
            self.lock.unlock(self.write);
        }
    }

    pub fn relock(&mut self) {
        if !self.locked {
            self.lock_lost = self.lock.lock(self.write);
            self.locked = true;
        }
    }
}

impl Drop for ScopedRwLock<'_> {
    fn drop(&mut self) {
        self.unlock();
    }
}
