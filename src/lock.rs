//! The lock module.
//!
//! Contains the lock and guard types the rest of the kernel builds on.
//! `SleepableLock` pairs a mutex with a condition variable so that a guard
//! can `sleep()` until another holder calls `wakeup()`; this is the primitive
//! behind the cache's "no readers/writers remain" drain and the read-ahead
//! queue. `Semaphore` is the counting semaphore used for parent/child exit
//! synchronization.

use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Mutual exclusion lock whose guards can sleep.
pub struct SleepableLock<T> {
    /// Name of lock for debugging.
    name: &'static str,
    data: Mutex<T>,
    cond: Condvar,
}

/// Guards of `SleepableLock<T>`. These guards can `sleep()`/`wakeup()`.
pub struct SleepableLockGuard<'s, T> {
    lock: &'s SleepableLock<T>,
    guard: MutexGuard<'s, T>,
}

impl<T> SleepableLock<T> {
    /// Returns a new `SleepableLock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            data: Mutex::new(data),
            cond: Condvar::new(),
        }
    }

    /// Acquires the lock and returns the lock guard.
    pub fn lock(&self) -> SleepableLockGuard<'_, T> {
        SleepableLockGuard {
            lock: self,
            guard: self.data.lock(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> SleepableLockGuard<'_, T> {
    /// Atomically releases the lock and suspends until `wakeup()`, then
    /// reacquires before returning.
    pub fn sleep(&mut self) {
        self.lock.cond.wait(&mut self.guard);
    }

    /// Like `sleep`, but gives up after `dur`. Returns true on timeout.
    pub fn sleep_for(&mut self, dur: Duration) -> bool {
        self.lock.cond.wait_for(&mut self.guard, dur).timed_out()
    }

    /// Wakes every guard sleeping on this lock.
    pub fn wakeup(&self) {
        self.lock.cond.notify_all();
    }
}

impl<T> core::ops::Deref for SleepableLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> core::ops::DerefMut for SleepableLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Counting semaphore.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub const fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Decrements the count, sleeping until it is positive.
    pub fn down(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Increments the count and wakes one sleeper.
    pub fn up(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }
}
