//! # Lock Counting and the Access Guard
//!
//! Chunks and mechanisms are locked by iterators through **signed depth
//! counters** rather than exclusive locks.
//!
//! ## State Encoding
//!
//! | Depth | Meaning |
//! |------:|--------|
//! | `0` | Unlocked: any structural mutation is allowed |
//! | `> 0` | Liquid: `depth` mutable iterators in flight; rows may be appended, removals leave stale rows |
//! | `< 0` | Solid: `-depth` read-only iterators in flight; structural mutations are deferred |
//!
//! Locks of the same sign stack; acquiring a lock of the opposite sign fails
//! with `Conflict` instead of waiting.
//!
//! ## Access Guard
//!
//! [`AccessGuard`] wraps the mechanism's structural state in a
//! `parking_lot::RwLock`. The guard is not reentrant; a thread-local record of
//! the mechanisms whose writer lock the current thread holds turns what would
//! be a self-deadlock into a `Conflict` error.
//!
//! ## Operatings
//!
//! [`OperatingsCounter`] tracks asynchronous concurrent operations and lets
//! callers wait for all of them with an optional timeout.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::engine::error::{ApparatusError, ApparatusResult};
use crate::engine::types::MechanismID;


/// Mode of an iterator lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Mutable iteration: structural changes are tolerated.
    Liquid,
    /// Read-only iteration: structural changes are deferred.
    Solid,
}

impl LockMode {
    #[inline]
    const fn step(self) -> i32 {
        match self {
            LockMode::Liquid => 1,
            LockMode::Solid => -1,
        }
    }
}

/// Signed lock depth counter.
#[derive(Debug, Default)]
pub struct LockCounter {
    depth: AtomicI32,
}

impl LockCounter {
    /// Creates an unlocked counter.
    #[inline]
    pub const fn new() -> Self {
        Self { depth: AtomicI32::new(0) }
    }

    /// Current depth.
    #[inline]
    pub fn depth(&self) -> i32 {
        self.depth.load(Ordering::Acquire)
    }

    /// `true` when any lock is held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.depth() != 0
    }

    /// `true` when solid locks are held.
    #[inline]
    pub fn is_solid(&self) -> bool {
        self.depth() < 0
    }

    /// `true` when liquid locks are held.
    #[inline]
    pub fn is_liquid(&self) -> bool {
        self.depth() > 0
    }

    /// Adds one lock of `mode`; returns the new depth.
    ///
    /// ## Errors
    /// `Conflict` if a lock of the opposite mode is held.
    pub fn acquire(&self, mode: LockMode) -> ApparatusResult<i32> {
        let step = mode.step();
        let mut current = self.depth.load(Ordering::Acquire);
        loop {
            if current != 0 && current.signum() != step {
                return Err(ApparatusError::Conflict(format!(
                    "cannot take a {mode:?} lock at depth {current}"
                ))
                .surfaced());
            }
            match self.depth.compare_exchange_weak(current, current + step, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(current + step),
                Err(actual) => current = actual,
            }
        }
    }

    /// Removes one lock of `mode`; returns the new depth.
    pub fn release(&self, mode: LockMode) -> i32 {
        let previous = self.depth.fetch_sub(mode.step(), Ordering::AcqRel);
        debug_assert!(
            previous != 0 && previous.signum() == mode.step(),
            "released a {mode:?} lock at depth {previous}"
        );
        previous - mode.step()
    }

    /// Forces the counter back to zero.
    pub(crate) fn clear(&self) {
        self.depth.store(0, Ordering::Release);
    }
}


thread_local! {
    static HELD_WRITERS: Cell<[u64; 4]> = const { Cell::new([0; 4]) };
}

#[inline]
fn writer_bit(id: MechanismID) -> (usize, u64) {
    ((id as usize) / 64, 1u64 << (id % 64))
}

/// `true` if the current thread holds the writer lock of mechanism `id`.
pub fn is_writer_held(id: MechanismID) -> bool {
    let (word, bit) = writer_bit(id);
    HELD_WRITERS.with(|held| held.get()[word] & bit != 0)
}

fn mark_writer(id: MechanismID, held: bool) {
    let (word, bit) = writer_bit(id);
    HELD_WRITERS.with(|cell| {
        let mut words = cell.get();
        if held {
            words[word] |= bit;
        } else {
            words[word] &= !bit;
        }
        cell.set(words);
    });
}

/// Reader-writer guard over a mechanism's structural state.
pub struct AccessGuard<T> {
    owner: MechanismID,
    lock: RwLock<T>,
}

/// Exclusive access to the guarded state; clears the thread-local writer mark on drop.
pub struct WriteAccess<'a, T> {
    owner: MechanismID,
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> AccessGuard<T> {
    /// Wraps `value` for mechanism `owner`.
    pub fn new(owner: MechanismID, value: T) -> Self {
        Self { owner, lock: RwLock::new(value) }
    }

    /// Shared access.
    ///
    /// ## Errors
    /// `Conflict` if the current thread already holds the writer side.
    pub fn read(&self) -> ApparatusResult<RwLockReadGuard<'_, T>> {
        if is_writer_held(self.owner) {
            return Err(ApparatusError::Conflict("reader entry while holding the writer lock".into()).surfaced());
        }
        Ok(self.lock.read())
    }

    /// Exclusive access.
    ///
    /// ## Errors
    /// `Conflict` if the current thread already holds the writer side.
    pub fn write(&self) -> ApparatusResult<WriteAccess<'_, T>> {
        if is_writer_held(self.owner) {
            return Err(ApparatusError::Conflict("recursive writer entry".into()).surfaced());
        }
        let guard = self.lock.write();
        mark_writer(self.owner, true);
        Ok(WriteAccess { owner: self.owner, guard })
    }
}

impl<T> Deref for WriteAccess<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for WriteAccess<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for WriteAccess<'_, T> {
    fn drop(&mut self) {
        mark_writer(self.owner, false);
    }
}


/// Counter of in-flight asynchronous operations with a completion event.
#[derive(Debug, Default)]
pub struct OperatingsCounter {
    count: Mutex<usize>,
    event: Condvar,
}

impl OperatingsCounter {
    /// Creates an idle counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `n` new operations.
    pub fn begin(&self, n: usize) {
        *self.count.lock() += n;
    }

    /// Marks one operation complete, signalling waiters on the last one.
    pub fn end(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.event.notify_all();
        }
    }

    /// Operations still in flight.
    pub fn pending(&self) -> usize {
        *self.count.lock()
    }

    /// Blocks until no operation is in flight or the timeout elapses.
    ///
    /// Returns `true` if everything completed.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut count = self.count.lock();
        match timeout {
            None => {
                while *count > 0 {
                    self.event.wait(&mut count);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *count > 0 {
                    if self.event.wait_until(&mut count, deadline).timed_out() {
                        return *count == 0;
                    }
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::Status;

    #[test]
    fn same_mode_locks_stack_and_opposite_conflicts() {
        let counter = LockCounter::new();
        assert_eq!(counter.acquire(LockMode::Solid).unwrap(), -1);
        assert_eq!(counter.acquire(LockMode::Solid).unwrap(), -2);
        assert_eq!(counter.acquire(LockMode::Liquid).unwrap_err().status(), Status::Conflict);
        assert_eq!(counter.release(LockMode::Solid), -1);
        assert_eq!(counter.release(LockMode::Solid), 0);
        assert_eq!(counter.acquire(LockMode::Liquid).unwrap(), 1);
        assert!(counter.is_liquid());
    }

    #[test]
    fn recursive_writer_is_reported() {
        let guard = AccessGuard::new(200, 5u32);
        {
            let mut access = guard.write().unwrap();
            *access += 1;
            assert!(is_writer_held(200));
            assert_eq!(guard.write().err().map(|e| e.status()), Some(Status::Conflict));
            assert!(guard.read().is_err());
        }
        assert!(!is_writer_held(200));
        assert_eq!(*guard.read().unwrap(), 6);
    }

    #[test]
    fn operatings_wait_times_out_then_completes() {
        let counter = std::sync::Arc::new(OperatingsCounter::new());
        counter.begin(1);
        assert!(!counter.wait(Some(Duration::from_millis(10))));
        let worker = counter.clone();
        let handle = std::thread::spawn(move || worker.end());
        assert!(counter.wait(None));
        handle.join().unwrap();
        assert_eq!(counter.pending(), 0);
    }
}
