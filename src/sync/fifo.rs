//! Strict-FIFO reentrant mutex.
//!
//! [`FifoLock`] grants the lock to contending threads in exactly the order
//! they arrived at the contention point: no barging. The owning thread may
//! re-lock any number of times and must release the same number of times.
//!
//! # Handoff
//!
//! Fairness is achieved by handoff rather than competition. When the owner
//! releases with a non-empty wait queue, ownership is transferred directly
//! to the queue head; the lock's held bit stays set for the whole transfer,
//! so no third thread can slip in between release and the head waking up.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

/// Error returned by [`FifoLock::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoLockError {
    /// The lock is not held by any thread.
    NotLocked,
    /// The lock is held, but not by the calling thread.
    NotOwner,
}

impl fmt::Display for FifoLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLocked => write!(f, "fifo lock is not locked"),
            Self::NotOwner => write!(f, "fifo lock released by a non-owner thread"),
        }
    }
}

impl std::error::Error for FifoLockError {}

#[derive(Debug)]
struct FifoState {
    /// The thread currently owning the lock.
    owner: Option<ThreadId>,
    /// How many times the owner has locked without releasing.
    reentrancy: usize,
    /// Waiter ids in arrival order.
    queue: VecDeque<u64>,
    /// Waiter id a released lock is being handed to, if any.
    handoff: Option<u64>,
    /// Ticket counter for waiter ids.
    next_waiter: u64,
}

/// A reentrant mutex with strict arrival-order acquisition.
///
/// Unlike `std::sync::Mutex`, contending threads are serviced first-come
/// first-served, and the owning thread may lock recursively.
///
/// # Example
///
/// ```
/// use taskutil::sync::FifoLock;
///
/// let lock = FifoLock::new();
/// let outer = lock.lock();
/// let inner = lock.lock(); // reentrant: same thread, no deadlock
/// drop(inner);
/// drop(outer);
/// assert!(!lock.is_locked());
/// ```
#[derive(Debug)]
pub struct FifoLock {
    /// Set iff the lock is held or mid-handoff.
    have_lock: AtomicBool,
    state: Mutex<FifoState>,
    cond: Condvar,
}

impl Default for FifoLock {
    fn default() -> Self {
        Self::new()
    }
}

impl FifoLock {
    /// Creates a new, unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            have_lock: AtomicBool::new(false),
            state: Mutex::new(FifoState {
                owner: None,
                reentrancy: 0,
                queue: VecDeque::new(),
                handoff: None,
                next_waiter: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Returns true if the lock is held (or currently being handed off).
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.have_lock.load(Ordering::Acquire)
    }

    /// Returns the number of threads waiting to acquire.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().expect("fifo lock state poisoned").queue.len()
    }

    /// Acquires the lock, returning a guard that releases on drop.
    ///
    /// Blocks in arrival order behind other contenders. Reentrant: if the
    /// calling thread already owns the lock this returns immediately.
    pub fn lock(&self) -> FifoGuard<'_> {
        self.acquire();
        FifoGuard { lock: self }
    }

    /// Tries to acquire without blocking.
    ///
    /// Succeeds only when the calling thread already owns the lock, or when
    /// the lock is free *and* no one is queued ahead (try-lock does not
    /// barge past waiters).
    pub fn try_lock(&self) -> Option<FifoGuard<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock().expect("fifo lock state poisoned");
        if state.owner == Some(me) {
            state.reentrancy += 1;
            return Some(FifoGuard { lock: self });
        }
        if self
            .have_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            state.owner = Some(me);
            state.reentrancy = 1;
            return Some(FifoGuard { lock: self });
        }
        None
    }

    /// Acquires the lock without producing a guard.
    ///
    /// Every `acquire` must be matched by a [`release`](Self::release).
    /// Prefer [`lock`](Self::lock) unless the acquisition and release happen
    /// in places a guard cannot span.
    pub fn acquire(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().expect("fifo lock state poisoned");

        if state.owner == Some(me) {
            state.reentrancy += 1;
            return;
        }

        // Fast path: free and nobody queued. The held bit can only be clear
        // when the queue is empty and no handoff is in flight, so a
        // successful swap is an uncontended acquisition.
        if self
            .have_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            state.owner = Some(me);
            state.reentrancy = 1;
            return;
        }

        // Slow path: take a ticket and park until the release handoff names
        // this waiter.
        let ticket = state.next_waiter;
        state.next_waiter += 1;
        state.queue.push_back(ticket);

        loop {
            state = self.cond.wait(state).expect("fifo lock state poisoned");
            if state.handoff == Some(ticket) {
                state.handoff = None;
                state.owner = Some(me);
                state.reentrancy = 1;
                return;
            }
        }
    }

    /// Releases one level of the lock.
    ///
    /// When the reentrancy count drops to zero, ownership is handed to the
    /// head of the wait queue if there is one, or the lock is cleared.
    ///
    /// # Errors
    ///
    /// Fails if the lock is unlocked or owned by another thread; the lock
    /// state is unchanged in both cases.
    pub fn release(&self) -> Result<(), FifoLockError> {
        let me = thread::current().id();
        let mut state = self.state.lock().expect("fifo lock state poisoned");

        match state.owner {
            None => return Err(FifoLockError::NotLocked),
            Some(owner) if owner != me => return Err(FifoLockError::NotOwner),
            Some(_) => {}
        }

        state.reentrancy -= 1;
        if state.reentrancy > 0 {
            return Ok(());
        }

        state.owner = None;
        if let Some(next) = state.queue.pop_front() {
            // Transfer ownership to the head waiter. The held bit stays set
            // so nobody can acquire between here and the waiter running.
            state.handoff = Some(next);
            self.cond.notify_all();
        } else {
            self.have_lock.store(false, Ordering::Release);
        }
        Ok(())
    }
}

/// RAII guard for [`FifoLock`]; releases one lock level on drop.
#[must_use = "guard releases the lock immediately if not held"]
#[derive(Debug)]
pub struct FifoGuard<'a> {
    lock: &'a FifoLock,
}

impl Drop for FifoGuard<'_> {
    fn drop(&mut self) {
        self.lock
            .release()
            .expect("fifo guard dropped by a thread that does not own the lock");
    }
}
