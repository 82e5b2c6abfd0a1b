//! Writer-preferring read-write lock.
//!
//! This lock allows any number of readers or a single writer. It is
//! **writer-preferring**: the moment a writer starts waiting, new read
//! acquisitions park until that writer has run and released. Readers that
//! were already active when the writer arrived are drained with an exact
//! count, so the writer wakes precisely when the last of them leaves.
//!
//! # Encoding
//!
//! Reader/writer coordination lives in one signed atomic counter. A writer
//! subtracts [`MAX_READERS`] (2^30) from the reader count, driving it
//! negative; a negative count is how arriving readers observe "writer
//! active or pending". The number of readers that were active at the moment
//! the writer arrived is recovered as `count + MAX_READERS`, and a second
//! atomic (`reader_wait`) counts down as those readers release, firing a
//! one-shot [`Event`] when the writer may proceed.
//!
//! # Fairness Characteristics
//!
//! | Scenario                  | Behavior                                   |
//! |---------------------------|--------------------------------------------|
//! | No writers waiting        | Readers acquire immediately                |
//! | Writer waiting            | New readers park until the writer releases |
//! | Existing readers + writer | Writer waits for the exact reader count    |
//! | Multiple writers          | Writers serialize on an internal mutex     |
//!
//! Reader starvation is possible under continuous write pressure; writer
//! starvation is not.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Condvar, Mutex, RwLock as StdRwLock};

use crate::sync::Event;

/// Sentinel offset a writer subtracts from the reader count.
///
/// Any live reader population is far below this, so a negative count always
/// means "writer active or pending" and the active-reader count during a
/// writer's arrival is `count + MAX_READERS`.
pub(crate) const MAX_READERS: i64 = 1 << 30;

/// Error returned when acquiring the lock fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwLockError {
    /// A panic occurred while a guard was held.
    Poisoned,
}

impl std::fmt::Display for RwLockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Poisoned => write!(f, "rwlock poisoned"),
        }
    }
}

impl std::error::Error for RwLockError {}

/// A read-write lock with writer preference and exact reader-drain handoff.
///
/// Multiple readers may hold the lock simultaneously; a writer is exclusive
/// with everyone. Read recursion is by count only (a thread may stack read
/// guards, but the lock does not know which thread holds which guard — a
/// thread that re-reads while a writer waits will deadlock with it).
///
/// # Example
///
/// ```
/// use taskutil::sync::RwLock;
///
/// let lock = RwLock::new(vec![1, 2, 3]);
///
/// {
///     let r1 = lock.read().unwrap();
///     let r2 = lock.read().unwrap(); // readers share
///     assert_eq!(r1.len() + r2.len(), 6);
/// }
///
/// lock.write().unwrap().push(4);
/// assert_eq!(lock.read().unwrap().len(), 4);
/// ```
#[derive(Debug)]
pub struct RwLock<T> {
    /// Serializes writers; held for the whole write critical section.
    write_lock: Mutex<()>,
    /// Signed reader count; negative iff a writer is active or pending.
    reader_count: AtomicI64,
    /// Readers the pending writer is still waiting to drain.
    reader_wait: AtomicI64,
    /// Outstanding wake permits for parked readers. A releasing writer
    /// deposits exactly as many permits as readers arrived during its
    /// window; each parked reader consumes one. Permits are fungible: which
    /// parked reader takes which permit does not matter, the counter
    /// arithmetic stays consistent across overlapping windows.
    read_gate: Mutex<i64>,
    read_cond: Condvar,
    /// Fired by the last draining reader; one per writer window.
    write_ready: Event,
    /// The protected value. Acquisition is uncontended by construction: the
    /// counters above never admit a reader and a writer simultaneously.
    data: StdRwLock<T>,
}

impl<T> RwLock<T> {
    /// Creates a new lock containing `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            write_lock: Mutex::new(()),
            reader_count: AtomicI64::new(0),
            reader_wait: AtomicI64::new(0),
            read_gate: Mutex::new(0),
            read_cond: Condvar::new(),
            write_ready: Event::new(),
            data: StdRwLock::new(value),
        }
    }

    /// Consumes the lock and returns the inner value.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.data.into_inner().expect("rwlock poisoned")
    }

    /// Returns a mutable reference to the inner value.
    ///
    /// No locking is needed: `&mut self` proves exclusive access.
    ///
    /// # Panics
    ///
    /// Panics if the lock is poisoned.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut().expect("rwlock poisoned")
    }

    /// Returns true if a writer currently holds the lock or is draining
    /// readers on its way in.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.reader_count.load(Ordering::Acquire) < 0
    }

    /// Acquires a read guard, parking if a writer is active or pending.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, T>, RwLockError> {
        self.acquire_read();
        match self.data.read() {
            Ok(guard) => Ok(RwLockReadGuard { lock: self, guard }),
            Err(poisoned) => {
                drop(poisoned.into_inner());
                self.release_read();
                Err(RwLockError::Poisoned)
            }
        }
    }

    /// Tries to acquire a read guard without parking.
    ///
    /// Returns `None` when a writer is active or pending (try-read does not
    /// jump the writer-preference gate) and `Err` when poisoned.
    pub fn try_read(&self) -> Result<Option<RwLockReadGuard<'_, T>>, RwLockError> {
        if !self.try_acquire_read() {
            return Ok(None);
        }
        match self.data.read() {
            Ok(guard) => Ok(Some(RwLockReadGuard { lock: self, guard })),
            Err(poisoned) => {
                drop(poisoned.into_inner());
                self.release_read();
                Err(RwLockError::Poisoned)
            }
        }
    }

    /// Acquires the write guard, draining active readers first.
    ///
    /// Readers arriving after this call parks are blocked until the
    /// returned guard is dropped.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, T>, RwLockError> {
        let held = self.write_lock.lock().map_err(|_| RwLockError::Poisoned)?;
        self.acquire_write_window();
        match self.data.write() {
            Ok(guard) => Ok(RwLockWriteGuard {
                lock: self,
                guard,
                _window: held,
            }),
            Err(poisoned) => {
                drop(poisoned.into_inner());
                self.release_write_window();
                Err(RwLockError::Poisoned)
            }
        }
    }

    /// Tries to acquire the write guard without parking.
    ///
    /// Succeeds only when no reader or writer holds the lock.
    pub fn try_write(&self) -> Result<Option<RwLockWriteGuard<'_, T>>, RwLockError> {
        let Ok(held) = self.write_lock.try_lock() else {
            return Ok(None);
        };
        if self
            .reader_count
            .compare_exchange(0, -MAX_READERS, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        self.write_ready.reset();
        match self.data.write() {
            Ok(guard) => Ok(Some(RwLockWriteGuard {
                lock: self,
                guard,
                _window: held,
            })),
            Err(poisoned) => {
                drop(poisoned.into_inner());
                self.release_write_window();
                Err(RwLockError::Poisoned)
            }
        }
    }

    /// Reader fast path: bump the count; negative means a writer window is
    /// open and this reader parks until a releasing writer hands it a wake
    /// permit. The permit, not the counter sign, is what grants the lock:
    /// by the time a parked reader runs, the next writer may already have
    /// driven the counter negative again, and that writer is counting this
    /// reader among the ones it must drain.
    fn acquire_read(&self) {
        let count = self.reader_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count < 0 {
            let mut permits = self.read_gate.lock().expect("rwlock gate poisoned");
            while *permits == 0 {
                permits = self.read_cond.wait(permits).expect("rwlock gate poisoned");
            }
            *permits -= 1;
        }
    }

    /// Lock-free reader try path. A plain increment-then-undo would leave a
    /// phantom reader a pending writer could wait on forever, so this only
    /// commits via compare-exchange on a non-negative count.
    fn try_acquire_read(&self) -> bool {
        let mut count = self.reader_count.load(Ordering::Acquire);
        loop {
            if count < 0 {
                return false;
            }
            match self.reader_count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    fn release_read(&self) {
        let count = self.reader_count.fetch_sub(1, Ordering::AcqRel) - 1;
        if count < 0 {
            // A writer is draining; if this was the last reader it was
            // counting on, wake it.
            if self.reader_wait.fetch_sub(1, Ordering::AcqRel) - 1 == 0 {
                self.write_ready.set();
            }
        }
    }

    /// Opens the writer window: announce the writer through the sentinel,
    /// then wait for the exact number of readers that were active at that
    /// moment to drain.
    fn acquire_write_window(&self) {
        // `write_lock` is held, so this writer owns the event cycle.
        self.write_ready.reset();
        let readers = self.reader_count.fetch_sub(MAX_READERS, Ordering::AcqRel) + MAX_READERS;
        if readers != 0 && self.reader_wait.fetch_add(readers, Ordering::AcqRel) + readers != 0 {
            // Some of those readers are still inside; the last one out sets
            // the event. If the counter already hit zero they all raced past
            // between the two atomics and there is nothing to wait for.
            self.write_ready.wait();
        }
    }

    /// Closes the writer window and deposits one wake permit per reader
    /// that arrived while it was open.
    fn release_write_window(&self) {
        let woken = self.reader_count.fetch_add(MAX_READERS, Ordering::AcqRel) + MAX_READERS;
        if woken > 0 {
            let mut permits = self.read_gate.lock().expect("rwlock gate poisoned");
            *permits += woken;
            self.read_cond.notify_all();
        }
    }
}

/// Shared guard for [`RwLock`]; releases the read count on drop.
#[must_use = "guard releases the read lock immediately if not held"]
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
    guard: std::sync::RwLockReadGuard<'a, T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive guard for [`RwLock`]; ends the writer window on drop.
#[must_use = "guard releases the write lock immediately if not held"]
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
    guard: std::sync::RwLockWriteGuard<'a, T>,
    /// Keeps the writer-serialization mutex held for the guard's lifetime;
    /// released after `drop` runs.
    _window: std::sync::MutexGuard<'a, ()>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        // The inner data guard is dropped automatically after this; woken
        // readers may briefly contend on it, never deadlock.
        self.lock.release_write_window();
    }
}

#[cfg(test)]
#[allow(clippy::significant_drop_tightening)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn multiple_readers_share() {
        init_test("multiple_readers_share");
        let lock = RwLock::new(42_u32);
        let r1 = lock.read().expect("read 1");
        let r2 = lock.read().expect("read 2");
        assert_eq!(*r1, 42);
        assert_eq!(*r2, 42);
        crate::test_complete!("multiple_readers_share");
    }

    #[test]
    fn write_is_exclusive() {
        init_test("write_is_exclusive");
        let lock = RwLock::new(5_u32);

        let mut w = lock.write().expect("write");
        *w = 7;
        assert!(lock.is_write_locked());
        assert!(lock.try_read().expect("try_read").is_none());
        drop(w);

        assert!(!lock.is_write_locked());
        assert_eq!(*lock.read().expect("read"), 7);
        crate::test_complete!("write_is_exclusive");
    }

    #[test]
    fn try_write_fails_under_readers() {
        init_test("try_write_fails_under_readers");
        let lock = RwLock::new(0_u32);
        let r = lock.read().expect("read");
        assert!(lock.try_write().expect("try_write").is_none());
        drop(r);
        assert!(lock.try_write().expect("try_write").is_some());
        crate::test_complete!("try_write_fails_under_readers");
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        init_test("waiting_writer_blocks_new_readers");
        let lock = Arc::new(RwLock::new(1_u32));
        let reader = lock.read().expect("read");

        let writer_released = Arc::new(AtomicBool::new(false));
        let writer = {
            let lock = Arc::clone(&lock);
            let writer_released = Arc::clone(&writer_released);
            thread::spawn(move || {
                let guard = lock.write().expect("write");
                thread::sleep(Duration::from_millis(30));
                writer_released.store(true, AtomicOrdering::Release);
                drop(guard);
            })
        };

        // Wait until the writer has announced itself through the counter.
        while !lock.is_write_locked() {
            thread::yield_now();
        }

        // A fresh reader must not get in before the writer releases.
        let late_reader = {
            let lock = Arc::clone(&lock);
            let writer_released = Arc::clone(&writer_released);
            thread::spawn(move || {
                let _guard = lock.read().expect("late read");
                writer_released.load(AtomicOrdering::Acquire)
            })
        };

        drop(reader);
        assert!(
            late_reader.join().expect("late reader panicked"),
            "reader acquired before the pending writer released"
        );
        writer.join().expect("writer panicked");
        crate::test_complete!("waiting_writer_blocks_new_readers");
    }

    #[test]
    fn writer_waits_for_exact_reader_drain() {
        init_test("writer_waits_for_exact_reader_drain");
        let lock = Arc::new(RwLock::new(0_u32));
        let active_readers = Arc::new(AtomicUsize::new(0));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let active = Arc::clone(&active_readers);
                thread::spawn(move || {
                    let _guard = lock.read().expect("read");
                    active.fetch_add(1, AtomicOrdering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, AtomicOrdering::SeqCst);
                })
            })
            .collect();

        // Let the readers get in, then write; the write must only succeed
        // once every reader has left.
        while active_readers.load(AtomicOrdering::SeqCst) < 4 {
            thread::yield_now();
        }
        let guard = lock.write().expect("write");
        assert_eq!(active_readers.load(AtomicOrdering::SeqCst), 0);
        drop(guard);

        for r in readers {
            r.join().expect("reader panicked");
        }
        crate::test_complete!("writer_waits_for_exact_reader_drain");
    }

    #[test]
    fn writers_serialize() {
        init_test("writers_serialize");
        const WRITERS: usize = 4;
        const ITERS: usize = 100;

        let lock = Arc::new(RwLock::new(0_u64));
        let handles: Vec<_> = (0..WRITERS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        let mut guard = lock.write().expect("write");
                        *guard += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().expect("writer panicked");
        }

        assert_eq!(*lock.read().expect("read"), (WRITERS * ITERS) as u64);
        crate::test_complete!("writers_serialize");
    }

    #[test]
    fn no_overlap_between_readers_and_writer() {
        init_test("no_overlap_between_readers_and_writer");
        const THREADS: usize = 6;
        const ITERS: usize = 100;

        let lock = Arc::new(RwLock::new(()));
        let readers_in = Arc::new(AtomicUsize::new(0));
        let writer_in = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let readers_in = Arc::clone(&readers_in);
                let writer_in = Arc::clone(&writer_in);
                let violations = Arc::clone(&violations);
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        if i % 2 == 0 {
                            let _g = lock.read().expect("read");
                            readers_in.fetch_add(1, AtomicOrdering::SeqCst);
                            if writer_in.load(AtomicOrdering::SeqCst) {
                                violations.fetch_add(1, AtomicOrdering::SeqCst);
                            }
                            readers_in.fetch_sub(1, AtomicOrdering::SeqCst);
                        } else {
                            let _g = lock.write().expect("write");
                            writer_in.store(true, AtomicOrdering::SeqCst);
                            if readers_in.load(AtomicOrdering::SeqCst) > 0 {
                                violations.fetch_add(1, AtomicOrdering::SeqCst);
                            }
                            writer_in.store(false, AtomicOrdering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().expect("thread panicked");
        }

        assert_eq!(violations.load(AtomicOrdering::SeqCst), 0);
        crate::test_complete!("no_overlap_between_readers_and_writer");
    }

    #[test]
    fn get_mut_and_into_inner() {
        init_test("get_mut_and_into_inner");
        let mut lock = RwLock::new(42_u32);
        *lock.get_mut() = 100;
        assert_eq!(lock.into_inner(), 100);
        crate::test_complete!("get_mut_and_into_inner");
    }
}
