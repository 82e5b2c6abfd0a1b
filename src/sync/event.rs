//! One-shot event latch.
//!
//! [`Event`] lets any number of threads park until some other thread calls
//! [`Event::set`]. Once set, the event stays set (and `wait` returns
//! immediately) until [`Event::reset`] arms it again. Setting is idempotent
//! and wakes every parked waiter.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A one-shot latch.
///
/// The event starts unset. [`set`](Event::set) latches it and wakes all
/// waiters; [`wait`](Event::wait) returns immediately once the event is set.
/// [`reset`](Event::reset) re-arms the latch for another cycle.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use taskutil::sync::Event;
///
/// let event = Arc::new(Event::new());
/// let waiter = {
///     let event = Arc::clone(&event);
///     std::thread::spawn(move || event.wait())
/// };
/// event.set();
/// waiter.join().unwrap();
/// ```
#[derive(Debug, Default)]
pub struct Event {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Creates a new event in the unset state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Returns true if the event is currently set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        *self.set.lock().expect("event state poisoned")
    }

    /// Latches the event and wakes every waiter.
    ///
    /// Idempotent: setting an already-set event is a no-op.
    pub fn set(&self) {
        let mut set = self.set.lock().expect("event state poisoned");
        if !*set {
            *set = true;
            self.cond.notify_all();
        }
    }

    /// Clears the latch so the event can be waited on again.
    ///
    /// Threads already released by a previous `set` are unaffected.
    pub fn reset(&self) {
        let mut set = self.set.lock().expect("event state poisoned");
        *set = false;
    }

    /// Blocks the calling thread until the event is set.
    ///
    /// Returns immediately if the event is already set.
    pub fn wait(&self) {
        let mut set = self.set.lock().expect("event state poisoned");
        while !*set {
            set = self.cond.wait(set).expect("event state poisoned");
        }
    }

    /// Blocks until the event is set or `timeout` elapses.
    ///
    /// Returns true if the event was set, false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut set = self.set.lock().expect("event state poisoned");
        while !*set {
            let (guard, result) = self
                .cond
                .wait_timeout(set, timeout)
                .expect("event state poisoned");
            set = guard;
            if result.timed_out() {
                return *set;
            }
        }
        true
    }
}
