//! Ordered callback sequencing.
//!
//! [`OrderedSynchronizer`] serializes arbitrary concurrent callbacks into a
//! monotonically increasing integer sequence: a call tagged with sequence
//! number `i` runs strictly after every call with a smaller number has run,
//! no matter which thread gets scheduled first.
//!
//! The typical shape is a fan-out/fan-in pipeline: N threads produce chunks
//! concurrently, and each thread delivers its chunk through
//! [`put`](OrderedSynchronizer::put) with the chunk's ordinal so the
//! downstream side observes chunks in order.
//!
//! # Callback failures
//!
//! A failing callback does not wedge the pipeline. Its error is captured as
//! a value into the synchronizer's coordinator sink (drained with
//! [`take_errors`](OrderedSynchronizer::take_errors)) and the sequence still
//! advances, so later stages keep running. The thread driving the pipeline
//! is expected to drain the sink and decide what stage failures mean.
//!
//! # Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use taskutil::sync::OrderedSynchronizer;
//!
//! let sync = Arc::new(OrderedSynchronizer::new());
//! let out = Arc::new(Mutex::new(Vec::new()));
//!
//! let handles: Vec<_> = (1..=4u64)
//!     .rev()
//!     .map(|i| {
//!         let sync = Arc::clone(&sync);
//!         let out = Arc::clone(&out);
//!         std::thread::spawn(move || {
//!             sync.put(
//!                 || {
//!                     out.lock().unwrap().push(i);
//!                     Ok::<(), std::convert::Infallible>(())
//!                 },
//!                 i,
//!             )
//!         })
//!     })
//!     .collect();
//!
//! for h in handles {
//!     h.join().unwrap().unwrap();
//! }
//! assert_eq!(*out.lock().unwrap(), vec![1, 2, 3, 4]);
//! ```

use std::error::Error;
use std::fmt;
use std::sync::{Condvar, Mutex};

/// Error returned when a `put` cannot run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderedError {
    /// The synchronizer was closed while this call was waiting (or before
    /// it arrived). Carries the close reason.
    Closed(String),
}

impl fmt::Display for OrderedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(reason) => write!(f, "synchronizer closed: {reason}"),
        }
    }
}

impl Error for OrderedError {}

/// A callback error captured into the coordinator sink.
///
/// The sequence number identifies which stage failed; the source is the
/// error the callback returned.
#[derive(Debug)]
pub struct CallbackError {
    seq: u64,
    source: Box<dyn Error + Send + Sync>,
}

impl CallbackError {
    /// The sequence number whose callback failed.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback for sequence {} failed: {}", self.seq, self.source)
    }
}

impl Error for CallbackError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[derive(Debug)]
struct State {
    /// The next sequence number allowed to run.
    seq: u64,
    /// Close reason, latched by `close` and cleared by `reset`.
    closed: Option<String>,
}

/// Serializes concurrent callbacks into a total order by sequence number.
///
/// `put(f, i)` blocks the calling thread until the synchronizer's current
/// sequence equals `i`, runs `f` with the synchronizer's mutex held, then
/// advances the sequence and wakes the other waiters. Holding the mutex
/// across `f` is deliberate: it is what makes the callbacks a serialized
/// critical section rather than merely ordered starts.
///
/// # Sequencing with gaps
///
/// `put_incr` advances by more than one, so independent producers can own
/// disjoint stride classes (producer A uses 1, 3, 5, …; producer B uses
/// 2, 4, 6, … with `incr = 2`). A call whose sequence number is never
/// reached waits until [`close`](Self::close) surfaces it.
#[derive(Debug)]
pub struct OrderedSynchronizer {
    state: Mutex<State>,
    cond: Condvar,
    /// Captured callback errors for the coordinating thread.
    errors: Mutex<Vec<CallbackError>>,
}

impl Default for OrderedSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderedSynchronizer {
    /// Creates a synchronizer whose first runnable sequence is 1.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a synchronizer whose first runnable sequence is `seq`.
    #[must_use]
    pub fn starting_at(seq: u64) -> Self {
        Self {
            state: Mutex::new(State { seq, closed: None }),
            cond: Condvar::new(),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// The sequence number that may run next.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.state.lock().expect("synchronizer state poisoned").seq
    }

    /// Returns true if the synchronizer has not been closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .expect("synchronizer state poisoned")
            .closed
            .is_none()
    }

    /// Runs `f` when the current sequence reaches `seq`, then advances by 1.
    ///
    /// Blocks until every earlier sequence number has run. If `f` fails,
    /// the error is captured into the coordinator sink and the sequence
    /// still advances; `put` itself only fails when the synchronizer is
    /// closed.
    pub fn put<F, E>(&self, f: F, seq: u64) -> Result<(), OrderedError>
    where
        F: FnOnce() -> Result<(), E>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        self.put_incr(f, seq, 1)
    }

    /// Runs `f` at sequence `seq`, then advances the sequence by `incr`.
    ///
    /// Callers using `incr > 1` must partition their sequence numbers so
    /// strides do not collide; calls on a stride the sequence never reaches
    /// wait until `close` wakes them with the close error.
    pub fn put_incr<F, E>(&self, f: F, seq: u64, incr: u64) -> Result<(), OrderedError>
    where
        F: FnOnce() -> Result<(), E>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let mut state = self.state.lock().expect("synchronizer state poisoned");
        loop {
            if let Some(reason) = &state.closed {
                return Err(OrderedError::Closed(reason.clone()));
            }
            if state.seq == seq {
                break;
            }
            state = self
                .cond
                .wait(state)
                .expect("synchronizer state poisoned");
        }

        // The callback runs inside the critical section on purpose.
        if let Err(err) = f() {
            let err = err.into();
            tracing::warn!(seq, error = %err, "ordered callback failed; sequence advances");
            self.errors
                .lock()
                .expect("synchronizer error sink poisoned")
                .push(CallbackError { seq, source: err });
        }

        state.seq = seq.wrapping_add(incr);
        self.cond.notify_all();
        Ok(())
    }

    /// Rewinds the sequence to 1 and clears the closed latch.
    pub fn reset(&self) {
        self.reset_to(1);
    }

    /// Rewinds the sequence to `seq` and clears the closed latch.
    ///
    /// Waiters from before the reset are not cancelled; they re-evaluate
    /// their predicate on the next wake and run when their number comes up
    /// again.
    pub fn reset_to(&self, seq: u64) {
        let mut state = self.state.lock().expect("synchronizer state poisoned");
        state.seq = seq;
        state.closed = None;
        self.cond.notify_all();
    }

    /// Closes the synchronizer with the default reason.
    ///
    /// Every waiter (present and future) observes [`OrderedError::Closed`]
    /// until [`reset`](Self::reset) revives the synchronizer.
    pub fn close(&self) {
        self.close_with("synchronizer closed");
    }

    /// Closes the synchronizer, waking all waiters with `reason`.
    pub fn close_with(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.lock().expect("synchronizer state poisoned");
        tracing::debug!(seq = state.seq, %reason, "closing synchronizer");
        state.closed = Some(reason);
        self.cond.notify_all();
    }

    /// Drains the captured callback errors.
    ///
    /// Intended for the thread coordinating the pipeline, which is the one
    /// place stage failures should be observed.
    #[must_use]
    pub fn take_errors(&self) -> Vec<CallbackError> {
        std::mem::take(
            &mut *self
                .errors
                .lock()
                .expect("synchronizer error sink poisoned"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use proptest::prelude::*;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn ok() -> Result<(), Infallible> {
        Ok(())
    }

    #[test]
    fn runs_immediately_at_current_sequence() {
        init_test("runs_immediately_at_current_sequence");
        let sync = OrderedSynchronizer::new();
        let mut ran = false;
        sync.put(
            || {
                ran = true;
                ok()
            },
            1,
        )
        .expect("put failed");
        assert!(ran);
        assert_eq!(sync.sequence(), 2);
        crate::test_complete!("runs_immediately_at_current_sequence");
    }

    #[test]
    fn reverse_order_submissions_run_in_order() {
        init_test("reverse_order_submissions_run_in_order");
        let sync = Arc::new(OrderedSynchronizer::new());
        let out = Arc::new(std::sync::Mutex::new(Vec::new()));

        let handles: Vec<_> = (1..=10u64)
            .rev()
            .map(|i| {
                let sync = Arc::clone(&sync);
                let out = Arc::clone(&out);
                thread::spawn(move || {
                    sync.put(
                        || {
                            out.lock().unwrap().push(i);
                            ok()
                        },
                        i,
                    )
                    .expect("put failed");
                })
            })
            .collect();

        for h in handles {
            h.join().expect("worker panicked");
        }

        let observed = out.lock().unwrap().clone();
        crate::assert_with_log!(
            observed == (1..=10).collect::<Vec<_>>(),
            "callbacks ran in sequence order",
            (1..=10).collect::<Vec<u64>>(),
            observed
        );
        crate::test_complete!("reverse_order_submissions_run_in_order");
    }

    #[test]
    fn incr_strides_skip_numbers() {
        init_test("incr_strides_skip_numbers");
        let sync = OrderedSynchronizer::new();
        sync.put_incr(ok, 1, 2).expect("put 1 failed");
        assert_eq!(sync.sequence(), 3);
        sync.put_incr(ok, 3, 2).expect("put 3 failed");
        assert_eq!(sync.sequence(), 5);
        crate::test_complete!("incr_strides_skip_numbers");
    }

    #[test]
    fn close_wakes_waiter_with_error() {
        init_test("close_wakes_waiter_with_error");
        let sync = Arc::new(OrderedSynchronizer::new());

        let waiter = {
            let sync = Arc::clone(&sync);
            // Sequence 5 is never reached; only close releases this thread.
            thread::spawn(move || sync.put(ok, 5))
        };

        thread::sleep(Duration::from_millis(20));
        sync.close_with("pipeline aborted");

        let result = waiter.join().expect("waiter panicked");
        assert_eq!(
            result,
            Err(OrderedError::Closed("pipeline aborted".to_string()))
        );
        assert!(!sync.is_open());
        crate::test_complete!("close_wakes_waiter_with_error");
    }

    #[test]
    fn put_on_closed_synchronizer_fails() {
        init_test("put_on_closed_synchronizer_fails");
        let sync = OrderedSynchronizer::new();
        sync.close();
        assert!(matches!(sync.put(ok, 1), Err(OrderedError::Closed(_))));
        crate::test_complete!("put_on_closed_synchronizer_fails");
    }

    #[test]
    fn reset_revives_after_close() {
        init_test("reset_revives_after_close");
        let sync = OrderedSynchronizer::new();
        sync.put(ok, 1).expect("put failed");
        sync.close();
        sync.reset();
        assert!(sync.is_open());
        assert_eq!(sync.sequence(), 1);
        sync.put(ok, 1).expect("put after reset failed");
        crate::test_complete!("reset_revives_after_close");
    }

    #[test]
    fn failing_callback_advances_and_is_captured() {
        init_test("failing_callback_advances_and_is_captured");
        let sync = OrderedSynchronizer::new();

        sync.put(|| Err("stage one broke"), 1).expect("put failed");
        assert_eq!(sync.sequence(), 2);
        sync.put(ok, 2).expect("later stage blocked");

        let errors = sync.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].seq(), 1);
        assert!(errors[0].to_string().contains("stage one broke"));
        // The sink is drained exactly once.
        assert!(sync.take_errors().is_empty());
        crate::test_complete!("failing_callback_advances_and_is_captured");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn any_submission_order_observes_sequence_order(
            perm in Just((1..=8u64).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let sync = Arc::new(OrderedSynchronizer::new());
            let out = Arc::new(std::sync::Mutex::new(Vec::new()));

            let handles: Vec<_> = perm
                .into_iter()
                .map(|i| {
                    let sync = Arc::clone(&sync);
                    let out = Arc::clone(&out);
                    thread::spawn(move || {
                        sync.put(
                            || {
                                out.lock().unwrap().push(i);
                                ok()
                            },
                            i,
                        )
                        .expect("put failed");
                    })
                })
                .collect();

            for h in handles {
                h.join().expect("worker panicked");
            }

            prop_assert_eq!(out.lock().unwrap().clone(), (1..=8u64).collect::<Vec<_>>());
        }
    }
}
