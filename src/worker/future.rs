//! Single-shot result slots for in-flight evaluations.
//!
//! Each outstanding request owns one [`FutureSlot`]: a capacity-1
//! rendezvous into which exactly one of a value or an error is placed. The
//! caller-facing half is [`EvalFuture`], whose `fetch` blocks until the
//! slot is fulfilled.
//!
//! Fulfillment is first-write-wins: the response reader and the terminate
//! path can race to resolve the same slot, and whichever gets there first
//! decides the outcome. The loser's write is dropped silently, which is the
//! behavior both racers want.

use std::sync::{Arc, Condvar, Mutex};

use crate::worker::error::WorkerError;

/// Outcome of a single evaluation.
pub(crate) type EvalOutcome = Result<serde_json::Value, WorkerError>;

/// A capacity-1 rendezvous holding one evaluation outcome.
#[derive(Debug)]
pub(crate) struct FutureSlot {
    state: Mutex<Option<EvalOutcome>>,
    cond: Condvar,
}

impl FutureSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Places an outcome into the slot, waking the fetcher.
    ///
    /// First write wins; later writes are ignored.
    pub(crate) fn fulfill(&self, outcome: EvalOutcome) {
        let mut state = self.state.lock().expect("future slot poisoned");
        if state.is_none() {
            *state = Some(outcome);
            self.cond.notify_all();
        }
    }

    /// Blocks until the slot is fulfilled, then takes the outcome.
    pub(crate) fn wait(&self) -> EvalOutcome {
        let mut state = self.state.lock().expect("future slot poisoned");
        loop {
            if let Some(outcome) = state.take() {
                return outcome;
            }
            state = self.cond.wait(state).expect("future slot poisoned");
        }
    }

    /// Returns true once an outcome has been placed.
    pub(crate) fn is_ready(&self) -> bool {
        self.state.lock().expect("future slot poisoned").is_some()
    }
}

/// Handle to the result of a [`Worker::remote_eval`] call.
///
/// [`Worker::remote_eval`]: crate::worker::Worker::remote_eval
#[derive(Debug)]
#[must_use = "an eval future does nothing unless fetched"]
pub struct EvalFuture {
    slot: Arc<FutureSlot>,
}

impl EvalFuture {
    pub(crate) fn new(slot: Arc<FutureSlot>) -> Self {
        Self { slot }
    }

    /// Returns true once the result has arrived (or the worker died).
    ///
    /// `fetch` will not block when this is true.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.slot.is_ready()
    }

    /// Blocks until the evaluation completes and returns its outcome.
    ///
    /// A child-side evaluation failure surfaces as
    /// [`WorkerErrorKind::Eval`](crate::worker::WorkerErrorKind::Eval) with
    /// the captured [`EvalError`](crate::worker::EvalError) as its source;
    /// worker death surfaces as
    /// [`WorkerErrorKind::Terminated`](crate::worker::WorkerErrorKind::Terminated).
    pub fn fetch(self) -> Result<serde_json::Value, WorkerError> {
        self.slot.wait()
    }
}
