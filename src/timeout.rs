//! Cooperative timeout wrapper.
//!
//! [`try_with_timeout`] runs a closure on a spawned thread and races it
//! against a timer on a rendezvous channel. The closure receives a
//! [`TimedOut`] handle it can poll to notice that the caller has given up,
//! letting well-behaved closures exit early instead of running to
//! completion for nobody.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Error returned by [`try_with_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    /// The timer fired before the closure produced a value. Carries the
    /// configured timeout.
    Elapsed(Duration),
    /// The closure panicked before producing a value.
    TaskPanicked,
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Elapsed(timeout) => write!(f, "operation timed out after {timeout:?}"),
            Self::TaskPanicked => write!(f, "timed operation panicked"),
        }
    }
}

impl std::error::Error for TimeoutError {}

/// Handle through which a timed closure observes that its caller timed out.
///
/// The flag flips to true at the moment [`try_with_timeout`] gives up;
/// closures doing cancellable work should poll it at convenient points and
/// bail out once set.
#[derive(Debug, Clone)]
pub struct TimedOut {
    flag: Arc<AtomicBool>,
}

impl TimedOut {
    /// Returns true once the caller has timed out and stopped listening.
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Runs `f` on a spawned thread, waiting at most `timeout` for its result.
///
/// On success the closure's value is returned. If the timer fires first,
/// the closure's [`TimedOut`] handle is set and
/// [`TimeoutError::Elapsed`] is returned; the spawned thread is not killed,
/// but its eventual result has nowhere to go (the rendezvous channel is
/// closed) and the thread exits as soon as the closure returns.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskutil::timeout::{try_with_timeout, TimeoutError};
///
/// let value = try_with_timeout(|_| 40 + 2, Duration::from_secs(5));
/// assert_eq!(value, Ok(42));
///
/// let slow = try_with_timeout(
///     |timed_out| {
///         while !timed_out.timed_out() {
///             std::thread::sleep(Duration::from_millis(5));
///         }
///     },
///     Duration::from_millis(20),
/// );
/// assert!(matches!(slow, Err(TimeoutError::Elapsed(_))));
/// ```
pub fn try_with_timeout<T, F>(f: F, timeout: Duration) -> Result<T, TimeoutError>
where
    F: FnOnce(&TimedOut) -> T + Send + 'static,
    T: Send + 'static,
{
    let flag = Arc::new(AtomicBool::new(false));
    let handle = TimedOut {
        flag: Arc::clone(&flag),
    };

    // Rendezvous: the worker blocks in `send` until this thread receives,
    // or unblocks with an error once the receiver is dropped.
    let (tx, rx) = mpsc::sync_channel::<T>(0);

    let worker = thread::Builder::new()
        .name("timed-task".to_string())
        .spawn(move || {
            let value = f(&handle);
            // Fails harmlessly when the caller has already timed out.
            let _ = tx.send(value);
        })
        .expect("failed to spawn timed task");

    match rx.recv_timeout(timeout) {
        Ok(value) => {
            let _ = worker.join();
            Ok(value)
        }
        Err(RecvTimeoutError::Timeout) => {
            flag.store(true, Ordering::Release);
            tracing::debug!(?timeout, "timed task abandoned");
            Err(TimeoutError::Elapsed(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => {
            // The sender dropped without sending: the closure panicked.
            let _ = worker.join();
            Err(TimeoutError::TaskPanicked)
        }
    }
}
