//! Error types for the out-of-process worker.
//!
//! Worker errors are explicit and typed: every failure carries a
//! [`WorkerErrorKind`] naming where in the lifecycle it happened, optional
//! deterministic context text, and an optional source error chain.

use core::fmt;
use std::sync::Arc;

use crate::worker::protocol::EvalError;

/// The kind of worker error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerErrorKind {
    // === Lifecycle ===
    /// Spawning the child process failed.
    Spawn,
    /// The child never connected back to the listening socket.
    Connect,
    /// The connect wait exceeded its timeout.
    Timeout,
    /// The worker was terminated; in-flight evaluations were cancelled.
    Terminated,

    // === Transport ===
    /// A read or write on the pipe failed.
    Io,
    /// The child violated the request/response protocol (unknown or
    /// duplicate response id, malformed frame).
    Protocol,

    // === Evaluation ===
    /// The child evaluated the expression and reported an error.
    Eval,
}

/// The error type for worker operations.
#[derive(Debug, Clone)]
pub struct WorkerError {
    kind: WorkerErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl WorkerError {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: WorkerErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// The canonical cancellation error for in-flight evaluations.
    #[must_use]
    pub fn terminated() -> Self {
        Self::new(WorkerErrorKind::Terminated).with_context("worker terminated")
    }

    /// Wraps a child-side evaluation error.
    #[must_use]
    pub fn eval(err: EvalError) -> Self {
        Self::new(WorkerErrorKind::Eval).with_source(err)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> WorkerErrorKind {
        self.kind
    }

    /// Returns true if this error represents worker termination.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        matches!(self.kind, WorkerErrorKind::Terminated)
    }

    /// Returns the child-side evaluation error, if that is what this is.
    #[must_use]
    pub fn eval_error(&self) -> Option<&EvalError> {
        self.source
            .as_deref()
            .and_then(|source| source.downcast_ref::<EvalError>())
    }

    /// Adds deterministic context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> Self {
        Self::new(WorkerErrorKind::Io).with_source(err)
    }
}
