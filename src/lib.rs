//! Taskutil: concurrency primitives for task-based services.
//!
//! # Overview
//!
//! Taskutil supplies the building blocks a service author needs above a bare
//! mutex and channel, for programs whose unit of work is a lightweight task
//! multiplexed over OS threads. Every blocking operation suspends at an
//! explicitly named point: a condition wait, a channel operation, a sleep,
//! or a join.
//!
//! # Primitives
//!
//! - [`sync::OrderedSynchronizer`]: serialize concurrent callbacks into a
//!   monotonically increasing integer sequence
//! - [`sync::RwLock`]: multi-reader/single-writer lock with writer
//!   preference and exact reader-drain handoff
//! - [`sync::FifoLock`]: strict-FIFO reentrant mutex with no barging
//! - [`sync::Pool`]: bounded, optionally keyed object pool with permit
//!   accounting and LIFO reuse
//! - [`sync::Event`]: one-shot latch
//! - [`timeout::try_with_timeout`]: race a closure against a timer, with a
//!   cooperatively observable timeout handle
//! - [`worker::Worker`]: evaluate expressions on a child process over a
//!   unix-domain socket, supervised by dedicated lifecycle threads
//!
//! # Platform
//!
//! The worker transport is a unix-domain socket and terminate escalation
//! uses unix signals; the `worker` module is unix-only. The synchronization
//! primitives are portable.
//!
//! # Module Structure
//!
//! - [`sync`]: blocking synchronization primitives
//! - [`timeout`]: the cooperative timeout wrapper
//! - [`worker`]: out-of-process request/response evaluation
//! - [`test_utils`]: shared logging and assertion helpers for tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod sync;
pub mod test_utils;
pub mod timeout;
pub mod worker;

pub use sync::{
    Event, FifoGuard, FifoLock, FifoLockError, OrderedError, OrderedSynchronizer, Pool, PoolError,
    Pooled, RwLock, RwLockError, RwLockReadGuard, RwLockWriteGuard, SimplePool,
};
pub use timeout::{try_with_timeout, TimedOut, TimeoutError};
pub use worker::{
    EvalError, EvalFuture, Evaluator, ExprEvaluator, Worker, WorkerError, WorkerErrorKind,
    WorkerOptions,
};
