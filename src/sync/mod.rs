//! Blocking synchronization primitives.
//!
//! Every primitive in this module suspends the calling thread only at an
//! explicitly named point (a condition wait), holds its internal mutex only
//! across non-blocking sections, and releases held resources through RAII
//! guards.
//!
//! # Primitives
//!
//! - [`OrderedSynchronizer`]: total ordering of concurrent callbacks by
//!   sequence number
//! - [`RwLock`]: writer-preferring read-write lock
//! - [`FifoLock`]: strict-FIFO reentrant mutex
//! - [`Pool`]: bounded keyed object pool
//! - [`Event`]: one-shot latch
//!
//! The one designed exception to the "no user code under an internal lock"
//! rule is [`OrderedSynchronizer::put`], which runs its callback with the
//! synchronizer's mutex held: serializing those callbacks is the entire
//! point of the primitive.

mod event;
mod fifo;
mod ordered;
mod pool;
mod rwlock;

pub use event::Event;
pub use fifo::{FifoGuard, FifoLock, FifoLockError};
pub use ordered::{CallbackError, OrderedError, OrderedSynchronizer};
pub use pool::{Pool, PoolError, Pooled, SimplePool, DEFAULT_POOL_LIMIT};
pub use rwlock::{RwLock, RwLockError, RwLockReadGuard, RwLockWriteGuard};
