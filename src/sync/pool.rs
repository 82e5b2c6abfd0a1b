//! Bounded keyed object pool.
//!
//! [`Pool`] caps the number of objects in use at a fixed limit and caches
//! released objects for reuse. A pool may be *keyed*: objects are cached per
//! key (think one sub-pool per remote host) while all keys share one global
//! permit budget.
//!
//! # Permits
//!
//! A *permit* is one unit of the in-use budget, held from the moment
//! `acquire` returns until the returned [`Pooled`] guard is resolved.
//! Cached objects do not hold permits. Constructors run outside the pool's
//! mutex, and a failing constructor gives its permit back before the error
//! propagates, so the pool never leaks capacity.
//!
//! # Reuse
//!
//! Cached objects are reused most-recently-released first (LIFO), which
//! keeps warm objects warm. A validity predicate can reject stale cache
//! entries; rejected objects are dropped silently.
//!
//! # Example
//!
//! ```
//! use taskutil::sync::Pool;
//!
//! let pool: Pool<String, Vec<u8>> = Pool::new(8);
//!
//! let buf = pool
//!     .acquire("users-db".to_string(), || Ok::<_, std::io::Error>(Vec::new()))
//!     .unwrap();
//! assert_eq!(pool.in_use(), 1);
//! drop(buf); // returned to the "users-db" cache
//! assert_eq!((pool.in_use(), pool.in_pool()), (0, 1));
//! ```

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::hash::Hash;
use std::sync::{Condvar, Mutex};

/// Default in-use limit for pools constructed with [`Pool::default`].
pub const DEFAULT_POOL_LIMIT: usize = 4096;

/// An unkeyed pool; all objects share the single `()` cache.
pub type SimplePool<V> = Pool<(), V>;

/// Error returned when an acquire cannot produce an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError<E> {
    /// The pool was closed while this call was waiting (or before it
    /// arrived).
    Closed,
    /// The user-supplied constructor failed. The permit taken for this
    /// acquire has already been released.
    Create(E),
}

impl<E: fmt::Display> fmt::Display for PoolError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "pool closed"),
            Self::Create(err) => write!(f, "pool object construction failed: {err}"),
        }
    }
}

impl<E: Error + 'static> Error for PoolError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Closed => None,
            Self::Create(err) => Some(err),
        }
    }
}

#[derive(Debug)]
struct PoolState<K, V> {
    /// Permits currently held by callers.
    in_use: usize,
    /// Per-key stacks of released objects, reused LIFO.
    cached: HashMap<K, Vec<V>>,
    /// Threads blocked waiting for a permit.
    waiters: usize,
    closed: bool,
}

/// A bounded object pool with per-key caches and a shared permit budget.
///
/// `acquire` blocks while `limit` objects are in use, then hands out either
/// a cached object for the requested key or a freshly constructed one. The
/// returned [`Pooled`] guard gives the object back on drop.
///
/// Permit waiters are woken one at a time as permits free up, in the wake
/// order of the underlying condition variable.
#[derive(Debug)]
pub struct Pool<K, V> {
    state: Mutex<PoolState<K, V>>,
    available: Condvar,
    limit: usize,
}

impl<K: Eq + Hash, V> Default for Pool<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_LIMIT)
    }
}

impl<K: Eq + Hash, V> Pool<K, V> {
    /// Creates a pool allowing at most `limit` objects in use at once.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is zero.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "pool limit must be non-zero");
        Self {
            state: Mutex::new(PoolState {
                in_use: 0,
                cached: HashMap::new(),
                waiters: 0,
                closed: false,
            }),
            available: Condvar::new(),
            limit,
        }
    }

    /// The maximum number of objects that may be in use at once.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The number of permits currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.state.lock().expect("pool state poisoned").in_use
    }

    /// The total number of cached objects across all keys.
    #[must_use]
    pub fn in_pool(&self) -> usize {
        self.state
            .lock()
            .expect("pool state poisoned")
            .cached
            .values()
            .map(Vec::len)
            .sum()
    }

    /// The number of threads blocked waiting for a permit.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().expect("pool state poisoned").waiters
    }

    /// Returns true if the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("pool state poisoned").closed
    }

    /// Acquires an object for `key`, constructing with `make` on a cache
    /// miss.
    ///
    /// Blocks while the pool is at its in-use limit. See
    /// [`acquire_with`](Self::acquire_with) for cache-bypass and validity
    /// control.
    pub fn acquire<F, E>(&self, key: K, make: F) -> Result<Pooled<'_, K, V>, PoolError<E>>
    where
        F: FnOnce() -> Result<V, E>,
    {
        self.acquire_with(key, make, false, |_| true)
    }

    /// Acquires an object for `key` with full control.
    ///
    /// - `force_new` skips the cache (without disturbing it) and always
    ///   constructs; the skipped cached objects remain available to later
    ///   acquires.
    /// - `is_valid` is evaluated against cached candidates, most recently
    ///   released first; candidates that fail are discarded silently and
    ///   the next is tried.
    ///
    /// `make` runs outside the pool mutex. If it fails, the permit taken
    /// for this acquire is released before the error is returned.
    pub fn acquire_with<F, E, P>(
        &self,
        key: K,
        make: F,
        force_new: bool,
        mut is_valid: P,
    ) -> Result<Pooled<'_, K, V>, PoolError<E>>
    where
        F: FnOnce() -> Result<V, E>,
        P: FnMut(&V) -> bool,
    {
        // Discarded cache entries are dropped after the state lock is
        // released; user Drop impls never run under the pool mutex.
        let mut discarded = Vec::new();

        let mut state = self.state.lock().expect("pool state poisoned");
        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }
            if state.in_use < self.limit {
                break;
            }
            state.waiters += 1;
            state = self.available.wait(state).expect("pool state poisoned");
            state.waiters -= 1;
        }
        state.in_use += 1;

        if !force_new {
            if let Some(stack) = state.cached.get_mut(&key) {
                while let Some(obj) = stack.pop() {
                    if is_valid(&obj) {
                        drop(state);
                        return Ok(Pooled::new(self, key, obj));
                    }
                    discarded.push(obj);
                }
            }
        }
        drop(state);

        match make() {
            Ok(obj) => Ok(Pooled::new(self, key, obj)),
            Err(err) => {
                self.release_permit();
                Err(PoolError::Create(err))
            }
        }
    }

    /// Empties every key's cache.
    ///
    /// In-use accounting is untouched: objects currently out with callers
    /// still hold their permits and will be re-cached on release.
    pub fn drain(&self) {
        let drained: Vec<Vec<V>> = {
            let mut state = self.state.lock().expect("pool state poisoned");
            state.cached.values_mut().map(std::mem::take).collect()
        };
        let count: usize = drained.iter().map(Vec::len).sum();
        if count > 0 {
            tracing::debug!(count, "pool cache drained");
        }
    }

    /// Closes the pool.
    ///
    /// Blocked and future acquires fail with [`PoolError::Closed`].
    /// Objects already out with callers release normally.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("pool state poisoned");
        state.closed = true;
        self.available.notify_all();
    }

    /// Returns an object to `key`'s cache and releases its permit.
    fn release_object(&self, key: K, obj: V) {
        let mut state = self.state.lock().expect("pool state poisoned");
        state.cached.entry(key).or_default().push(obj);
        state.in_use -= 1;
        self.available.notify_one();
    }

    /// Releases a permit without returning an object.
    fn release_permit(&self) {
        let mut state = self.state.lock().expect("pool state poisoned");
        state.in_use -= 1;
        self.available.notify_one();
    }
}

impl<V> Pool<(), V> {
    /// Acquires from an unkeyed pool; see [`acquire`](Self::acquire).
    pub fn acquire_unkeyed<F, E>(&self, make: F) -> Result<Pooled<'_, (), V>, PoolError<E>>
    where
        F: FnOnce() -> Result<V, E>,
    {
        self.acquire((), make)
    }
}

/// An object checked out of a [`Pool`].
///
/// Dereferences to the pooled object. On drop the object goes back to its
/// key's cache and the permit is released; [`take`](Pooled::take) instead
/// hands the object to the caller for good, releasing only the permit.
#[must_use = "returns the object to the pool immediately if not held"]
pub struct Pooled<'a, K: Eq + Hash, V> {
    pool: &'a Pool<K, V>,
    key: Option<K>,
    obj: Option<V>,
}

impl<'a, K: Eq + Hash, V> Pooled<'a, K, V> {
    fn new(pool: &'a Pool<K, V>, key: K, obj: V) -> Self {
        Self {
            pool,
            key: Some(key),
            obj: Some(obj),
        }
    }

    /// The key this object was acquired under.
    #[must_use]
    pub fn key(&self) -> &K {
        self.key.as_ref().expect("pooled key already taken")
    }

    /// Removes the object from pool management.
    ///
    /// The permit is released (unblocking a waiter) but the object is not
    /// cached; the caller owns it from here on.
    #[must_use]
    pub fn take(mut self) -> V {
        let obj = self.obj.take().expect("pooled object already taken");
        self.pool.release_permit();
        obj
    }

    /// Drops the object without caching it, releasing the permit.
    ///
    /// Use when the object is known to be unusable (a broken connection, a
    /// poisoned handle) and should not be offered to the next acquirer.
    pub fn discard(self) {
        drop(self.take());
    }
}

impl<K: Eq + Hash, V> std::ops::Deref for Pooled<'_, K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.obj.as_ref().expect("pooled object already taken")
    }
}

impl<K: Eq + Hash, V> std::ops::DerefMut for Pooled<'_, K, V> {
    fn deref_mut(&mut self) -> &mut V {
        self.obj.as_mut().expect("pooled object already taken")
    }
}

impl<K: Eq + Hash, V: fmt::Debug> fmt::Debug for Pooled<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled").field("obj", &self.obj).finish()
    }
}

impl<K: Eq + Hash, V> Drop for Pooled<'_, K, V> {
    fn drop(&mut self) {
        if let (Some(key), Some(obj)) = (self.key.take(), self.obj.take()) {
            self.pool.release_object(key, obj);
        }
    }
}
