//! Pools of reusable per-exchange objects.
//!
//! Every stateful object that is created once per exchange (requests,
//! responses, exchanges, filter chains) lives in a `static` [`Recycler`].
//! Instances are handed out as [`Pooled`] guards. A guard owns its value: it
//! is returned to the pool when the guard is dropped or explicitly recycled,
//! and because recycling consumes the guard, a handle can never be used after
//! its value went back to the pool.
//!
//! ```rust,ignore
//! static POOL: Recycler<Scratch> = Recycler::new();
//!
//! let mut scratch = POOL.acquire();
//! scratch.bytes.extend_from_slice(b"hello");
//! scratch.recycle(); // reset and back in the pool
//! ```

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// An object that can be reset and reused.
///
/// `recycle` must restore the observable state of a freshly constructed
/// `Default` value.
pub trait Recyclable: Default + Send + 'static {
    fn recycle(&mut self);
}

/// Counters describing how a pool is used.
#[derive(Debug, Default)]
pub struct PoolStats {
    hits: AtomicU64,
    misses: AtomicU64,
    releases: AtomicU64,
}

impl PoolStats {
    const fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    /// Acquisitions served by an idle instance.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Acquisitions that had to construct a new instance.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Instances returned to the pool.
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }
}

/// A homogeneous, unbounded, thread-safe pool.
///
/// `acquire` never fails: when no idle instance is available a new one is
/// constructed with `T::default()`. The pool never drops instances it is
/// given back.
pub struct Recycler<T> {
    idle: Mutex<Vec<T>>,
    leases: AtomicU64,
    stats: PoolStats,
}

impl<T: Recyclable> Recycler<T> {
    pub const fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            leases: AtomicU64::new(0),
            stats: PoolStats::new(),
        }
    }

    /// Takes an idle instance, or builds one if the pool is empty.
    pub fn acquire(&'static self) -> Pooled<T> {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        let value = match reused {
            Some(value) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                value
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                T::default()
            }
        };

        Pooled {
            value: Some(value),
            lease: self.leases.fetch_add(1, Ordering::Relaxed) + 1,
            pool: self,
        }
    }

    /// Resets `value` and makes it available to the next `acquire`.
    ///
    /// The value must have been produced by this pool. [`Pooled`] guarantees
    /// that; calling this directly is only meant for values detached with
    /// [`Pooled::detach`].
    pub fn release(&self, mut value: T) {
        value.recycle();
        self.stats.releases.fetch_add(1, Ordering::Relaxed);
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
    }

    /// Number of instances waiting to be reused.
    pub fn idle_len(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

impl<T: Recyclable> Default for Recycler<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An instance leased from a [`Recycler`].
///
/// Dereferences to the pooled value. Dropping the guard recycles the value.
pub struct Pooled<T: Recyclable> {
    value: Option<T>,
    lease: u64,
    pool: &'static Recycler<T>,
}

impl<T: Recyclable> Pooled<T> {
    /// Returns the value to its pool now.
    pub fn recycle(self) {
        drop(self)
    }

    /// Lease number, unique per pool for the life of the process.
    pub fn lease(&self) -> u64 {
        self.lease
    }

    /// Takes the value out of the pool's custody.
    pub fn detach(mut self) -> T {
        match self.value.take() {
            Some(value) => value,
            // `value` is only emptied by `detach` and `drop`, both of which consume the guard.
            None => unreachable!("pooled value taken twice"),
        }
    }

    fn value(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value taken twice"),
        }
    }

    fn value_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value taken twice"),
        }
    }
}

impl<T: Recyclable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value()
    }
}

impl<T: Recyclable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value_mut()
    }
}

impl<T: Recyclable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.release(value);
        }
    }
}

impl<T: Recyclable + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("lease", &self.lease)
            .field("value", self.value())
            .finish()
    }
}
