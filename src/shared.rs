//! Reference-counted handles over the pool engine.
//!
//! [`SharedPool`] wraps an [`ObjectPool`] and hands out [`SharedSlot`]s:
//! cloneable handles whose *final* drop returns the payload to the engine.
//! Every handle keeps the engine alive through an `Arc`, so "the pool must
//! outlive every outstanding handle" is enforced by ownership rather than
//! documented as a caller obligation. A handle that outlives the
//! `SharedPool` itself still releases correctly: the engine is in shutdown
//! by then, and the release path destroys the payload through the
//! allocator.
//!
//! Handles are shared, so they expose `&T` only. Payloads needing interior
//! mutation under sharing bring their own cells or locks, same as they
//! would under `Arc<T>`.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::alloc::SlotAlloc;
use crate::error::PoolError;
use crate::payload::{Poolable, Rebuild};
use crate::pool::{ObjectPool, PoolCore};
use crate::slot::RawSlot;
use crate::stats::{PoolStats, StatsSink};
use crate::{DEFAULT_LOCAL_CACHE_SIZE, DEFAULT_POOL_SIZE};

/// Pool layer whose acquires yield reference-counted handles.
///
/// All non-acquire operations delegate to the wrapped engine unchanged.
pub struct SharedPool<
    T,
    A = crate::DefaultSlotAlloc,
    S = crate::NoStats,
    const POOL_SIZE: usize = DEFAULT_POOL_SIZE,
    const LOCAL_CACHE_SIZE: usize = DEFAULT_LOCAL_CACHE_SIZE,
> where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    pool: ObjectPool<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>,
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize>
    SharedPool<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable + Default,
    A: SlotAlloc<T> + Default,
    S: StatsSink,
{
    /// Creates a prewarmed pool on the default allocator.
    pub fn new() -> Self {
        Self {
            pool: ObjectPool::new(),
        }
    }
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize> Default
    for SharedPool<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable + Default,
    A: SlotAlloc<T> + Default,
    S: StatsSink,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize>
    SharedPool<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable + Default,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    /// Creates a prewarmed pool on `alloc`.
    pub fn with_allocator(alloc: A) -> Self {
        Self {
            pool: ObjectPool::with_allocator(alloc),
        }
    }

    /// Acquires a payload behind a reference-counted handle.
    pub fn acquire(&self) -> Result<SharedSlot<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>, PoolError> {
        let slot = self.pool.acquire()?;
        Ok(self.wrap(slot))
    }

    /// See [`ObjectPool::prewarm`].
    pub fn prewarm(&self, count: usize) {
        self.pool.prewarm(count);
    }
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize>
    SharedPool<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    /// Creates a pool on `alloc` without prewarming.
    pub fn unprimed(alloc: A) -> Self {
        Self {
            pool: ObjectPool::unprimed(alloc),
        }
    }

    /// Acquires a payload initialized from `args` behind a handle.
    pub fn acquire_with<Args>(
        &self,
        args: Args,
    ) -> Result<SharedSlot<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>, PoolError>
    where
        T: Rebuild<Args>,
    {
        let slot = self.pool.acquire_with(args)?;
        Ok(self.wrap(slot))
    }

    /// See [`ObjectPool::flush_local_cache`].
    pub fn flush_local_cache(&self) {
        self.pool.flush_local_cache();
    }

    /// See [`ObjectPool::shrink`].
    pub fn shrink(&self, max: usize) -> usize {
        self.pool.shrink(max)
    }

    /// See [`ObjectPool::stats`].
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// See [`ObjectPool::approx_size`].
    pub fn approx_size(&self) -> usize {
        self.pool.approx_size()
    }

    /// Global ring capacity; a compile-time constant.
    pub const fn capacity(&self) -> usize {
        POOL_SIZE
    }

    fn wrap(
        &self,
        slot: RawSlot<T>,
    ) -> SharedSlot<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE> {
        SharedSlot {
            lease: Arc::new(SlotLease {
                slot: Some(slot),
                core: Arc::clone(self.pool.core()),
            }),
        }
    }
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize> fmt::Debug
    for SharedPool<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPool").field("pool", &self.pool).finish()
    }
}

/// What the handles share: the payload plus the engine that takes it back.
struct SlotLease<T, A, S, const PS: usize, const LC: usize>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    /// `Some` until the final drop hands the slot back.
    slot: Option<RawSlot<T>>,
    core: Arc<PoolCore<T, A, S, PS, LC>>,
}

impl<T, A, S, const PS: usize, const LC: usize> Drop for SlotLease<T, A, S, PS, LC>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.core.release_slot(slot);
        }
    }
}

/// Reference-counted handle to a pooled payload.
///
/// Clones share the same payload; the last clone to drop releases it back
/// to the pool it came from.
pub struct SharedSlot<
    T,
    A = crate::DefaultSlotAlloc,
    S = crate::NoStats,
    const POOL_SIZE: usize = DEFAULT_POOL_SIZE,
    const LOCAL_CACHE_SIZE: usize = DEFAULT_LOCAL_CACHE_SIZE,
> where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    lease: Arc<SlotLease<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>>,
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize>
    SharedSlot<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    /// Number of handles sharing this payload.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.lease)
    }
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize> Clone
    for SharedSlot<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    fn clone(&self) -> Self {
        Self {
            lease: Arc::clone(&self.lease),
        }
    }
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize> Deref
    for SharedSlot<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    type Target = T;

    fn deref(&self) -> &T {
        self.lease.slot.as_ref().expect("slot leased until final drop")
    }
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize> fmt::Debug
    for SharedSlot<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable + fmt::Debug,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSlot")
            .field("payload", &**self)
            .field("handles", &self.handle_count())
            .finish()
    }
}
