//! The pool engine: acquire/release routing, prewarm, shrink, teardown.
//!
//! # Routing
//!
//! ```text
//! acquire():
//!   1. Pop the current thread's shelf (contention-free fast path)
//!   2. Pop the global free ring
//!   3. Allocate and construct a fresh payload
//!
//! release():
//!   1. Run the payload's release-time cleanup
//!   2. Push the thread shelf (same-thread release, pool live, room left)
//!   3. Push the global ring
//!   4. Destroy the slot (ring full or pool shutting down)
//! ```
//!
//! # Ownership
//!
//! [`ObjectPool`] is the single owner of its engine; operations take `&self`
//! and the destructor therefore cannot race them from safe code. The engine
//! itself lives behind an `Arc` because two parties legitimately outlive the
//! owner's last borrow: reference-counted shared handles, and dying threads
//! rescuing their caches through the registry. Both observe the shutdown
//! flag (set with `Release`, read with `Acquire`) and fall back to
//! destroying slots through the allocator.
//!
//! # Teardown sequence
//!
//! 1. Set the shutdown flag.
//! 2. Sleep ~2 ms so stragglers holding an upgraded registry reference
//!    observe the flag before the drain.
//! 3. Deregister, so thread-exit rescue stops choosing this pool.
//! 4. Drain the ring in batches, destroying every slot via the allocator.
//!
//! The quiesce sleep is best-effort, not a correctness mechanism: a push
//! that lands after the drain is caught by the post-push shutdown re-check
//! in [`PoolCore::try_restock`] and by the drain backstop in the engine's
//! own `Drop`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_utils::CachePadded;

use crate::alloc::SlotAlloc;
use crate::cache;
use crate::error::PoolError;
use crate::payload::{Poolable, Rebuild};
use crate::registry::{self, next_pool_id, PoolId, Registry};
use crate::ring::FreeRing;
use crate::slot::{self, RawSlot};
use crate::stats::{PoolStats, StatsSink};
use crate::thread_tag;
use crate::{DEFAULT_LOCAL_CACHE_SIZE, DEFAULT_POOL_SIZE};

/// Slots allocated per prewarm batch.
const PREWARM_BATCH: usize = 32;
/// Slots popped per shrink batch.
const SHRINK_BATCH: usize = 16;
/// Slots popped per teardown drain batch.
const TEARDOWN_BATCH: usize = 64;
/// Best-effort wait for in-flight stragglers during teardown.
const SHUTDOWN_QUIESCE: Duration = Duration::from_millis(2);

/// Shared engine state behind the pool's `Arc`.
///
/// Crate-internal: reachable from shared handles and the rescue path, never
/// from user code.
pub(crate) struct PoolCore<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    id: PoolId,
    alloc: A,
    shutdown: AtomicBool,
    stats: S,
    ring: CachePadded<FreeRing<T, POOL_SIZE>>,
    registry: Arc<Registry<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>>,
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize>
    PoolCore<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Destroys one slot through the allocator.
    pub(crate) fn retire(&self, slot: RawSlot<T>) {
        slot::retire_slot(&self.alloc, slot);
    }

    /// Offers a free slot back to the global ring.
    ///
    /// Refuses when the pool is shutting down. After a successful push the
    /// flag is re-checked: if shutdown began meanwhile, the teardown drain
    /// may already be past, so one slot is pulled back out and destroyed to
    /// guarantee nothing is stranded in a dead ring.
    pub(crate) fn try_restock(&self, slot: RawSlot<T>) -> Result<(), RawSlot<T>> {
        if self.is_shutdown() {
            return Err(slot);
        }
        match self.ring.try_push(slot) {
            Err(slot) => Err(slot),
            Ok(()) => {
                if self.is_shutdown() {
                    if let Some(orphan) = self.ring.try_pop() {
                        self.retire(orphan);
                    }
                }
                Ok(())
            }
        }
    }

    /// Returns a batch of slots to the ring, destroying what doesn't fit.
    pub(crate) fn restock_batch(&self, slots: Vec<RawSlot<T>>) {
        if slots.is_empty() {
            return;
        }
        if self.is_shutdown() {
            for s in slots {
                self.retire(s);
            }
            return;
        }
        self.stats.on_batch();
        for s in slots {
            if let Err(s) = self.try_restock(s) {
                self.retire(s);
            }
        }
    }

    /// Takes a slot back from a caller. Shared handles call this directly so
    /// a late handle can return its payload after the owner is gone.
    pub(crate) fn release_slot(&self, slot: RawSlot<T>) {
        self.stats.on_release();

        let same_thread = match slot.affinity_tag() {
            Some(tag) => tag == thread_tag::current(),
            None => true,
        };

        // Cleanup runs before the slot re-enters any queue; a panicking
        // scrub forfeits the slot instead of parking a broken payload.
        let mut guard = RetireOnUnwind {
            core: self,
            slot: Some(slot),
            undo_acquire: false,
        };
        guard.payload_mut().scrub();
        let slot = guard.disarm();

        let slot = if same_thread && LOCAL_CACHE_SIZE > 0 && !self.is_shutdown() {
            let mut pending = Some(slot);
            let cached = cache::with_shelf(&self.alloc, &self.registry, |shelf| {
                match shelf.push(pending.take().expect("slot pending")) {
                    Ok(()) => true,
                    Err(slot) => {
                        pending = Some(slot);
                        false
                    }
                }
            })
            .unwrap_or(false);
            if cached {
                return;
            }
            pending.take().expect("slot pending")
        } else {
            slot
        };

        if let Err(slot) = self.try_restock(slot) {
            self.retire(slot);
        }
        if !same_thread {
            self.stats.on_cross_thread_release();
        }
    }

    /// Empties the ring, destroying every slot.
    fn drain_ring(&self) {
        let mut batch = Vec::with_capacity(TEARDOWN_BATCH);
        loop {
            while batch.len() < TEARDOWN_BATCH {
                match self.ring.try_pop() {
                    Some(s) => batch.push(s),
                    None => break,
                }
            }
            if batch.is_empty() {
                return;
            }
            for s in batch.drain(..) {
                self.retire(s);
            }
        }
    }

    /// Runs the teardown sequence. Safe to run more than once.
    fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        thread::sleep(SHUTDOWN_QUIESCE);
        self.registry.remove(self.id);
        self.drain_ring();
    }
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize> Drop
    for PoolCore<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    fn drop(&mut self) {
        // Backstop for slots that re-entered the ring between the owner's
        // drain and the last shared handle going away.
        self.drain_ring();
    }
}

/// Retires the held slot if the scope unwinds before `disarm`.
struct RetireOnUnwind<'a, T, A, S, const PS: usize, const LC: usize>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    core: &'a PoolCore<T, A, S, PS, LC>,
    slot: Option<RawSlot<T>>,
    /// Also roll back the acquire counters (acquire-path guards only).
    undo_acquire: bool,
}

impl<T, A, S, const PS: usize, const LC: usize> RetireOnUnwind<'_, T, A, S, PS, LC>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    fn payload_mut(&mut self) -> &mut T {
        self.slot.as_mut().expect("guard still armed")
    }

    fn disarm(mut self) -> RawSlot<T> {
        self.slot.take().expect("guard still armed")
    }
}

impl<T, A, S, const PS: usize, const LC: usize> Drop for RetireOnUnwind<'_, T, A, S, PS, LC>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.core.retire(slot);
            if self.undo_acquire {
                self.core.stats.on_acquire_failed();
            }
        }
    }
}

/// Thread-safe recycling pool for payloads of type `T`.
///
/// Instantiated per `(T, Allocator, Stats, POOL_SIZE, LOCAL_CACHE_SIZE)`.
/// `POOL_SIZE` is the global ring capacity and must be a power of two;
/// `LOCAL_CACHE_SIZE` is the per-thread cache capacity and may be zero.
///
/// The pool is the single owner of its engine. Dropping it runs the
/// teardown sequence; slots still out with callers at that point are
/// destroyed when released (via [`SharedSlot`](crate::SharedSlot)) or
/// rescued/destroyed when their holding thread exits.
pub struct ObjectPool<
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
    core: Arc<PoolCore<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>>,
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize>
    ObjectPool<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable + Default,
    A: SlotAlloc<T> + Default,
    S: StatsSink,
{
    /// Creates a pool on the default allocator and prewarms it to half the
    /// ring capacity.
    pub fn new() -> Self {
        Self::with_allocator(A::default())
    }
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize> Default
    for ObjectPool<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
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
    ObjectPool<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable + Default,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    /// Creates a pool on `alloc` and prewarms it to half the ring capacity.
    pub fn with_allocator(alloc: A) -> Self {
        let pool = Self::unprimed(alloc);
        pool.prewarm(POOL_SIZE / 2);
        pool
    }

    /// Acquires a payload, recycling a pooled one when available.
    ///
    /// Recycled payloads are run through [`Poolable::reset`]; fresh ones are
    /// default-constructed. The affinity tag, when the payload carries one,
    /// is stamped with the acquiring thread on every path.
    pub fn acquire(&self) -> Result<RawSlot<T>, PoolError> {
        match self.obtain_recycled()? {
            Some(slot) => Ok(self.recycle(slot, T::reset)),
            None => self.create_fresh(T::default),
        }
    }

    /// Eagerly fills the ring with up to `count` default-constructed
    /// payloads so steady-state acquire skips the allocator.
    ///
    /// The count is clamped to remaining ring capacity. Stops early and
    /// silently on allocation failure or an unexpectedly full ring; callers
    /// observe the result via [`approx_size`](Self::approx_size).
    pub fn prewarm(&self, count: usize) {
        let core = &*self.core;
        if core.is_shutdown() {
            return;
        }
        let mut remaining = count.min(POOL_SIZE.saturating_sub(core.ring.approx_len()));
        let tag = thread_tag::current();
        let mut batch: Vec<RawSlot<T>> = Vec::with_capacity(PREWARM_BATCH);

        while remaining > 0 {
            let target = remaining.min(PREWARM_BATCH);
            batch.clear();
            for _ in 0..target {
                match slot::fresh_slot(&core.alloc, T::default()) {
                    Ok(mut fresh) => {
                        fresh.stamp_affinity(tag);
                        batch.push(fresh);
                    }
                    Err(_) => break,
                }
            }
            if batch.is_empty() {
                return;
            }
            let allocated = batch.len();
            let mut slots = batch.drain(..);
            while let Some(s) = slots.next() {
                if let Err(rejected) = core.ring.try_push(s) {
                    // Full ring means someone else restocked it meanwhile;
                    // the rejected slot and the rest of the batch go back
                    // to the allocator.
                    core.retire(rejected);
                    for leftover in slots {
                        core.retire(leftover);
                    }
                    return;
                }
            }
            remaining -= allocated;
        }
    }
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize>
    ObjectPool<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    /// Creates a pool on `alloc` without prewarming. The entry point for
    /// payloads that are only constructible from arguments.
    pub fn unprimed(alloc: A) -> Self {
        let registry = registry::registry_of::<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>();
        let core = Arc::new(PoolCore {
            id: next_pool_id(),
            alloc,
            shutdown: AtomicBool::new(false),
            stats: S::default(),
            ring: CachePadded::new(FreeRing::new()),
            registry,
        });
        core.registry.insert(core.id, &core);
        Self { core }
    }

    /// Acquires a payload initialized from `args`.
    ///
    /// Recycled payloads get [`Rebuild::rebuild`]; fresh ones are built with
    /// [`Rebuild::build`]. The observable payload state depends only on
    /// `args`, never on the slot's prior life.
    pub fn acquire_with<Args>(&self, args: Args) -> Result<RawSlot<T>, PoolError>
    where
        T: Rebuild<Args>,
    {
        match self.obtain_recycled()? {
            Some(slot) => Ok(self.recycle(slot, move |payload| payload.rebuild(args))),
            None => self.create_fresh(move || T::build(args)),
        }
    }

    /// Returns a payload to the pool.
    pub fn release(&self, slot: RawSlot<T>) {
        self.core.release_slot(slot);
    }

    /// Drains the calling thread's cache into the global ring; slots the
    /// ring cannot absorb are destroyed.
    pub fn flush_local_cache(&self) {
        if LOCAL_CACHE_SIZE == 0 {
            return;
        }
        let core = &*self.core;
        let mut drained = Vec::new();
        let _ = cache::with_shelf(&core.alloc, &core.registry, |shelf| {
            shelf.take_all(&mut drained)
        });
        core.restock_batch(drained);
    }

    /// Destroys up to `max` pooled slots, returning memory to the allocator.
    /// Flushes the caller's cache first. Returns the number destroyed.
    pub fn shrink(&self, max: usize) -> usize {
        self.flush_local_cache();
        let core = &*self.core;
        let mut released = 0usize;
        let mut batch = Vec::with_capacity(SHRINK_BATCH);
        while released < max {
            let target = (max - released).min(SHRINK_BATCH);
            while batch.len() < target {
                match core.ring.try_pop() {
                    Some(s) => batch.push(s),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            released += batch.len();
            for s in batch.drain(..) {
                core.retire(s);
            }
        }
        released
    }

    /// Counter snapshot. All-zero when the pool was instantiated with
    /// [`NoStats`](crate::NoStats). Counters are read relaxed; the snapshot
    /// need not be mutually consistent.
    pub fn stats(&self) -> PoolStats {
        self.core.stats.snapshot(self.core.ring.approx_len())
    }

    /// Best-effort number of free slots in the global ring.
    pub fn approx_size(&self) -> usize {
        self.core.ring.approx_len()
    }

    /// Global ring capacity; a compile-time constant.
    pub const fn capacity(&self) -> usize {
        POOL_SIZE
    }

    pub(crate) fn core(&self) -> &Arc<PoolCore<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>> {
        &self.core
    }

    /// Pops the fast paths: thread shelf, then global ring. Counts the
    /// attempt; a `None` result means the caller must construct.
    fn obtain_recycled(&self) -> Result<Option<RawSlot<T>>, PoolError> {
        let core = &*self.core;
        if core.is_shutdown() {
            return Err(PoolError::Shutdown);
        }
        core.stats.on_acquire();

        if LOCAL_CACHE_SIZE > 0 {
            if let Some(slot) =
                cache::with_shelf(&core.alloc, &core.registry, |shelf| shelf.pop()).flatten()
            {
                core.stats.on_cache_hit();
                return Ok(Some(slot));
            }
        }
        if let Some(slot) = core.ring.try_pop() {
            core.stats.on_ring_hit();
            return Ok(Some(slot));
        }
        Ok(None)
    }

    /// Refreshes a recycled slot and stamps the acquiring thread.
    fn recycle(&self, slot: RawSlot<T>, refresh: impl FnOnce(&mut T)) -> RawSlot<T> {
        let mut guard = RetireOnUnwind {
            core: &*self.core,
            slot: Some(slot),
            undo_acquire: true,
        };
        refresh(guard.payload_mut());
        guard.payload_mut().stamp_affinity(thread_tag::current());
        guard.disarm()
    }

    /// Cold path: construct a payload and move it into fresh storage.
    fn create_fresh(&self, make: impl FnOnce() -> T) -> Result<RawSlot<T>, PoolError> {
        struct RollbackOnExit<'a, S: StatsSink> {
            stats: &'a S,
            armed: bool,
        }
        impl<S: StatsSink> Drop for RollbackOnExit<'_, S> {
            fn drop(&mut self) {
                if self.armed {
                    self.stats.on_acquire_failed();
                }
            }
        }

        let core = &*self.core;
        let mut rollback = RollbackOnExit {
            stats: &core.stats,
            armed: true,
        };
        // The payload is built before storage is allocated, so an unwinding
        // constructor has nothing to clean up beyond the counter rollback.
        let payload = make();
        match slot::fresh_slot(&core.alloc, payload) {
            Ok(mut fresh) => {
                rollback.armed = false;
                core.stats.on_create();
                fresh.stamp_affinity(thread_tag::current());
                Ok(fresh)
            }
            Err(payload) => {
                drop(payload);
                Err(PoolError::AllocationFailed)
            }
        }
    }
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize> Drop
    for ObjectPool<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    fn drop(&mut self) {
        self.core.begin_shutdown();
    }
}

impl<T, A, S, const POOL_SIZE: usize, const LOCAL_CACHE_SIZE: usize> fmt::Debug
    for ObjectPool<T, A, S, POOL_SIZE, LOCAL_CACHE_SIZE>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("id", &self.core.id)
            .field("capacity", &POOL_SIZE)
            .field("pooled", &self.approx_size())
            .field("shutdown", &self.core.is_shutdown())
            .finish()
    }
}
