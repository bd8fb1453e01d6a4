//! Per-(pool-type, thread) LIFO cache of free slots.
//!
//! # Design
//!
//! Same-thread acquire/release is the common case; routing it through the
//! global ring would serialize every thread on the same CAS line. Instead
//! each thread keeps a small LIFO shelf per pool instantiation: release
//! pushes, acquire pops, and the freshly released slot — still hot in
//! cache — is the first one handed back out.
//!
//! Shelves are owned exclusively by their thread and live in a thread-local
//! map keyed by instantiation, created lazily on first use. Two different
//! pool instantiations have independent shelves on the same thread; two
//! pool *instances* of one instantiation share a shelf, so slots may flow
//! between instances through a thread's shelf (which is why allocator
//! clones of an instantiation must be interchangeable, see [`crate::alloc`]).
//!
//! # Layout
//!
//! The slot array sits behind `CachePadded` so that bumping the count does
//! not share a line with the slot pointers, and the shelf itself is aligned
//! to a cache line.
//!
//! # Thread exit
//!
//! When the thread dies its shelves are dropped. A dying shelf invalidates
//! itself (release store, paired with the acquire load in `is_valid`), then
//! tries to push each remaining slot into a live pool of the same
//! instantiation via the registry, checking each candidate's shutdown flag
//! first. Slots no pool absorbs are destroyed through the shelf's own
//! allocator clone. Nothing is leaked and nothing is handed to a pool in
//! shutdown.
//!
//! # Reentrancy invariant
//!
//! Payload hooks (`reset`, `scrub`, `Drop`) never run while the shelf map
//! is borrowed; the engine pops or pushes first and runs payload code after
//! the borrow ends. A payload that itself uses a pool therefore cannot
//! deadlock the map, and once the map is being torn down `with_shelf`
//! reports the cache as unavailable and the engine falls back to the ring.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use crossbeam_utils::CachePadded;

use crate::alloc::SlotAlloc;
use crate::payload::Poolable;
use crate::registry::Registry;
use crate::slot::{self, RawSlot};
use crate::stats::StatsSink;

/// Fixed-capacity LIFO of free slots, owned by one thread.
#[repr(align(64))]
pub(crate) struct Shelf<T, A, S, const PS: usize, const LC: usize>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    len: usize,
    valid: AtomicBool,
    alloc: A,
    registry: Arc<Registry<T, A, S, PS, LC>>,
    slots: CachePadded<[Option<RawSlot<T>>; LC]>,
}

impl<T, A, S, const PS: usize, const LC: usize> Shelf<T, A, S, PS, LC>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    fn new(alloc: A, registry: Arc<Registry<T, A, S, PS, LC>>) -> Self {
        Self {
            len: 0,
            valid: AtomicBool::new(true),
            alloc,
            registry,
            slots: CachePadded::new(std::array::from_fn(|_| None)),
        }
    }

    #[inline]
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// LIFO push. Returns the slot when the shelf is full or invalidated.
    #[inline]
    pub(crate) fn push(&mut self, slot: RawSlot<T>) -> Result<(), RawSlot<T>> {
        if self.len == LC || !self.is_valid() {
            return Err(slot);
        }
        self.slots[self.len] = Some(slot);
        self.len += 1;
        Ok(())
    }

    /// LIFO pop. `None` when empty or invalidated.
    #[inline]
    pub(crate) fn pop(&mut self) -> Option<RawSlot<T>> {
        if self.len == 0 || !self.is_valid() {
            return None;
        }
        self.len -= 1;
        self.slots[self.len].take()
    }

    /// Moves every held slot into `out`, leaving the shelf empty.
    pub(crate) fn take_all(&mut self, out: &mut Vec<RawSlot<T>>) {
        for i in 0..self.len {
            out.push(self.slots[i].take().expect("shelf slot below len is filled"));
        }
        self.len = 0;
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Offers `slot` to every live pool of this instantiation; hands it back
    /// if none accepts.
    fn rescue(&self, slot: RawSlot<T>) -> Option<RawSlot<T>> {
        let mut pending = Some(slot);
        self.registry.for_each_live(|core| {
            if core.is_shutdown() {
                return false;
            }
            match core.try_restock(pending.take().expect("slot pending")) {
                Ok(()) => true,
                Err(slot) => {
                    pending = Some(slot);
                    false
                }
            }
        });
        pending
    }
}

impl<T, A, S, const PS: usize, const LC: usize> Drop for Shelf<T, A, S, PS, LC>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    fn drop(&mut self) {
        self.invalidate();
        for i in 0..self.len {
            let slot = self.slots[i].take().expect("shelf slot below len is filled");
            if let Some(orphan) = self.rescue(slot) {
                slot::retire_slot(&self.alloc, orphan);
            }
        }
        self.len = 0;
    }
}

thread_local! {
    /// This thread's shelves, one per pool instantiation.
    static SHELVES: RefCell<AHashMap<TypeId, Box<dyn Any>>> = RefCell::new(AHashMap::new());
}

/// Runs `f` on this thread's shelf for the given instantiation, creating the
/// shelf on first use.
///
/// Returns `None` once the thread's shelf storage is being torn down (or the
/// shelf cannot be created); callers treat that as "no cache" and use the
/// global ring. `f` must not run payload code — see the module docs.
pub(crate) fn with_shelf<T, A, S, const PS: usize, const LC: usize, R>(
    alloc: &A,
    registry: &Arc<Registry<T, A, S, PS, LC>>,
    f: impl FnOnce(&mut Shelf<T, A, S, PS, LC>) -> R,
) -> Option<R>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    SHELVES
        .try_with(|shelves| {
            let mut shelves = shelves.borrow_mut();
            let shelf = shelves
                .entry(TypeId::of::<Shelf<T, A, S, PS, LC>>())
                .or_insert_with(|| Box::new(Shelf::new(alloc.clone(), Arc::clone(registry))));
            let shelf = shelf
                .downcast_mut::<Shelf<T, A, S, PS, LC>>()
                .expect("shelf keyed under the wrong instantiation");
            f(shelf)
        })
        .ok()
}
