//! Bounded MPMC ring of free slots.
//!
//! # Design
//!
//! A thin wrapper over [`crossbeam_queue::ArrayQueue`], which provides the
//! lock-free multi-producer/multi-consumer contract the pool needs:
//! linearizable `try_push`/`try_pop` with bounded capacity and no blocking.
//! All payload state transitions happen outside the ring; it moves raw slot
//! handles only.
//!
//! # Capacity invariant
//!
//! `N` must be a power of two and at least 2. The ring's index arithmetic
//! masks by `capacity - 1`, and the engine's prewarm budgeting assumes the
//! capacity is exact. The assert is compile-time; instantiating a pool with
//! a bad capacity fails to build.
//!
//! # Ordering
//!
//! The queue's internal CAS protocol orders push/pop against each other; the
//! pool layers no additional ordering on top of it. `approx_len` is a
//! best-effort snapshot used only for prewarm budgeting and statistics.

use crossbeam_queue::ArrayQueue;

use crate::slot::RawSlot;

/// Process-wide bounded queue of free slots.
pub(crate) struct FreeRing<T, const N: usize> {
    queue: ArrayQueue<RawSlot<T>>,
}

impl<T, const N: usize> FreeRing<T, N> {
    /// Compile-time capacity validation.
    const CAPACITY: usize = {
        assert!(N.is_power_of_two(), "ring capacity must be a power of two");
        assert!(N >= 2, "ring capacity must be at least 2");
        N
    };

    pub(crate) fn new() -> Self {
        // Force compile-time validation of CAPACITY.
        let _ = Self::CAPACITY;
        Self {
            queue: ArrayQueue::new(N),
        }
    }

    /// Non-blocking push. Returns the slot when the ring is full.
    #[inline]
    pub(crate) fn try_push(&self, slot: RawSlot<T>) -> Result<(), RawSlot<T>> {
        self.queue.push(slot)
    }

    /// Non-blocking pop. Returns `None` when the ring is empty.
    #[inline]
    pub(crate) fn try_pop(&self) -> Option<RawSlot<T>> {
        self.queue.pop()
    }

    /// Best-effort element count; may be stale under contention.
    #[inline]
    pub(crate) fn approx_len(&self) -> usize {
        self.queue.len()
    }
}
