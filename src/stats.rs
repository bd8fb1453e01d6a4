//! Pool statistics: a relaxed-atomic counter bank, zero-sized when disabled.
//!
//! # Design
//!
//! Statistics are selected by type parameter, not runtime flag:
//! [`AtomicStats`] carries one cache-line-isolated atomic per counter, and
//! [`NoStats`] is a zero-sized type whose methods are empty and inline away.
//! A pool instantiated with `NoStats` spends no bytes and no instructions on
//! accounting.
//!
//! Counters are diagnostic, not synchronizing: every access is `Relaxed`,
//! and a [`PoolStats`] snapshot is not required to be mutually consistent
//! across counters. `in_use` and `current_pool_size` in particular may read
//! transiently skewed under contention; treat them as approximate.
//!
//! # False sharing
//!
//! Each counter sits in its own `CachePadded` cell so that threads hammering
//! `acquires` do not invalidate the cache line holding `releases`.
//!
//! # Counting discipline
//!
//! Counters record *completed* operations. An acquire that fails allocation
//! rolls `acquires`/`in_use` back before the error is surfaced, so the
//! balance `acquires == releases + in_use` holds at every quiescent point,
//! failed acquires included.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Point-in-time view of a pool's counters.
///
/// All-zero when the pool was instantiated without statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolStats {
    /// Successful acquires.
    pub acquires: u64,
    /// Releases, including those that destroyed the slot.
    pub releases: u64,
    /// Fresh payloads constructed on the slow acquire path.
    pub creates: u64,
    /// Ring pops on acquire plus cross-thread releases.
    pub cross_thread_ops: u64,
    /// Acquires satisfied by the releasing thread's own cache.
    pub same_thread_hits: u64,
    /// Slots currently out with callers.
    pub in_use: u64,
    /// Best-effort size of the global free ring at snapshot time.
    pub current_pool_size: u64,
    /// Acquires that hit the thread-local cache.
    pub cache_hits: u64,
    /// Batched cache flushes.
    pub batch_operations: u64,
}

/// Counter sink selected by the pool's `S` type parameter.
///
/// The engine calls these hooks at fixed points; implementations decide
/// whether anything is recorded. Custom sinks are possible but the two
/// provided ones cover the compiled-in / compiled-out split.
pub trait StatsSink: Default + Send + Sync + 'static {
    /// Whether this sink records anything. Lets tests and reporting skip
    /// work when counters are compiled out.
    const ENABLED: bool;

    /// A slot acquire began: `acquires += 1`, `in_use += 1`.
    fn on_acquire(&self);
    /// The acquire could not complete; undo [`on_acquire`](Self::on_acquire).
    fn on_acquire_failed(&self);
    /// Acquire hit the thread cache: `same_thread_hits`, `cache_hits`.
    fn on_cache_hit(&self);
    /// Acquire popped the global ring: `cross_thread_ops += 1`.
    fn on_ring_hit(&self);
    /// A fresh payload was constructed: `creates += 1`.
    fn on_create(&self);
    /// A slot came back: `releases += 1`, `in_use -= 1`.
    fn on_release(&self);
    /// The release happened on a different thread: `cross_thread_ops += 1`.
    fn on_cross_thread_release(&self);
    /// A batched cache flush ran: `batch_operations += 1`.
    fn on_batch(&self);

    /// Snapshot the counters; `pooled` is the ring's approximate size.
    fn snapshot(&self, pooled: usize) -> PoolStats;
}

/// Compiled-in statistics: one isolated cache line per counter.
#[derive(Debug, Default)]
pub struct AtomicStats {
    acquires: CachePadded<AtomicU64>,
    releases: CachePadded<AtomicU64>,
    creates: CachePadded<AtomicU64>,
    cross_thread_ops: CachePadded<AtomicU64>,
    same_thread_hits: CachePadded<AtomicU64>,
    in_use: CachePadded<AtomicU64>,
    cache_hits: CachePadded<AtomicU64>,
    batch_operations: CachePadded<AtomicU64>,
}

impl StatsSink for AtomicStats {
    const ENABLED: bool = true;

    #[inline]
    fn on_acquire(&self) {
        self.acquires.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn on_acquire_failed(&self) {
        self.acquires.fetch_sub(1, Ordering::Relaxed);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    fn on_cache_hit(&self) {
        self.same_thread_hits.fetch_add(1, Ordering::Relaxed);
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn on_ring_hit(&self) {
        self.cross_thread_ops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn on_create(&self) {
        self.creates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn on_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    fn on_cross_thread_release(&self) {
        self.cross_thread_ops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn on_batch(&self) {
        self.batch_operations.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, pooled: usize) -> PoolStats {
        PoolStats {
            acquires: self.acquires.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            cross_thread_ops: self.cross_thread_ops.load(Ordering::Relaxed),
            same_thread_hits: self.same_thread_hits.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::Relaxed),
            current_pool_size: pooled as u64,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            batch_operations: self.batch_operations.load(Ordering::Relaxed),
        }
    }
}

/// Compiled-out statistics. Zero bytes, zero instructions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoStats;

impl StatsSink for NoStats {
    const ENABLED: bool = false;

    #[inline(always)]
    fn on_acquire(&self) {}
    #[inline(always)]
    fn on_acquire_failed(&self) {}
    #[inline(always)]
    fn on_cache_hit(&self) {}
    #[inline(always)]
    fn on_ring_hit(&self) {}
    #[inline(always)]
    fn on_create(&self) {}
    #[inline(always)]
    fn on_release(&self) {}
    #[inline(always)]
    fn on_cross_thread_release(&self) {}
    #[inline(always)]
    fn on_batch(&self) {}

    #[inline(always)]
    fn snapshot(&self, _pooled: usize) -> PoolStats {
        PoolStats::default()
    }
}

// NoStats must stay zero-sized; the disabled configuration pays nothing.
const _: () = assert!(std::mem::size_of::<NoStats>() == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_balance() {
        let s = AtomicStats::default();
        s.on_acquire();
        s.on_acquire();
        s.on_release();

        let snap = s.snapshot(0);
        assert_eq!(snap.acquires, 2);
        assert_eq!(snap.releases, 1);
        assert_eq!(snap.in_use, 1);
        assert_eq!(snap.acquires, snap.releases + snap.in_use);
    }

    #[test]
    fn failed_acquire_rolls_back() {
        let s = AtomicStats::default();
        s.on_acquire();
        s.on_acquire_failed();

        let snap = s.snapshot(0);
        assert_eq!(snap.acquires, 0);
        assert_eq!(snap.in_use, 0);
    }

    #[test]
    fn path_counters_are_independent() {
        let s = AtomicStats::default();
        s.on_cache_hit();
        s.on_ring_hit();
        s.on_create();
        s.on_cross_thread_release();
        s.on_batch();

        let snap = s.snapshot(5);
        assert_eq!(snap.same_thread_hits, 1);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cross_thread_ops, 2);
        assert_eq!(snap.creates, 1);
        assert_eq!(snap.batch_operations, 1);
        assert_eq!(snap.current_pool_size, 5);
    }

    #[test]
    fn disabled_sink_reports_zeroes() {
        let s = NoStats;
        s.on_acquire();
        s.on_release();
        assert_eq!(s.snapshot(17), PoolStats::default());
    }

    #[test]
    fn counters_do_not_share_cache_lines() {
        let s = AtomicStats::default();
        let a = &s.acquires as *const _ as usize;
        let b = &s.releases as *const _ as usize;
        assert!(b.abs_diff(a) >= 64, "counters must sit on distinct lines");
    }
}
