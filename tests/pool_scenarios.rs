//! End-to-end pool scenarios: recycling, cross-thread handoff, teardown
//! under churn, allocator failure, prewarm/shrink, and thread-exit rescue.
//!
//! Every scenario defines its own payload type. Caches and registries are
//! keyed per pool instantiation, so distinct payload types keep concurrently
//! running tests fully isolated from each other.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use slotpool::alloc::CountingSlotAlloc;
use slotpool::{
    AtomicStats, NoStats, ObjectPool, PoolError, Poolable, SharedPool, SlotAlloc, ThreadTag,
};

// ============================================================================
// Scenario 1: single-thread recycling
// ============================================================================

#[test]
fn single_thread_recycling() {
    struct Blob {
        bytes: [u8; 64],
    }
    impl Default for Blob {
        fn default() -> Self {
            Self { bytes: [0u8; 64] }
        }
    }
    impl Poolable for Blob {
        fn reset(&mut self) {
            self.bytes[0] = 0;
        }
    }

    let alloc: CountingSlotAlloc<Blob> = CountingSlotAlloc::default();
    let pool: ObjectPool<Blob, _, AtomicStats, 8, 4> = ObjectPool::with_allocator(alloc.clone());
    assert_eq!(pool.approx_size(), 4, "auto-prewarm fills half the ring");

    for i in 0..1000u32 {
        let mut slot = pool.acquire().expect("pool is live");
        slot.bytes[0] = i as u8;
        pool.release(slot);
    }

    let snap = pool.stats();
    assert_eq!(snap.acquires, 1000);
    assert_eq!(snap.releases, 1000);
    assert_eq!(snap.in_use, 0);
    assert!(snap.creates <= 1, "prewarmed pool never hits the allocator");
    assert!(
        snap.same_thread_hits >= 999,
        "all but the first acquire come from the thread cache, got {}",
        snap.same_thread_hits
    );
    assert!(
        snap.cross_thread_ops <= 1,
        "only the first acquire may pop the ring, got {}",
        snap.cross_thread_ops
    );

    pool.flush_local_cache();
    drop(pool);
    assert_eq!(alloc.outstanding(), 0, "no slot leaked at quiescence");
}

// ============================================================================
// Scenario 2: cross-thread handoff
// ============================================================================

#[test]
fn cross_thread_handoff() {
    #[derive(Default)]
    struct Parcel {
        tag: Option<ThreadTag>,
        payload: u64,
    }
    impl Poolable for Parcel {
        fn reset(&mut self) {
            self.payload = 0;
        }
        fn affinity_tag(&self) -> Option<ThreadTag> {
            self.tag
        }
        fn stamp_affinity(&mut self, tag: ThreadTag) {
            self.tag = Some(tag);
        }
    }

    let alloc: CountingSlotAlloc<Parcel> = CountingSlotAlloc::default();
    let pool: ObjectPool<Parcel, _, AtomicStats, 128, 16> = ObjectPool::unprimed(alloc.clone());
    let (tx, rx) = mpsc::channel();

    let pool_ref = &pool;
    thread::scope(|scope| {
        scope.spawn(move || {
            // Acquire everything up front so the releaser cannot feed slots
            // back into the ring mid-acquisition.
            let mut outbound = Vec::with_capacity(100);
            for i in 0..100u64 {
                let mut slot = pool_ref.acquire().expect("pool is live");
                slot.payload = i;
                outbound.push(slot);
            }
            for slot in outbound {
                tx.send(slot).expect("receiver alive");
            }
            drop(tx);
        });
        scope.spawn(move || {
            while let Ok(slot) = rx.recv() {
                pool_ref.release(slot);
            }
        });
    });

    let snap = pool.stats();
    assert_eq!(snap.acquires, 100);
    assert_eq!(snap.releases, 100);
    assert_eq!(snap.in_use, 0);
    assert_eq!(snap.creates, 100, "empty pool allocates every slot");
    assert_eq!(
        snap.cross_thread_ops, 100,
        "every release happens on the non-acquiring thread"
    );

    drop(pool);
    assert_eq!(alloc.outstanding(), 0, "handoff leaks nothing on teardown");
}

// ============================================================================
// Scenario 3: sustained churn, then teardown
// ============================================================================

#[test]
fn churn_then_teardown_settles_clean() {
    #[derive(Default)]
    struct Churn {
        touched: u64,
    }
    impl Poolable for Churn {
        fn reset(&mut self) {
            self.touched = 0;
        }
    }

    const WORKERS: usize = 8;
    const OPS: usize = 500;

    let alloc: CountingSlotAlloc<Churn> = CountingSlotAlloc::default();
    let pool: ObjectPool<Churn, _, AtomicStats, 64, 8> = ObjectPool::unprimed(alloc.clone());

    thread::scope(|scope| {
        for _ in 0..WORKERS {
            scope.spawn(|| {
                for i in 0..OPS {
                    let mut slot = pool.acquire().expect("pool stays live during the scope");
                    slot.touched = i as u64;
                    pool.release(slot);
                }
                // Cached slots of this worker are rescued into the pool's
                // ring when the thread exits here.
            });
        }
    });

    let snap = pool.stats();
    assert_eq!(snap.acquires, (WORKERS * OPS) as u64);
    assert_eq!(snap.releases, (WORKERS * OPS) as u64);
    assert_eq!(snap.in_use, 0, "in_use settles at zero after the scope");
    assert_eq!(snap.acquires, snap.releases + snap.in_use);

    drop(pool);
    assert_eq!(alloc.outstanding(), 0, "teardown after churn leaks nothing");
}

// ============================================================================
// Scenario 4: allocation-failure surfacing
// ============================================================================

/// Allocator with a fixed allocation budget; fails every request after it.
struct BudgetAlloc<T> {
    budget: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> BudgetAlloc<T> {
    fn with_budget(budget: usize) -> Self {
        Self {
            budget: Arc::new(AtomicUsize::new(budget)),
            live: Arc::new(AtomicUsize::new(0)),
            _marker: std::marker::PhantomData,
        }
    }

    fn outstanding(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

impl<T> Clone for BudgetAlloc<T> {
    fn clone(&self) -> Self {
        Self {
            budget: Arc::clone(&self.budget),
            live: Arc::clone(&self.live),
            _marker: std::marker::PhantomData,
        }
    }
}

// SAFETY: defers to the global allocator exactly like DefaultSlotAlloc; the
// budget only decides whether to allocate at all.
unsafe impl<T: 'static> SlotAlloc<T> for BudgetAlloc<T> {
    fn allocate(&self) -> Option<NonNull<T>> {
        let mut budget = self.budget.load(Ordering::Relaxed);
        loop {
            if budget == 0 {
                return None;
            }
            match self.budget.compare_exchange_weak(
                budget,
                budget - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => budget = seen,
            }
        }
        let ptr = slotpool::DefaultSlotAlloc.allocate()?;
        self.live.fetch_add(1, Ordering::Relaxed);
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<T>) {
        // SAFETY: ptr came from DefaultSlotAlloc::allocate above.
        unsafe { slotpool::DefaultSlotAlloc.deallocate(ptr) };
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.budget.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn allocation_failure_is_surfaced_and_balanced() {
    #[derive(Default)]
    struct Quota(u32);
    impl Poolable for Quota {}

    const BUDGET: usize = 5;
    let alloc = BudgetAlloc::<Quota>::with_budget(BUDGET);
    let pool: ObjectPool<Quota, _, AtomicStats, 8, 0> = ObjectPool::unprimed(alloc.clone());

    // Drain the pool: every budgeted slot ends up with the caller.
    let mut held = Vec::new();
    for _ in 0..BUDGET {
        held.push(pool.acquire().expect("within budget"));
    }

    let before = pool.stats();
    assert_eq!(pool.acquire().unwrap_err(), PoolError::AllocationFailed);
    let after = pool.stats();

    assert_eq!(before.in_use, after.in_use, "in_use restored after failure");
    assert_eq!(
        before.acquires, after.acquires,
        "failed acquire leaves counters balanced"
    );
    assert_eq!(after.acquires, after.releases + after.in_use);

    for slot in held {
        pool.release(slot);
    }
    drop(pool);
    assert_eq!(alloc.outstanding(), 0);
}

// ============================================================================
// Scenario 5: prewarm + shrink
// ============================================================================

#[test]
fn prewarm_then_shrink_by_exact_count() {
    #[derive(Default)]
    struct Warm;
    impl Poolable for Warm {}

    let alloc: CountingSlotAlloc<Warm> = CountingSlotAlloc::default();
    let pool: ObjectPool<Warm, _, NoStats, 256, 8> = ObjectPool::unprimed(alloc.clone());

    pool.prewarm(256);
    assert_eq!(pool.approx_size(), 256);
    assert_eq!(alloc.outstanding(), 256);

    let destroyed = pool.shrink(100);
    assert_eq!(destroyed, 100);
    assert_eq!(pool.approx_size(), 156, "size drops by exactly the shrink count");
    assert_eq!(alloc.outstanding(), 156);

    // Idempotence: a second identical shrink destroys at most that many again.
    let destroyed = pool.shrink(100);
    assert_eq!(destroyed, 100);
    assert_eq!(pool.approx_size(), 56);

    drop(pool);
    assert_eq!(alloc.outstanding(), 0);
}

// ============================================================================
// Scenario 6: thread-exit cache rescue
// ============================================================================

#[test]
fn dying_thread_rescues_its_cache() {
    #[derive(Default)]
    struct Rescued;
    impl Poolable for Rescued {}

    let alloc: CountingSlotAlloc<Rescued> = CountingSlotAlloc::default();
    let pool: ObjectPool<Rescued, _, AtomicStats, 8, 4> = ObjectPool::unprimed(alloc.clone());

    thread::scope(|scope| {
        scope.spawn(|| {
            let mut held = Vec::new();
            for _ in 0..4 {
                held.push(pool.acquire().expect("pool is live"));
            }
            for slot in held {
                pool.release(slot); // lands in this thread's cache
            }
            // The thread exits without touching any other pool API; its
            // cache must hand the four slots to the live pool's ring.
        });
    });

    assert_eq!(pool.approx_size(), 4, "rescued slots reached the ring");
    assert_eq!(pool.stats().creates, 4);

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.acquire().expect("pool is live"));
    }
    let snap = pool.stats();
    assert_eq!(snap.creates, 4, "rescued slots are reused, not reallocated");
    assert!(
        snap.cross_thread_ops >= 4,
        "rescued slots come back through the ring"
    );

    for slot in held {
        pool.release(slot);
    }
    pool.flush_local_cache();
    drop(pool);
    assert_eq!(alloc.outstanding(), 0);
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[test]
fn smallest_ring_capacity_works() {
    #[derive(Default)]
    struct Tiny;
    impl Poolable for Tiny {}

    let alloc: CountingSlotAlloc<Tiny> = CountingSlotAlloc::default();
    let pool: ObjectPool<Tiny, _, NoStats, 2, 2> = ObjectPool::with_allocator(alloc.clone());

    for _ in 0..10 {
        let a = pool.acquire().expect("pool is live");
        let b = pool.acquire().expect("pool is live");
        pool.release(a);
        pool.release(b);
    }

    pool.flush_local_cache();
    drop(pool);
    assert_eq!(alloc.outstanding(), 0);
}

#[test]
fn zero_local_cache_runs_through_the_ring() {
    #[derive(Default)]
    struct Uncached;
    impl Poolable for Uncached {}

    let alloc: CountingSlotAlloc<Uncached> = CountingSlotAlloc::default();
    let pool: ObjectPool<Uncached, _, AtomicStats, 8, 0> = ObjectPool::unprimed(alloc.clone());

    for _ in 0..50 {
        let slot = pool.acquire().expect("pool is live");
        pool.release(slot);
    }

    let snap = pool.stats();
    assert_eq!(snap.acquires, 50);
    assert_eq!(snap.same_thread_hits, 0, "no cache to hit");
    assert_eq!(snap.cache_hits, 0);
    assert_eq!(snap.creates, 1, "the ring still recycles the one slot");

    drop(pool);
    assert_eq!(alloc.outstanding(), 0);
}

#[test]
fn flush_is_idempotent() {
    #[derive(Default)]
    struct Flushed;
    impl Poolable for Flushed {}

    let pool: ObjectPool<Flushed, CountingSlotAlloc<Flushed>, AtomicStats, 8, 4> =
        ObjectPool::unprimed(CountingSlotAlloc::default());

    let slot = pool.acquire().expect("pool is live");
    pool.release(slot);
    assert_eq!(pool.approx_size(), 0, "slot parked in the thread cache");

    pool.flush_local_cache();
    let after_first = pool.approx_size();
    assert_eq!(after_first, 1);

    pool.flush_local_cache();
    assert_eq!(pool.approx_size(), after_first, "second flush is a no-op");
    assert_eq!(pool.stats().batch_operations, 1, "empty flush is not a batch");
}

// ============================================================================
// Shared layer end-to-end
// ============================================================================

#[test]
fn shared_handles_recycle_through_the_same_engine() {
    #[derive(Default, Debug)]
    struct Doc {
        title: String,
    }
    impl Poolable for Doc {
        fn reset(&mut self) {
            self.title.clear();
        }
    }

    let alloc: CountingSlotAlloc<Doc> = CountingSlotAlloc::default();
    let pool: SharedPool<Doc, _, AtomicStats, 8, 4> = SharedPool::with_allocator(alloc.clone());

    {
        let first = pool.acquire().expect("pool is live");
        let second = first.clone();
        assert_eq!(first.handle_count(), 2);
        assert_eq!(second.title, "");
        drop(first);
        drop(second);
    }

    let snap = pool.stats();
    assert_eq!(snap.acquires, 1);
    assert_eq!(snap.releases, 1);
    assert_eq!(snap.in_use, 0);

    pool.flush_local_cache();
    drop(pool);
    assert_eq!(alloc.outstanding(), 0);
}
