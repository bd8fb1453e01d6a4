//! Thread-safe object pool with a lock-free free ring and per-thread caches.
//!
//! The pool recycles heap-allocated payloads of a caller-chosen type `T` so
//! that steady-state acquire/release never touches the allocator:
//! - A bounded lock-free MPMC ring holds process-wide free slots.
//! - A per-thread LIFO cache absorbs the common "acquire and release on the
//!   same thread" path without touching shared state.
//! - An optional affinity tag on the payload steers the release path toward
//!   the cache only when the releasing thread matches the acquiring one.
//! - A process-wide registry lets a dying thread rescue its cached slots
//!   into any live pool instead of destroying them.
//!
//! Acquire routing (hot to cold):
//! 1) Pop from the current thread's cache.
//! 2) Pop from the global free ring.
//! 3) Allocate and construct a fresh payload.
//!
//! Release routing:
//! 1) Run the payload's release-time cleanup.
//! 2) Push into the thread cache when the release is same-thread and the
//!    pool is not shutting down.
//! 3) Else push into the global ring; if the ring is full, destroy the slot.
//!
//! Two layers share one engine: [`ObjectPool`] hands out raw owning handles
//! the caller must return via [`ObjectPool::release`], and [`SharedPool`]
//! wraps the same engine in reference-counted [`SharedSlot`] handles that
//! release on final drop.
//!
//! # Example
//!
//! ```
//! use slotpool::{ObjectPool, Poolable};
//!
//! #[derive(Default)]
//! struct Message {
//!     bytes: Vec<u8>,
//! }
//!
//! impl Poolable for Message {
//!     fn reset(&mut self) {
//!         self.bytes.clear();
//!     }
//! }
//!
//! let pool: ObjectPool<Message> = ObjectPool::new();
//! let mut slot = pool.acquire().expect("pool is live");
//! slot.bytes.extend_from_slice(b"hello");
//! pool.release(slot);
//! ```
//!
//! # Module map
//! - `payload`: capability traits payloads opt into (`reset`, `scrub`,
//!   rebuild-from-args, thread affinity).
//! - `alloc` / `slot`: slot storage provider and the owning slot handle.
//! - `ring`: the bounded MPMC free ring.
//! - `cache`: per-(pool-type, thread) LIFO shelf and thread-exit rescue.
//! - `registry`: process-wide set of live pools consulted by dying threads.
//! - `stats`: relaxed-atomic counter bank, zero-sized when disabled.
//! - `pool` / `shared`: the engine and the reference-counted layer.
//!
//! # Concurrency contract
//! Acquire, release, prewarm, shrink, and flush never block; they loop only
//! through bounded `try_push`/`try_pop` attempts. The sole blocking operation
//! in the crate is a fixed ~2 ms quiesce sleep during pool destruction.

pub mod alloc;
mod cache;
pub mod error;
pub mod payload;
pub mod pool;
mod registry;
mod ring;
pub mod shared;
pub mod slot;
pub mod stats;
pub mod thread_tag;

#[cfg(test)]
pub mod test_utils;

pub use alloc::{DefaultSlotAlloc, SlotAlloc};
pub use error::PoolError;
pub use payload::{Poolable, Rebuild};
pub use pool::ObjectPool;
pub use shared::{SharedPool, SharedSlot};
pub use slot::RawSlot;
pub use stats::{AtomicStats, NoStats, PoolStats, StatsSink};
pub use thread_tag::ThreadTag;

/// Default capacity of the global free ring. Must be a power of two.
pub const DEFAULT_POOL_SIZE: usize = 1024;

/// Default capacity of the per-thread LIFO cache.
pub const DEFAULT_LOCAL_CACHE_SIZE: usize = 32;
