//! Process-wide registry of live pools.
//!
//! # Purpose
//!
//! A thread can exit while its per-thread cache still holds free slots. The
//! cache's destructor consults this registry to push those slots into any
//! live pool of the same instantiation instead of destroying them.
//!
//! # Shape
//!
//! One global map keyed by pool instantiation (`TypeId`), each value a
//! per-instantiation [`Registry`]: a concurrent map from pool id to a weak
//! reference plus the pool's creation time (diagnostic only). Pools insert
//! themselves on construction and remove themselves at the start of their
//! destruction sequence, so a rescuing thread never picks a pool that has
//! begun draining; the weak reference and the shutdown flag cover the
//! remaining races.
//!
//! The registry is written twice per pool lifetime and read only by dying
//! threads; `DashMap`'s sharded locking is plenty for that traffic.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

use dashmap::DashMap;

use crate::alloc::SlotAlloc;
use crate::payload::Poolable;
use crate::pool::PoolCore;
use crate::stats::StatsSink;

/// Process-unique pool identity.
pub(crate) type PoolId = u64;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_pool_id() -> PoolId {
    NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)
}

/// One registered pool: weak handle plus creation time.
pub(crate) struct PoolEntry<T, A, S, const PS: usize, const LC: usize>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    created_at: Instant,
    core: Weak<PoolCore<T, A, S, PS, LC>>,
}

impl<T, A, S, const PS: usize, const LC: usize> fmt::Debug for PoolEntry<T, A, S, PS, LC>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("created_at", &self.created_at)
            .field("live", &(self.core.strong_count() > 0))
            .finish()
    }
}

/// Live pools of one instantiation.
pub(crate) struct Registry<T, A, S, const PS: usize, const LC: usize>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    pools: DashMap<PoolId, PoolEntry<T, A, S, PS, LC>>,
}

impl<T, A, S, const PS: usize, const LC: usize> Registry<T, A, S, PS, LC>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    pub(crate) fn insert(&self, id: PoolId, core: &Arc<PoolCore<T, A, S, PS, LC>>) {
        self.pools.insert(
            id,
            PoolEntry {
                created_at: Instant::now(),
                core: Arc::downgrade(core),
            },
        );
    }

    pub(crate) fn remove(&self, id: PoolId) {
        self.pools.remove(&id);
    }

    /// Visits every still-live pool; `visit` returns `true` to stop early.
    pub(crate) fn for_each_live<F>(&self, mut visit: F)
    where
        F: FnMut(&Arc<PoolCore<T, A, S, PS, LC>>) -> bool,
    {
        for entry in self.pools.iter() {
            if let Some(core) = entry.value().core.upgrade() {
                if visit(&core) {
                    return;
                }
            }
        }
    }
}

type AnyRegistry = Box<dyn Any + Send + Sync>;

static REGISTRIES: OnceLock<DashMap<TypeId, AnyRegistry>> = OnceLock::new();

/// Returns the registry for one pool instantiation, creating it on first use.
///
/// Registries live for the rest of the process once created; they hold only
/// weak references, so they keep no pool alive.
pub(crate) fn registry_of<T, A, S, const PS: usize, const LC: usize>(
) -> Arc<Registry<T, A, S, PS, LC>>
where
    T: Poolable,
    A: SlotAlloc<T>,
    S: StatsSink,
{
    let map = REGISTRIES.get_or_init(DashMap::new);
    let key = TypeId::of::<Registry<T, A, S, PS, LC>>();
    let entry = map
        .entry(key)
        .or_insert_with(|| Box::new(Arc::new(Registry::<T, A, S, PS, LC>::new())));
    entry
        .downcast_ref::<Arc<Registry<T, A, S, PS, LC>>>()
        .expect("registry keyed under the wrong instantiation")
        .clone()
}
