//! Small stable per-thread integer identity.
//!
//! # Purpose
//!
//! The release path needs to decide whether a slot is coming back on the
//! thread that last initialized it. Payloads that opt into the affinity tag
//! store a [`ThreadTag`]; release compares it against the current thread's
//! tag and only then takes the contention-free cache path.
//!
//! Tags are assigned lazily from a global counter on first use and stay
//! fixed for the lifetime of the thread. They are identity only; nothing is
//! derived from their magnitude.
//!
//! # Correctness invariant
//!
//! `current()` returns the same value for every call on a given thread, and
//! two concurrently live threads never share a tag (the counter would have
//! to wrap through 2^32 - 1 assignments first).

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Identity of the OS thread that last initialized a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadTag(u32);

impl ThreadTag {
    /// Raw tag value, for diagnostics.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Sentinel meaning "this thread has not been assigned a tag yet".
///
/// Using `u32::MAX` instead of `Option<u32>` keeps the TLS slot a single
/// word and the hot-path comparison a single `cmp`. The assignment loop
/// below never hands the sentinel out as a real tag.
const UNASSIGNED: u32 = u32::MAX;

static NEXT_TAG: AtomicU32 = AtomicU32::new(0);

thread_local! {
    /// Per-thread tag storage.
    ///
    /// The `const { ... }` initializer means no runtime init code runs; the
    /// first read on any thread sees `UNASSIGNED` and claims a tag then.
    static TAG: Cell<u32> = const { Cell::new(UNASSIGNED) };
}

/// Returns this thread's tag, assigning one on first use.
///
/// # Performance
///
/// Steady state is a single thread-local read. The first call on a thread
/// additionally does one relaxed `fetch_add`.
#[inline]
pub fn current() -> ThreadTag {
    TAG.with(|cell| {
        let v = cell.get();
        if v != UNASSIGNED {
            return ThreadTag(v);
        }
        let mut id = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
        if id == UNASSIGNED {
            // Counter wrapped onto the sentinel; burn one more value.
            id = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
        }
        cell.set(id);
        ThreadTag(id)
    })
}
