//! Owning slot handle and slot lifecycle helpers.
//!
//! A slot is storage for exactly one payload. While it exists it has exactly
//! one owner: the global ring, one thread cache, or the caller holding a
//! [`RawSlot`]. The helpers here are the only code that moves a slot across
//! the allocated/live boundary:
//!
//! - [`fresh_slot`]: allocate storage and move a constructed payload in.
//! - [`retire_slot`]: drop the payload in place and return the storage.
//!
//! The payload value is constructed *before* storage is allocated, so an
//! unwinding constructor has nothing to clean up; and retirement deallocates
//! through a guard, so an unwinding payload `Drop` still returns the bytes
//! to the allocator.

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use crate::alloc::SlotAlloc;

/// Owning handle to one pooled payload.
///
/// Obtained from `ObjectPool::acquire` and must be handed back via
/// `ObjectPool::release`. Dropping the handle without releasing leaks the
/// payload, the same as leaking the raw pointer it wraps.
///
/// The handle is the unique owner of its payload, so `Deref`/`DerefMut`
/// access is safe and uncontended.
pub struct RawSlot<T> {
    ptr: NonNull<T>,
}

// SAFETY: a RawSlot is the unique owner of its payload; moving the handle
// moves ownership of the T, and shared access only hands out &T.
unsafe impl<T: Send> Send for RawSlot<T> {}
unsafe impl<T: Sync> Sync for RawSlot<T> {}

impl<T> RawSlot<T> {
    /// Wraps a pointer to a live, initialized payload.
    #[inline]
    pub(crate) fn from_ptr(ptr: NonNull<T>) -> Self {
        Self { ptr }
    }

    /// Unwraps the handle into its pointer, giving up ownership tracking.
    #[inline]
    pub(crate) fn into_ptr(self) -> NonNull<T> {
        self.ptr
    }

    /// Raw payload pointer, for diagnostics such as reuse tracking.
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

impl<T> Deref for RawSlot<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the slot owns a live payload for the handle's lifetime.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for RawSlot<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: unique ownership; no other reference can exist.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> fmt::Debug for RawSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSlot").field("ptr", &self.ptr).finish()
    }
}

/// Allocates storage and moves `payload` into it.
///
/// Returns the payload unchanged when the allocator is exhausted, so the
/// caller can report the failure without having lost the value.
pub(crate) fn fresh_slot<T, A: SlotAlloc<T>>(alloc: &A, payload: T) -> Result<RawSlot<T>, T> {
    match alloc.allocate() {
        Some(ptr) => {
            // SAFETY: allocate returned storage sized and aligned for T;
            // write takes ownership of the payload.
            unsafe { ptr.as_ptr().write(payload) };
            Ok(RawSlot::from_ptr(ptr))
        }
        None => Err(payload),
    }
}

/// Drops the payload in place and returns its storage to the allocator.
///
/// The storage goes back even if the payload's `Drop` unwinds.
pub(crate) fn retire_slot<T, A: SlotAlloc<T>>(alloc: &A, slot: RawSlot<T>) {
    struct DeallocOnDrop<'a, T, A: SlotAlloc<T>> {
        alloc: &'a A,
        ptr: NonNull<T>,
    }

    impl<T, A: SlotAlloc<T>> Drop for DeallocOnDrop<'_, T, A> {
        fn drop(&mut self) {
            // SAFETY: the payload has been (or is being, if unwinding)
            // dropped; only the bytes remain to hand back.
            unsafe { self.alloc.deallocate(self.ptr) };
        }
    }

    let ptr = slot.into_ptr();
    let _guard = DeallocOnDrop { alloc, ptr };
    if mem::needs_drop::<T>() {
        // SAFETY: the slot owned a live payload; after this the storage
        // holds only uninitialized bytes, which the guard deallocates.
        unsafe { ptr::drop_in_place(ptr.as_ptr()) };
    }
}
