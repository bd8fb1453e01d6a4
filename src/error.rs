//! Error type for pool operations.
//!
//! Only environmental conditions are surfaced to callers: the pool being
//! torn down, or the allocator running dry on the slow acquire path. Errors
//! internal to payload cleanup are never reported through this type; cleanup
//! problems must not leak slots or destabilize other threads, so the engine
//! resolves them by destroying the affected slot instead.

use std::fmt;

/// Why an acquire could not hand out a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolError {
    /// The pool's destructor has begun; no further slots are handed out.
    Shutdown,
    /// The allocator failed to provide storage for a fresh payload.
    ///
    /// The pool's counters are rolled back before this is returned, so a
    /// failed acquire leaves the statistics balanced.
    AllocationFailed,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "pool is shut down"),
            Self::AllocationFailed => write!(f, "allocator failed to provide slot storage"),
        }
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(PoolError::Shutdown.to_string(), "pool is shut down");
        assert_eq!(
            PoolError::AllocationFailed.to_string(),
            "allocator failed to provide slot storage"
        );
    }

    #[test]
    fn is_std_error() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<PoolError>();
    }
}
