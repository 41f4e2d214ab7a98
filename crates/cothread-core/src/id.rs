//! Coroutine identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a coroutine
///
/// Ids are allocated from a process-wide counter and never reused.
/// Zero is reserved for the root coroutine of every environment.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CoroutineId(u64);

impl CoroutineId {
    /// Id of the root (native thread stack) coroutine
    pub const ROOT: CoroutineId = CoroutineId(0);

    /// Allocate a fresh id
    #[inline]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        CoroutineId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Create an id from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        CoroutineId(id)
    }

    /// Get the raw value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the root sentinel
    #[inline]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl From<CoroutineId> for u64 {
    #[inline]
    fn from(id: CoroutineId) -> Self {
        id.0
    }
}

impl fmt::Debug for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "CoroutineId(ROOT)")
        } else {
            write!(f, "CoroutineId({})", self.0)
        }
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "root")
        } else {
            write!(f, "co#{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_unique_and_non_root() {
        let a = CoroutineId::next();
        let b = CoroutineId::next();
        assert_ne!(a, b);
        assert!(!a.is_root());
        assert!(CoroutineId::ROOT.is_root());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", CoroutineId::ROOT), "root");
        assert_eq!(format!("{}", CoroutineId::new(7)), "co#7");
    }
}
