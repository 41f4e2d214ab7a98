//! Interest sets and the normalized readiness event
//!
//! Bit values match the Linux epoll flags so that a hook layer can pass
//! `EPOLLIN | EPOLLOUT | ...` through unchanged on every platform.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

use crate::error::PollError;

/// Set of readiness conditions a registration is interested in
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Interest(u32);

impl Interest {
    /// No interest (valid only as the result of masking)
    pub const NONE: Interest = Interest(0);
    /// Descriptor readable
    pub const READABLE: Interest = Interest(0x001);
    /// Descriptor writable
    pub const WRITABLE: Interest = Interest(0x004);
    /// Error condition pending
    pub const ERROR: Interest = Interest(0x008);
    /// Peer hung up
    pub const HANGUP: Interest = Interest(0x010);

    const ALL: u32 = 0x001 | 0x004 | 0x008 | 0x010;

    /// Build an interest set from raw bits, rejecting unknown flags
    pub const fn from_bits(bits: u32) -> Result<Interest, PollError> {
        if bits & !Self::ALL != 0 {
            return Err(PollError::InvalidInterest(bits));
        }
        Ok(Interest(bits))
    }

    /// Raw bit value
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[inline]
    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    #[inline]
    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    #[inline]
    pub const fn is_hangup(self) -> bool {
        self.0 & Self::HANGUP.0 != 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    #[inline]
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    #[inline]
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.is_readable() {
            parts.push("READABLE");
        }
        if self.is_writable() {
            parts.push("WRITABLE");
        }
        if self.is_error() {
            parts.push("ERROR");
        }
        if self.is_hangup() {
            parts.push("HANGUP");
        }
        if parts.is_empty() {
            write!(f, "Interest(NONE)")
        } else {
            write!(f, "Interest({})", parts.join(" | "))
        }
    }
}

/// Normalized readiness event returned by every poller backend
///
/// `tag` is the opaque value supplied at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Event {
    pub tag: u64,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Event {
    /// Event for `tag` with no flags set
    #[inline]
    pub const fn new(tag: u64) -> Self {
        Self {
            tag,
            readable: false,
            writable: false,
            error: false,
            hangup: false,
        }
    }

    /// Event for `tag` carrying the flags of `interest`
    #[inline]
    pub const fn with_interest(tag: u64, interest: Interest) -> Self {
        Self {
            tag,
            readable: interest.is_readable(),
            writable: interest.is_writable(),
            error: interest.is_error(),
            hangup: interest.is_hangup(),
        }
    }

    /// Merge the flags of `interest` into this event
    #[inline]
    pub fn merge(&mut self, interest: Interest) {
        self.readable |= interest.is_readable();
        self.writable |= interest.is_writable();
        self.error |= interest.is_error();
        self.hangup |= interest.is_hangup();
    }

    /// Flags of this event as an interest set
    pub fn interest(&self) -> Interest {
        let mut i = Interest::NONE;
        if self.readable {
            i |= Interest::READABLE;
        }
        if self.writable {
            i |= Interest::WRITABLE;
        }
        if self.error {
            i |= Interest::ERROR;
        }
        if self.hangup {
            i |= Interest::HANGUP;
        }
        i
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bits_rejects_unknown() {
        assert!(Interest::from_bits(0x001 | 0x004).is_ok());
        assert_eq!(
            Interest::from_bits(0x002),
            Err(PollError::InvalidInterest(0x002))
        );
        assert!(Interest::from_bits(0x8000_0000).is_err());
    }

    #[test]
    fn test_merge_combines_flags() {
        let mut ev = Event::with_interest(9, Interest::READABLE);
        ev.merge(Interest::WRITABLE);
        assert!(ev.readable && ev.writable);
        assert!(!ev.error && !ev.hangup);
        assert_eq!(ev.interest(), Interest::READABLE | Interest::WRITABLE);
    }

    #[test]
    fn test_contains() {
        let rw = Interest::READABLE | Interest::WRITABLE;
        assert!(rw.contains(Interest::READABLE));
        assert!(!rw.contains(Interest::HANGUP));
        assert!(!rw.contains(Interest::NONE));
    }
}
