//! Readiness notification
//!
//! One [`Selector`] interface with a single backend compiled per target:
//!
//! | Target                 | Backend  | Notes                                  |
//! |------------------------|----------|----------------------------------------|
//! | Linux / Android        | epoll    | direct pass-through                    |
//! | macOS / iOS / BSDs     | kqueue   | read/write filters coalesced per batch |
//! | Windows                | IOCP     | completions reported as readiness      |
//!
//! Every backend returns the same normalized [`Event`] record.

use cothread_core::{Event, Interest, PollError};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod epoll;
        pub use self::epoll::Epoll as Poller;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd",
    ))] {
        mod kqueue;
        pub use self::kqueue::Kqueue as Poller;
    } else if #[cfg(windows)] {
        mod iocp;
        pub use self::iocp::Iocp as Poller;
    } else {
        compile_error!("Unsupported platform: no readiness backend");
    }
}

/// Descriptor type accepted by the poller
#[cfg(unix)]
pub type RawDescriptor = std::os::unix::io::RawFd;

/// Descriptor type accepted by the poller
#[cfg(windows)]
pub type RawDescriptor = std::os::windows::io::RawSocket;

/// Uniform readiness interface implemented by each OS backend
pub trait Selector: Sized {
    /// Open the OS event queue
    fn new() -> Result<Self, PollError>;

    /// Start watching `fd` for `interest`, reporting `tag` when it fires.
    ///
    /// Fails with [`PollError::AlreadyRegistered`] if `fd` is already known.
    fn register(&mut self, fd: RawDescriptor, interest: Interest, tag: u64) -> Result<(), PollError>;

    /// Replace the interest set and tag of a registered `fd`.
    ///
    /// Fails with [`PollError::NotRegistered`] if `fd` is unknown.
    fn modify(&mut self, fd: RawDescriptor, interest: Interest, tag: u64) -> Result<(), PollError>;

    /// Stop watching `fd`. Succeeds on unknown descriptors.
    fn unregister(&mut self, fd: RawDescriptor) -> Result<(), PollError>;

    /// Wait up to `timeout_ms` (forever on `None`) and fill `events`.
    ///
    /// Returns the number of normalized events. An interrupted wait
    /// returns 0.
    fn wait(&mut self, events: &mut Events, timeout_ms: Option<u64>) -> Result<usize, PollError>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Fixed-capacity buffer of normalized events filled by one `wait`
#[derive(Debug, Clone)]
pub struct Events {
    list: Vec<Event>,
    capacity: usize,
}

impl Events {
    /// Buffer for up to `capacity` events per wait
    pub fn with_capacity(capacity: usize) -> Result<Self, PollError> {
        if capacity == 0 {
            return Err(PollError::BufferTooSmall);
        }
        Ok(Self {
            list: Vec::with_capacity(capacity),
            capacity,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.list.iter()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.list.clear();
    }

    /// Append unless full. Returns the index of the stored event.
    pub(crate) fn push(&mut self, event: Event) -> Option<usize> {
        if self.list.len() >= self.capacity {
            return None;
        }
        self.list.push(event);
        Some(self.list.len() - 1)
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Event> {
        self.list.get_mut(index)
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.iter()
    }
}

/// One descriptor of a multi-descriptor [`poll`](crate::Environment::poll)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFd {
    pub fd: RawDescriptor,
    /// Requested conditions
    pub events: Interest,
    /// Conditions that fired, filled in on return
    pub revents: Interest,
}

impl PollFd {
    pub fn new(fd: RawDescriptor, events: Interest) -> Self {
        Self {
            fd,
            events,
            revents: Interest::NONE,
        }
    }
}

/// Clamp an optional millisecond timeout to what a C `int` can carry
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
pub(crate) fn timeout_to_c_int(timeout_ms: Option<u64>) -> i32 {
    match timeout_ms {
        None => -1,
        Some(ms) => ms.min(i32::MAX as u64) as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_capacity() {
        assert_eq!(Events::with_capacity(0).unwrap_err(), PollError::BufferTooSmall);
        let mut events = Events::with_capacity(2).unwrap();
        assert_eq!(events.push(Event::new(1)), Some(0));
        assert_eq!(events.push(Event::new(2)), Some(1));
        assert_eq!(events.push(Event::new(3)), None);
        assert_eq!(events.len(), 2);
        events.clear();
        assert!(events.is_empty());
    }

    #[test]
    fn test_timeout_to_c_int() {
        assert_eq!(timeout_to_c_int(None), -1);
        assert_eq!(timeout_to_c_int(Some(5)), 5);
        assert_eq!(timeout_to_c_int(Some(u64::MAX)), i32::MAX);
    }
}
