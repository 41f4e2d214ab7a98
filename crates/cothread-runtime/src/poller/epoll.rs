//! epoll backend (Linux)
//!
//! Level-triggered. Interest bits already match the epoll flag values, so
//! registration passes them through and adds `EPOLLRDHUP` to catch a peer
//! that closed its write side.

use super::{timeout_to_c_int, Events, RawDescriptor, Selector};
use cothread_core::{Event, Interest, PollError};
use nix::errno::Errno;

pub struct Epoll {
    epfd: RawDescriptor,
    raw: Vec<libc::epoll_event>,
}

impl Epoll {
    fn ctl(&self, op: libc::c_int, fd: RawDescriptor, interest: Interest, tag: u64) -> Result<(), Errno> {
        let mut ev = libc::epoll_event {
            events: interest.bits() | libc::EPOLLRDHUP as u32,
            u64: tag,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }
}

fn normalize(raw: &libc::epoll_event) -> Event {
    let bits = raw.events;
    Event {
        tag: raw.u64,
        readable: bits & libc::EPOLLIN as u32 != 0,
        writable: bits & libc::EPOLLOUT as u32 != 0,
        error: bits & libc::EPOLLERR as u32 != 0,
        hangup: bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
    }
}

impl Selector for Epoll {
    fn new() -> Result<Self, PollError> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(PollError::Os(Errno::last_raw()));
        }
        tracing::debug!(epfd, "epoll created");
        Ok(Self { epfd, raw: Vec::new() })
    }

    fn register(&mut self, fd: RawDescriptor, interest: Interest, tag: u64) -> Result<(), PollError> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, tag).map_err(|e| match e {
            Errno::EEXIST => PollError::AlreadyRegistered(fd as i64),
            e => PollError::Os(e as i32),
        })
    }

    fn modify(&mut self, fd: RawDescriptor, interest: Interest, tag: u64) -> Result<(), PollError> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, tag).map_err(|e| match e {
            Errno::ENOENT => PollError::NotRegistered(fd as i64),
            e => PollError::Os(e as i32),
        })
    }

    fn unregister(&mut self, fd: RawDescriptor) -> Result<(), PollError> {
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            match Errno::last() {
                // never registered, or already closed (close drops the registration)
                Errno::ENOENT | Errno::EBADF => {}
                e => return Err(PollError::Os(e as i32)),
            }
        }
        Ok(())
    }

    fn wait(&mut self, events: &mut Events, timeout_ms: Option<u64>) -> Result<usize, PollError> {
        events.clear();
        let cap = events.capacity();
        if self.raw.len() < cap {
            self.raw.resize(cap, libc::epoll_event { events: 0, u64: 0 });
        }

        let n = unsafe {
            libc::epoll_wait(self.epfd, self.raw.as_mut_ptr(), cap as libc::c_int, timeout_to_c_int(timeout_ms))
        };
        if n < 0 {
            return match Errno::last() {
                Errno::EINTR => Ok(0),
                e => Err(PollError::Os(e as i32)),
            };
        }

        for raw in &self.raw[..n as usize] {
            events.push(normalize(raw));
        }
        Ok(events.len())
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_register_twice_fails() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut ep = Epoll::new().unwrap();
        ep.register(a.as_raw_fd(), Interest::READABLE, 1).unwrap();
        assert_eq!(
            ep.register(a.as_raw_fd(), Interest::READABLE, 1),
            Err(PollError::AlreadyRegistered(a.as_raw_fd() as i64))
        );
    }

    #[test]
    fn test_modify_unknown_fails() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut ep = Epoll::new().unwrap();
        assert_eq!(
            ep.modify(a.as_raw_fd(), Interest::WRITABLE, 1),
            Err(PollError::NotRegistered(a.as_raw_fd() as i64))
        );
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut ep = Epoll::new().unwrap();
        assert!(ep.unregister(a.as_raw_fd()).is_ok());
        ep.register(a.as_raw_fd(), Interest::READABLE, 1).unwrap();
        assert!(ep.unregister(a.as_raw_fd()).is_ok());
        assert!(ep.unregister(a.as_raw_fd()).is_ok());
    }

    #[test]
    fn test_readable_carries_tag() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut ep = Epoll::new().unwrap();
        let mut events = Events::with_capacity(8).unwrap();
        ep.register(a.as_raw_fd(), Interest::READABLE, 0xBEEF).unwrap();

        assert_eq!(ep.wait(&mut events, Some(0)).unwrap(), 0);
        b.write_all(b"x").unwrap();
        assert_eq!(ep.wait(&mut events, Some(100)).unwrap(), 1);
        let ev = events.iter().next().unwrap();
        assert_eq!(ev.tag, 0xBEEF);
        assert!(ev.readable);
        assert!(!ev.writable);
    }

    #[test]
    fn test_modify_replaces_interest_and_tag() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut ep = Epoll::new().unwrap();
        let mut events = Events::with_capacity(8).unwrap();
        ep.register(a.as_raw_fd(), Interest::READABLE, 1).unwrap();
        ep.modify(a.as_raw_fd(), Interest::WRITABLE, 2).unwrap();

        assert_eq!(ep.wait(&mut events, Some(100)).unwrap(), 1);
        let ev = events.iter().next().unwrap();
        assert_eq!(ev.tag, 2);
        assert!(ev.writable);
        assert!(!ev.readable);
    }
}
