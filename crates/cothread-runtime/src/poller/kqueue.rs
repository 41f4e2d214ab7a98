//! kqueue backend (macOS, iOS, BSDs)
//!
//! kqueue reports `EVFILT_READ` and `EVFILT_WRITE` as separate entries.
//! Entries for the same descriptor within one `wait` are merged into a
//! single [`Event`]; the merge marker lives on the per-descriptor
//! registration and is reset at the end of every batch. Two descriptors
//! registered with the same tag still produce two events.

use super::{Events, RawDescriptor, Selector};
use cothread_core::{Event, Interest, PollError};
use nix::errno::Errno;
use std::collections::HashMap;

#[derive(Debug)]
struct Registration {
    interest: Interest,
    tag: u64,
    /// Index of this batch's event for the descriptor, if already emitted
    fired: Option<usize>,
}

pub struct Kqueue {
    kq: RawDescriptor,
    registrations: HashMap<RawDescriptor, Registration>,
    raw: Vec<libc::kevent>,
}

fn kevent_for(fd: RawDescriptor, filter: i16, flags: u16) -> libc::kevent {
    // SAFETY: kevent is plain old data; zero is a valid value for every field
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev
}

impl Kqueue {
    /// Apply filter changes for moving `fd` from `old` to `new` interest
    fn apply(&self, fd: RawDescriptor, old: Interest, new: Interest) -> Result<(), PollError> {
        let mut changes = Vec::with_capacity(2);
        for (flag, filter) in [
            (Interest::READABLE, libc::EVFILT_READ),
            (Interest::WRITABLE, libc::EVFILT_WRITE),
        ] {
            match (old.intersects(flag), new.intersects(flag)) {
                (false, true) => changes.push(kevent_for(fd, filter as i16, libc::EV_ADD as u16)),
                (true, false) => changes.push(kevent_for(fd, filter as i16, libc::EV_DELETE as u16)),
                _ => {}
            }
        }
        if changes.is_empty() {
            return Ok(());
        }
        let ret = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as _,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if ret < 0 {
            let errno = Errno::last();
            // a descriptor closed under us has already lost its filters
            if new.is_empty() && matches!(errno, Errno::ENOENT | Errno::EBADF) {
                return Ok(());
            }
            return Err(PollError::Os(errno as i32));
        }
        Ok(())
    }
}

impl Selector for Kqueue {
    fn new() -> Result<Self, PollError> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(PollError::Os(Errno::last_raw()));
        }
        unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) };
        tracing::debug!(kq, "kqueue created");
        Ok(Self {
            kq,
            registrations: HashMap::new(),
            raw: Vec::new(),
        })
    }

    fn register(&mut self, fd: RawDescriptor, interest: Interest, tag: u64) -> Result<(), PollError> {
        if self.registrations.contains_key(&fd) {
            return Err(PollError::AlreadyRegistered(fd as i64));
        }
        self.apply(fd, Interest::NONE, interest)?;
        self.registrations.insert(fd, Registration { interest, tag, fired: None });
        Ok(())
    }

    fn modify(&mut self, fd: RawDescriptor, interest: Interest, tag: u64) -> Result<(), PollError> {
        let old = match self.registrations.get(&fd) {
            Some(reg) => reg.interest,
            None => return Err(PollError::NotRegistered(fd as i64)),
        };
        self.apply(fd, old, interest)?;
        if let Some(reg) = self.registrations.get_mut(&fd) {
            reg.interest = interest;
            reg.tag = tag;
        }
        Ok(())
    }

    fn unregister(&mut self, fd: RawDescriptor) -> Result<(), PollError> {
        match self.registrations.remove(&fd) {
            Some(reg) => self.apply(fd, reg.interest, Interest::NONE),
            None => Ok(()),
        }
    }

    fn wait(&mut self, events: &mut Events, timeout_ms: Option<u64>) -> Result<usize, PollError> {
        events.clear();
        let cap = events.capacity();
        if self.raw.len() < cap {
            self.raw.resize(cap, kevent_for(0, 0, 0));
        }

        let ts;
        let ts_ptr = match timeout_ms {
            Some(ms) => {
                ts = libc::timespec {
                    tv_sec: (ms / 1000) as _,
                    tv_nsec: ((ms % 1000) * 1_000_000) as _,
                };
                &ts as *const libc::timespec
            }
            None => std::ptr::null(),
        };

        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                self.raw.as_mut_ptr(),
                cap as _,
                ts_ptr,
            )
        };
        if n < 0 {
            return match Errno::last() {
                Errno::EINTR => Ok(0),
                e => Err(PollError::Os(e as i32)),
            };
        }

        let mut touched = Vec::new();
        for raw in &self.raw[..n as usize] {
            let fd = raw.ident as RawDescriptor;
            let Some(reg) = self.registrations.get_mut(&fd) else {
                continue;
            };

            let mut fired = Interest::NONE;
            if raw.filter == libc::EVFILT_READ as _ {
                fired |= Interest::READABLE;
            } else if raw.filter == libc::EVFILT_WRITE as _ {
                fired |= Interest::WRITABLE;
            }
            if raw.flags & libc::EV_EOF != 0 {
                fired |= Interest::HANGUP;
            }
            if raw.flags & libc::EV_ERROR != 0 {
                fired |= Interest::ERROR;
            }

            match reg.fired {
                Some(idx) => {
                    if let Some(ev) = events.get_mut(idx) {
                        ev.merge(fired);
                    }
                }
                None => {
                    if let Some(idx) = events.push(Event::with_interest(reg.tag, fired)) {
                        reg.fired = Some(idx);
                        touched.push(fd);
                    }
                }
            }
        }

        // reset merge markers so the next batch reports each firing again
        for fd in touched {
            if let Some(reg) = self.registrations.get_mut(&fd) {
                reg.fired = None;
            }
        }
        Ok(events.len())
    }

    fn name(&self) -> &'static str {
        "kqueue"
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_read_write_coalesced() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut kq = Kqueue::new().unwrap();
        let mut events = Events::with_capacity(8).unwrap();
        kq.register(a.as_raw_fd(), Interest::READABLE | Interest::WRITABLE, 7).unwrap();
        b.write_all(b"x").unwrap();

        assert_eq!(kq.wait(&mut events, Some(100)).unwrap(), 1);
        let ev = events.iter().next().unwrap();
        assert_eq!(ev.tag, 7);
        assert!(ev.readable && ev.writable);

        // next batch reports again rather than merging into the old one
        assert_eq!(kq.wait(&mut events, Some(100)).unwrap(), 1);
    }

    #[test]
    fn test_shared_tag_not_merged() {
        let (a, _b) = UnixStream::pair().unwrap();
        let (c, _d) = UnixStream::pair().unwrap();
        let mut kq = Kqueue::new().unwrap();
        let mut events = Events::with_capacity(8).unwrap();
        kq.register(a.as_raw_fd(), Interest::WRITABLE, 1).unwrap();
        kq.register(c.as_raw_fd(), Interest::WRITABLE, 1).unwrap();
        assert_eq!(kq.wait(&mut events, Some(100)).unwrap(), 2);
    }

    #[test]
    fn test_register_modify_conditions() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut kq = Kqueue::new().unwrap();
        let fd = a.as_raw_fd();
        assert_eq!(kq.modify(fd, Interest::READABLE, 1), Err(PollError::NotRegistered(fd as i64)));
        kq.register(fd, Interest::READABLE, 1).unwrap();
        assert_eq!(kq.register(fd, Interest::READABLE, 1), Err(PollError::AlreadyRegistered(fd as i64)));
        kq.modify(fd, Interest::WRITABLE, 2).unwrap();
        kq.unregister(fd).unwrap();
        kq.unregister(fd).unwrap();
    }
}
