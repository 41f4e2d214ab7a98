//! I/O completion port backend (Windows)
//!
//! IOCP reports finished operations, not readiness. A completion for an
//! associated socket is reported as that socket's registered interest.
//! Sockets cannot be detached from a port, so `unregister` only forgets the
//! socket and completions for forgotten sockets are dropped.

use super::{Events, RawDescriptor, Selector};
use cothread_core::{Event, Interest, PollError};
use std::collections::{HashMap, HashSet};
use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT};
use windows_sys::Win32::System::IO::{CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED_ENTRY};
use windows_sys::Win32::System::Threading::INFINITE;

#[derive(Debug, Clone, Copy)]
struct Registration {
    interest: Interest,
    tag: u64,
}

pub struct Iocp {
    port: HANDLE,
    registrations: HashMap<RawDescriptor, Registration>,
    /// Sockets ever associated with the port
    associated: HashSet<RawDescriptor>,
    raw: Vec<OVERLAPPED_ENTRY>,
}

fn last_error() -> i32 {
    unsafe { GetLastError() as i32 }
}

impl Selector for Iocp {
    fn new() -> Result<Self, PollError> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 0) };
        if port == 0 {
            return Err(PollError::Os(last_error()));
        }
        tracing::debug!(port, "completion port created");
        Ok(Self {
            port,
            registrations: HashMap::new(),
            associated: HashSet::new(),
            raw: Vec::new(),
        })
    }

    fn register(&mut self, fd: RawDescriptor, interest: Interest, tag: u64) -> Result<(), PollError> {
        if self.registrations.contains_key(&fd) {
            return Err(PollError::AlreadyRegistered(fd as i64));
        }
        if !self.associated.contains(&fd) {
            let ret = unsafe { CreateIoCompletionPort(fd as HANDLE, self.port, fd as usize, 0) };
            if ret == 0 {
                return Err(PollError::Os(last_error()));
            }
            self.associated.insert(fd);
        }
        self.registrations.insert(fd, Registration { interest, tag });
        Ok(())
    }

    fn modify(&mut self, fd: RawDescriptor, interest: Interest, tag: u64) -> Result<(), PollError> {
        match self.registrations.get_mut(&fd) {
            Some(reg) => {
                reg.interest = interest;
                reg.tag = tag;
                Ok(())
            }
            None => Err(PollError::NotRegistered(fd as i64)),
        }
    }

    fn unregister(&mut self, fd: RawDescriptor) -> Result<(), PollError> {
        self.registrations.remove(&fd);
        Ok(())
    }

    fn wait(&mut self, events: &mut Events, timeout_ms: Option<u64>) -> Result<usize, PollError> {
        events.clear();
        let cap = events.capacity();
        if self.raw.len() < cap {
            // SAFETY: OVERLAPPED_ENTRY is plain old data
            self.raw.resize(cap, unsafe { std::mem::zeroed() });
        }

        let millis = match timeout_ms {
            Some(ms) => ms.min((INFINITE - 1) as u64) as u32,
            None => INFINITE,
        };
        let mut removed = 0u32;
        let ok = unsafe {
            GetQueuedCompletionStatusEx(self.port, self.raw.as_mut_ptr(), cap as u32, &mut removed, millis, 0)
        };
        if ok == 0 {
            let err = unsafe { GetLastError() };
            if err == WAIT_TIMEOUT {
                return Ok(0);
            }
            return Err(PollError::Os(err as i32));
        }

        for entry in &self.raw[..removed as usize] {
            let fd = entry.lpCompletionKey as RawDescriptor;
            if let Some(reg) = self.registrations.get(&fd) {
                events.push(Event::with_interest(reg.tag, reg.interest));
            }
        }
        Ok(events.len())
    }

    fn name(&self) -> &'static str {
        "iocp"
    }
}

impl Drop for Iocp {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.port) };
    }
}
