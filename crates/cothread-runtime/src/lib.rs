//! # cothread-runtime
//!
//! Platform-specific engine for the cothread coroutine runtime.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly, fibers on Windows)
//! - Stack memory (mmap/VirtualAlloc, dedicated and shared stacks)
//! - The per-thread scheduling environment and its drive loop
//! - Readiness notification (epoll, kqueue, IOCP)
//! - The timeout wheel

pub mod arch;
pub mod clock;
pub mod cond;
pub mod config;
pub mod coroutine;
pub mod environment;
pub mod memory;
pub mod poller;
pub mod timeout;
pub mod tls;

// Re-exports
pub use cond::Cond;
pub use config::RuntimeConfig;
pub use coroutine::{Coroutine, CoroutineAttr};
pub use environment::Environment;
pub use memory::{PoolStats, SharedStackPool, StackBlock};
pub use poller::{Events, PollFd, Poller, RawDescriptor, Selector};
pub use timeout::{TimeoutKey, TimeoutWheel};
