//! # cothread - stackful coroutines for one thread at a time
//!
//! Cooperative coroutines with their own stacks, switched by a few lines
//! of assembly, driven by an epoll/kqueue/IOCP event loop with
//! millisecond timeouts.
//!
//! ## Features
//!
//! - **Stackful**: a coroutine can yield from any call depth
//! - **Shared stacks**: many coroutines multiplex a small pool of stack
//!   blocks; displaced frames are saved and restored transparently
//! - **Readiness + timeouts**: park on descriptors and/or a deadline, resume
//!   from the drive loop
//! - **Per-thread environment**: no cross-thread migration, no locking
//!
//! ## Quick Start
//!
//! ```ignore
//! use cothread::{init_thread_env, sleep_ms, RuntimeConfig};
//!
//! let env = init_thread_env(RuntimeConfig::from_env().share_stack_count(2))?;
//! let co = env.spawn(|| {
//!     println!("hello");
//!     sleep_ms(10).unwrap();
//!     println!("again");
//! })?;
//! env.run_until(|_| co.is_finished())?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Embedding program (root)                    │
//! │           spawn / resume / run_once / run_until             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Environment                           │
//! │      call stack, waiters, drive loop, shared-stack copy     │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Context  │      │  Poller   │      │  Timeout  │
//!    │  switch   │      │ (epoll/…) │      │   wheel   │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │
//!          ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │          Stack blocks (dedicated or shared pool)        │
//!    └─────────────────────────────────────────────────────────┘
//! ```

use std::rc::Rc;

// Re-export core types
pub use cothread_core::{
    CoError, CoResult, CoroutineId, CoroutineState, Event, Interest, PollError, StackError,
};

// Re-export env utilities
pub use cothread_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use cothread_runtime::{
    Cond, Coroutine, CoroutineAttr, Environment, Events, PollFd, PoolStats, Poller,
    RawDescriptor, RuntimeConfig, Selector, SharedStackPool,
};

/// Install a scheduling environment for the calling thread
pub fn init_thread_env(config: RuntimeConfig) -> CoResult<Rc<Environment>> {
    cothread_runtime::tls::init_current_thread(config)
}

/// This thread's environment, created from `CO_*` variables on first use
pub fn current_env() -> CoResult<Rc<Environment>> {
    cothread_runtime::tls::get_or_init()
}

/// Remove this thread's environment
pub fn teardown_thread_env() -> Option<Rc<Environment>> {
    cothread_runtime::tls::teardown()
}

/// Create a coroutine in this thread's environment and run it until its
/// first suspension
pub fn spawn<F>(f: F) -> CoResult<Coroutine>
where
    F: FnOnce() + 'static,
{
    current_env()?.spawn(f)
}

/// Suspend the running coroutine and return to its resumer
pub fn yield_now() -> CoResult<()> {
    current_env()?.yield_now()
}

/// Park the running coroutine for `ms` milliseconds
pub fn sleep_ms(ms: u64) -> CoResult<()> {
    current_env()?.sleep_ms(ms)
}

/// Wait for readiness on `fds`; see [`Environment::poll`]
pub fn poll(fds: &mut [PollFd], timeout_ms: Option<u64>) -> CoResult<usize> {
    current_env()?.poll(fds, timeout_ms)
}

/// Whether the running coroutine wants blocking calls turned into yields
pub fn is_hooked() -> bool {
    cothread_runtime::tls::try_current().is_some_and(|env| env.is_hooked())
}

/// Id of the running coroutine on this thread
pub fn current_id() -> CoroutineId {
    cothread_runtime::tls::try_current()
        .map(|env| env.current_id())
        .unwrap_or(CoroutineId::ROOT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_thread_local_api() {
        std::thread::spawn(|| {
            let env = init_thread_env(RuntimeConfig::new().max_wait_ms(5)).unwrap();
            let log = Rc::new(RefCell::new(Vec::new()));
            let l = log.clone();
            let co = spawn(move || {
                l.borrow_mut().push(current_id());
                sleep_ms(2).unwrap();
                yield_now().unwrap();
                l.borrow_mut().push(current_id());
            })
            .unwrap();

            env.run_until(|_| co.state() == CoroutineState::Suspended && env.waiting() == 0)
                .unwrap();
            co.resume().unwrap();
            assert!(co.is_finished());
            assert_eq!(*log.borrow(), vec![co.id(), co.id()]);
            assert!(current_id().is_root());
            assert!(!is_hooked());
            teardown_thread_env();
        })
        .join()
        .unwrap();
    }
}
