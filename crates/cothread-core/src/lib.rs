//! # cothread-core
//!
//! Core types for the cothread stackful coroutine runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All platform-specific implementations are in `cothread-runtime`.
//!
//! ## Modules
//!
//! - `id` - Coroutine identifier type
//! - `state` - Coroutine lifecycle state
//! - `event` - Interest set and the normalized readiness event record
//! - `error` - Error types
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod event;
pub mod error;
pub mod env;

// Re-exports for convenience
pub use id::CoroutineId;
pub use state::CoroutineState;
pub use event::{Event, Interest};
pub use error::{CoError, CoResult, PollError, StackError};
pub use env::{env_get, env_get_bool, env_get_opt};

/// Constants for memory layout and limits
pub mod constants {
    /// Default dedicated stack size (128 KB)
    pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

    /// Largest stack a single coroutine may request (8 MB)
    pub const MAX_STACK_SIZE: usize = 8 * 1024 * 1024;

    /// Page size used for rounding and guard pages
    pub const PAGE_SIZE: usize = 4096;

    /// Number of coroutine-specific storage slots per control block
    pub const MAX_SPECIFIC_SLOTS: usize = 1024;

    /// Default capacity of the per-wait event buffer
    pub const DEFAULT_MAX_EVENTS: usize = 1024;

    /// Default timeout wheel horizon, one bucket per millisecond
    pub const DEFAULT_TIMEOUT_HORIZON_MS: u64 = 60 * 1000;

    /// Default nesting limit for the resume call stack
    pub const DEFAULT_MAX_CALL_DEPTH: usize = 128;

    /// Bytes reserved at the high end of every stack before the first frame
    pub const STACK_RESERVED: usize = 64;
}

/// Round `size` up to the next multiple of [`constants::PAGE_SIZE`].
#[inline]
pub const fn page_round_up(size: usize) -> usize {
    let page = constants::PAGE_SIZE;
    size.saturating_add(page - 1) & !(page - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_round_up() {
        assert_eq!(page_round_up(1), 4096);
        assert_eq!(page_round_up(4096), 4096);
        assert_eq!(page_round_up(4097), 8192);
        assert_eq!(page_round_up(128 * 1024), 128 * 1024);
        assert_eq!(page_round_up(usize::MAX) % 4096, 0);
    }
}
