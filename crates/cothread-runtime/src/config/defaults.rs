//! Library defaults for [`RuntimeConfig`](super::RuntimeConfig)

use cothread_core::constants;

/// Dedicated stack size per coroutine
pub const STACK_SIZE: usize = constants::DEFAULT_STACK_SIZE;

/// Blocks in the environment's default shared pool (0 = dedicated stacks)
pub const SHARE_STACK_COUNT: usize = 0;

/// Size of each shared block
pub const SHARE_STACK_SIZE: usize = constants::DEFAULT_STACK_SIZE;

/// Events retrieved per poller wait
pub const MAX_EVENTS: usize = constants::DEFAULT_MAX_EVENTS;

/// Timeout wheel horizon in milliseconds
pub const TIMEOUT_HORIZON_MS: u64 = constants::DEFAULT_TIMEOUT_HORIZON_MS;

/// Longest single poller wait in milliseconds
pub const MAX_WAIT_MS: u64 = 1000;

/// Resume nesting limit
pub const MAX_CALL_DEPTH: usize = constants::DEFAULT_MAX_CALL_DEPTH;

/// Stack of the context that copies shared-stack contents
pub const TRANSFER_STACK_SIZE: usize = 64 * 1024;

/// Whether new coroutines start with the syscall hook flag set
pub const ENABLE_HOOK: bool = false;
