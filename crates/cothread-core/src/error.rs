//! Error types for the cothread runtime

use thiserror::Error;

/// Result type for runtime operations
pub type CoResult<T> = Result<T, CoError>;

/// Errors that can occur in runtime operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoError {
    /// Resume of a coroutine whose entry function already returned
    #[error("coroutine already finished")]
    Finished,

    /// Resume of a coroutine that is already on the call stack
    #[error("coroutine already running")]
    AlreadyRunning,

    /// Resume nesting exceeded the configured limit
    #[error("call stack depth {0} exceeded")]
    CallDepthExceeded(usize),

    /// Operation requires a coroutine context but was called on the root
    #[error("not inside a coroutine")]
    NotInCoroutine,

    /// Drive loop invoked from inside a coroutine
    #[error("event loop must run on the root context")]
    NotOnRoot,

    /// Coroutine belongs to a different environment
    #[error("coroutine belongs to another environment")]
    WrongEnvironment,

    /// Coroutine-specific storage key out of range
    #[error("specific slot {0} out of range")]
    SlotOutOfRange(usize),

    /// Configuration rejected by validation
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    /// No environment installed for this thread
    #[error("environment not initialized")]
    NotInitialized,

    /// Environment already installed for this thread
    #[error("environment already initialized")]
    AlreadyInitialized,

    /// The coroutine body panicked
    #[error("coroutine panicked")]
    Panicked,

    /// Stack memory error
    #[error("stack error: {0}")]
    Stack(#[from] StackError),

    /// Readiness notification error
    #[error("poll error: {0}")]
    Poll(#[from] PollError),
}

/// Stack memory errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// Requested size of zero
    #[error("stack size must be non-zero")]
    InvalidSize,

    /// Shared pool created with no blocks
    #[error("shared stack pool needs at least one block")]
    EmptyPool,

    /// mmap or VirtualAlloc failed
    #[error("stack allocation failed: errno {0}")]
    AllocationFailed(i32),

    /// Guard page protection failed
    #[error("stack protection failed: errno {0}")]
    ProtectionFailed(i32),

    /// Shared stacks are not available on this platform
    #[error("shared stacks unsupported on this platform")]
    Unsupported,
}

/// Readiness notification errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    /// Descriptor registered twice
    #[error("descriptor {0} already registered")]
    AlreadyRegistered(i64),

    /// modify on a descriptor that was never registered
    #[error("descriptor {0} not registered")]
    NotRegistered(i64),

    /// Interest bits outside {readable, writable, error, hangup}
    #[error("invalid interest bits {0:#x}")]
    InvalidInterest(u32),

    /// Event buffer capacity of zero
    #[error("event buffer too small")]
    BufferTooSmall,

    /// Too many descriptors in one poll call
    #[error("too many descriptors: {0}")]
    TooManyDescriptors(usize),

    /// OS error with errno (or GetLastError on Windows)
    #[error("os error {0}")]
    Os(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", CoError::Finished), "coroutine already finished");
        let e: CoError = StackError::InvalidSize.into();
        assert_eq!(format!("{}", e), "stack error: stack size must be non-zero");
        let e: CoError = PollError::AlreadyRegistered(5).into();
        assert_eq!(format!("{}", e), "poll error: descriptor 5 already registered");
    }

    #[test]
    fn test_error_conversion() {
        let e: CoError = PollError::NotRegistered(3).into();
        assert!(matches!(e, CoError::Poll(PollError::NotRegistered(3))));
    }
}
