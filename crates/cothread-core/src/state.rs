//! Coroutine lifecycle state

use core::fmt;

/// State of a coroutine
///
/// ```text
/// Created ──resume──► Running ◄──resume── Suspended
///                        │  └────yield────────►┘
///                        └──entry returns──► Finished
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoroutineState {
    /// Control block allocated, context not yet constructed
    Created = 0,

    /// On the environment's call stack (the top one is executing)
    Running = 1,

    /// Yielded, waiting for a resume
    Suspended = 2,

    /// Entry function returned; never resumable again
    Finished = 3,
}

impl CoroutineState {
    /// Check if a resume is allowed from this state
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, CoroutineState::Created | CoroutineState::Suspended)
    }

    /// Check if the entry function has returned
    #[inline]
    pub const fn is_finished(&self) -> bool {
        matches!(self, CoroutineState::Finished)
    }

    /// Check if the context has been constructed
    #[inline]
    pub const fn is_started(&self) -> bool {
        !matches!(self, CoroutineState::Created)
    }
}

impl fmt::Display for CoroutineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoroutineState::Created => write!(f, "CREATED"),
            CoroutineState::Running => write!(f, "RUNNING"),
            CoroutineState::Suspended => write!(f, "SUSPENDED"),
            CoroutineState::Finished => write!(f, "FINISHED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(CoroutineState::Created.is_resumable());
        assert!(CoroutineState::Suspended.is_resumable());
        assert!(!CoroutineState::Running.is_resumable());
        assert!(!CoroutineState::Finished.is_resumable());

        assert!(CoroutineState::Finished.is_finished());
        assert!(!CoroutineState::Created.is_started());
        assert!(CoroutineState::Suspended.is_started());
    }
}
