//! Runtime configuration
//!
//! Compile-time defaults with environment variable overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use cothread_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .share_stack_count(4)
//!     .max_wait_ms(10);
//! ```

pub mod defaults;

use cothread_core::constants::MAX_STACK_SIZE;
use cothread_core::env::{env_get, env_get_bool};
use cothread_core::{page_round_up, CoError, CoResult};

/// Per-environment configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Dedicated stack size per coroutine
    pub stack_size: usize,
    /// Blocks in the default shared pool; 0 means dedicated stacks
    pub share_stack_count: usize,
    /// Size of each shared block
    pub share_stack_size: usize,
    /// Poller event buffer capacity
    pub max_events: usize,
    /// Timeout wheel horizon (one bucket per ms)
    pub timeout_horizon_ms: u64,
    /// Upper bound on a single poller wait
    pub max_wait_ms: u64,
    /// Resume nesting limit
    pub max_call_depth: usize,
    /// Stack of the shared-stack transfer context
    pub transfer_stack_size: usize,
    /// Hook flag given to new coroutines
    pub enable_hook: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `CO_STACK_SIZE`
    /// - `CO_SHARE_STACK_COUNT`
    /// - `CO_SHARE_STACK_SIZE`
    /// - `CO_MAX_EVENTS`
    /// - `CO_TIMEOUT_HORIZON_MS`
    /// - `CO_MAX_WAIT_MS`
    /// - `CO_MAX_CALL_DEPTH`
    /// - `CO_TRANSFER_STACK_SIZE`
    /// - `CO_ENABLE_HOOK` (0/1)
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("CO_STACK_SIZE", defaults::STACK_SIZE),
            share_stack_count: env_get("CO_SHARE_STACK_COUNT", defaults::SHARE_STACK_COUNT),
            share_stack_size: env_get("CO_SHARE_STACK_SIZE", defaults::SHARE_STACK_SIZE),
            max_events: env_get("CO_MAX_EVENTS", defaults::MAX_EVENTS),
            timeout_horizon_ms: env_get("CO_TIMEOUT_HORIZON_MS", defaults::TIMEOUT_HORIZON_MS),
            max_wait_ms: env_get("CO_MAX_WAIT_MS", defaults::MAX_WAIT_MS),
            max_call_depth: env_get("CO_MAX_CALL_DEPTH", defaults::MAX_CALL_DEPTH),
            transfer_stack_size: env_get("CO_TRANSFER_STACK_SIZE", defaults::TRANSFER_STACK_SIZE),
            enable_hook: env_get_bool("CO_ENABLE_HOOK", defaults::ENABLE_HOOK),
        }
    }

    /// Create config with library defaults only (no env override).
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            share_stack_count: defaults::SHARE_STACK_COUNT,
            share_stack_size: defaults::SHARE_STACK_SIZE,
            max_events: defaults::MAX_EVENTS,
            timeout_horizon_ms: defaults::TIMEOUT_HORIZON_MS,
            max_wait_ms: defaults::MAX_WAIT_MS,
            max_call_depth: defaults::MAX_CALL_DEPTH,
            transfer_stack_size: defaults::TRANSFER_STACK_SIZE,
            enable_hook: defaults::ENABLE_HOOK,
        }
    }

    // Builder methods

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn share_stack_count(mut self, n: usize) -> Self {
        self.share_stack_count = n;
        self
    }

    pub fn share_stack_size(mut self, size: usize) -> Self {
        self.share_stack_size = size;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn timeout_horizon_ms(mut self, ms: u64) -> Self {
        self.timeout_horizon_ms = ms;
        self
    }

    pub fn max_wait_ms(mut self, ms: u64) -> Self {
        self.max_wait_ms = ms;
        self
    }

    pub fn max_call_depth(mut self, n: usize) -> Self {
        self.max_call_depth = n;
        self
    }

    pub fn transfer_stack_size(mut self, size: usize) -> Self {
        self.transfer_stack_size = size;
        self
    }

    pub fn enable_hook(mut self, enable: bool) -> Self {
        self.enable_hook = enable;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> CoResult<()> {
        if self.stack_size == 0 {
            return Err(CoError::InvalidConfig("stack_size must be > 0"));
        }
        if self.share_stack_count > 0 && self.share_stack_size == 0 {
            return Err(CoError::InvalidConfig("share_stack_size must be > 0"));
        }
        if self.max_events == 0 {
            return Err(CoError::InvalidConfig("max_events must be > 0"));
        }
        if self.timeout_horizon_ms == 0 {
            return Err(CoError::InvalidConfig("timeout_horizon_ms must be > 0"));
        }
        if self.max_call_depth == 0 {
            return Err(CoError::InvalidConfig("max_call_depth must be > 0"));
        }
        if self.transfer_stack_size == 0 {
            return Err(CoError::InvalidConfig("transfer_stack_size must be > 0"));
        }
        Ok(())
    }

    /// Validate, then round stack sizes up to the page size and clamp them
    /// to the maximum stack size.
    pub fn normalized(mut self) -> CoResult<Self> {
        self.validate()?;
        self.stack_size = clamp_stack(self.stack_size);
        self.share_stack_size = clamp_stack(self.share_stack_size);
        self.transfer_stack_size = clamp_stack(self.transfer_stack_size);
        Ok(self)
    }

    /// Emit the configuration at debug level
    pub fn log(&self) {
        tracing::debug!(
            stack_size = self.stack_size,
            share_stack_count = self.share_stack_count,
            share_stack_size = self.share_stack_size,
            max_events = self.max_events,
            timeout_horizon_ms = self.timeout_horizon_ms,
            max_wait_ms = self.max_wait_ms,
            max_call_depth = self.max_call_depth,
            transfer_stack_size = self.transfer_stack_size,
            enable_hook = self.enable_hook,
            "runtime configuration"
        );
    }
}

fn clamp_stack(size: usize) -> usize {
    page_round_up(size.min(MAX_STACK_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = RuntimeConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.share_stack_count, 0);
        assert_eq!(config.max_wait_ms, 1000);
    }

    #[test]
    fn test_from_env_override() {
        std::env::set_var("CO_MAX_CALL_DEPTH", "7");
        let config = RuntimeConfig::from_env();
        std::env::remove_var("CO_MAX_CALL_DEPTH");
        assert_eq!(config.max_call_depth, 7);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .share_stack_count(4)
            .share_stack_size(32 * 1024)
            .max_wait_ms(5)
            .enable_hook(true);
        assert_eq!(config.share_stack_count, 4);
        assert_eq!(config.share_stack_size, 32 * 1024);
        assert_eq!(config.max_wait_ms, 5);
        assert!(config.enable_hook);
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().stack_size(0).validate().is_err());
        assert!(RuntimeConfig::new().max_events(0).validate().is_err());
        assert!(RuntimeConfig::new().timeout_horizon_ms(0).validate().is_err());
        assert!(RuntimeConfig::new().max_call_depth(0).validate().is_err());
        assert!(RuntimeConfig::new()
            .share_stack_count(2)
            .share_stack_size(0)
            .validate()
            .is_err());
        // size of an unused pool is not checked
        assert!(RuntimeConfig::new().share_stack_size(0).validate().is_ok());
    }

    #[test]
    fn test_normalized_rounds_and_clamps() {
        let config = RuntimeConfig::new()
            .stack_size(5000)
            .share_stack_size(64 * 1024 * 1024)
            .normalized()
            .unwrap();
        assert_eq!(config.stack_size, 8192);
        assert_eq!(config.share_stack_size, MAX_STACK_SIZE);
    }
}
