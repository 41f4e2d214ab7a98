//! Environment variable helpers used by the runtime configuration
//!
//! ```ignore
//! use cothread_core::env::{env_get, env_get_bool};
//!
//! let stack: usize = env_get("CO_STACK_SIZE", 128 * 1024);
//! let hooked = env_get_bool("CO_ENABLE_HOOK", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as `T`, or `default` when unset or
/// unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean.
///
/// "1", "true", "yes", "on" (any case) are true; any other set value is
/// false; unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable parsed as `T`, `None` when unset or unparsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
