//! Thread-local current environment
//!
//! Explicit lifecycle: [`init_current_thread`] installs an environment,
//! [`teardown`] removes it. [`get_or_init`] creates one lazily from
//! [`RuntimeConfig::from_env`].

use crate::config::RuntimeConfig;
use crate::environment::Environment;
use cothread_core::{CoError, CoResult};
use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    static CURRENT_ENV: RefCell<Option<Rc<Environment>>> = const { RefCell::new(None) };
}

/// Install a new environment for this thread
pub fn init_current_thread(config: RuntimeConfig) -> CoResult<Rc<Environment>> {
    if try_current().is_some() {
        return Err(CoError::AlreadyInitialized);
    }
    let env = Environment::new(config)?;
    CURRENT_ENV.with(|cell| *cell.borrow_mut() = Some(env.clone()));
    Ok(env)
}

/// This thread's environment
pub fn current() -> CoResult<Rc<Environment>> {
    try_current().ok_or(CoError::NotInitialized)
}

#[inline]
pub fn try_current() -> Option<Rc<Environment>> {
    CURRENT_ENV.with(|cell| cell.borrow().clone())
}

/// This thread's environment, created from the process environment on
/// first use
pub fn get_or_init() -> CoResult<Rc<Environment>> {
    match try_current() {
        Some(env) => Ok(env),
        None => init_current_thread(RuntimeConfig::from_env()),
    }
}

/// Remove this thread's environment. It is dropped once the last
/// coroutine handle referencing it is gone.
pub fn teardown() -> Option<Rc<Environment>> {
    CURRENT_ENV.with(|cell| cell.borrow_mut().take())
}
