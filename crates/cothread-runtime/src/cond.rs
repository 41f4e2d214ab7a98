//! Condition variable for coroutines of one environment
//!
//! Waiters park through the same waiter/timeout machinery as `poll`. A
//! signal wakes the oldest waiter on the next drive-loop tick.

use crate::environment::{Environment, Wake};
use cothread_core::CoResult;
use std::cell::RefCell;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct Cond {
    waiters: RefCell<VecDeque<u64>>,
}

impl Cond {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the running coroutine until signaled or `timeout_ms` elapses
    /// (forever on `None`). Returns false on timeout.
    pub fn timed_wait(&self, env: &Environment, timeout_ms: Option<u64>) -> CoResult<bool> {
        let wid = env.prepare_wait(&[], timeout_ms)?;
        self.waiters.borrow_mut().push_back(wid);
        let result = env.complete_wait(wid);
        self.waiters.borrow_mut().retain(|w| *w != wid);
        Ok(result?.wake == Wake::Signal)
    }

    /// Wake the oldest waiter. Returns false if nobody was waiting.
    pub fn signal(&self, env: &Environment) -> bool {
        loop {
            let Some(wid) = self.waiters.borrow_mut().pop_front() else {
                return false;
            };
            if env.wake_waiter(wid) {
                return true;
            }
        }
    }

    /// Wake every waiter. Returns how many were woken.
    pub fn broadcast(&self, env: &Environment) -> usize {
        let all: Vec<u64> = self.waiters.borrow_mut().drain(..).collect();
        all.into_iter().filter(|wid| env.wake_waiter(*wid)).count()
    }

    /// Number of parked waiters
    pub fn len(&self) -> usize {
        self.waiters.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.borrow().is_empty()
    }
}
