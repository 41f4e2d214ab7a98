//! Per-thread scheduling environment
//!
//! An [`Environment`] owns everything one OS thread needs to run
//! coroutines:
//!
//! ```text
//!   call stack      [root] ─► co#3 ─► co#7        (top = running)
//!   poller          epoll / kqueue / IOCP
//!   timeout wheel   deadline ─► waiter id
//!   waiters         waiter id ─► parked coroutine + its descriptors
//! ```
//!
//! Coroutines switch only through [`Environment::resume`] and the yield
//! path. The drive loop ([`Environment::run_once`]) runs on the root and
//! resumes whichever waiters fired, in the order the poller and the wheel
//! reported them.

use crate::arch;
#[cfg(unix)]
use crate::arch::Context;
use crate::clock::now_ms;
use crate::config::RuntimeConfig;
use crate::coroutine::{coroutine_main, ControlBlock, Coroutine, CoroutineAttr};
use crate::memory::SharedStackPool;
use crate::poller::{Events, PollFd, Poller, RawDescriptor, Selector};
use crate::timeout::{TimeoutKey, TimeoutWheel};
use cothread_core::{CoError, CoResult, CoroutineId, CoroutineState, Event, Interest, PollError};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::ffi::c_void;
use std::ptr::NonNull;
use std::rc::Rc;

#[cfg(unix)]
use crate::memory::StackBlock;
#[cfg(unix)]
use std::cell::UnsafeCell;

/// Bits of an event tag that index the descriptor within one wait
const TAG_INDEX_BITS: u32 = 16;
const TAG_INDEX_MASK: u64 = (1 << TAG_INDEX_BITS) - 1;

/// Why a parked coroutine was woken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Pending,
    Io,
    Timeout,
    Signal,
}

/// A coroutine parked on descriptors and/or a deadline
pub(crate) struct Waiter {
    cb: NonNull<ControlBlock>,
    fds: Vec<(RawDescriptor, Interest)>,
    revents: Vec<Interest>,
    timeout: Option<TimeoutKey>,
    pub(crate) wake: Wake,
}

/// Context that copies shared-stack contents while no coroutine runs on
/// the block being written.
#[cfg(unix)]
struct Transfer {
    ctx: UnsafeCell<Context>,
    stack: StackBlock,
    job: Cell<Option<NonNull<ControlBlock>>>,
}

/// One scheduling environment per OS thread
pub struct Environment {
    config: RuntimeConfig,
    root: Box<ControlBlock>,
    call_stack: RefCell<Vec<NonNull<ControlBlock>>>,
    #[cfg(unix)]
    transfer: Transfer,
    poller: RefCell<Poller>,
    events: RefCell<Events>,
    timeouts: RefCell<TimeoutWheel<u64>>,
    waiters: RefCell<HashMap<u64, Waiter>>,
    next_waiter: Cell<u64>,
    /// Waiters woken outside the poller (condition signals)
    ready: RefCell<VecDeque<u64>>,
    default_pool: Option<Rc<SharedStackPool>>,
}

impl Environment {
    /// Create an environment for the calling thread.
    pub fn new(config: RuntimeConfig) -> CoResult<Rc<Environment>> {
        let config = config.normalized()?;
        config.log();

        let poller = Poller::new()?;
        let events = Events::with_capacity(config.max_events)?;
        let timeouts = TimeoutWheel::new(config.timeout_horizon_ms, now_ms());
        let default_pool = match config.share_stack_count {
            0 => None,
            n => Some(Rc::new(SharedStackPool::new(n, config.share_stack_size)?)),
        };
        #[cfg(unix)]
        let transfer = Transfer {
            ctx: UnsafeCell::new(Context::new()),
            stack: StackBlock::new(config.transfer_stack_size)?,
            job: Cell::new(None),
        };
        tracing::debug!(poller = poller.name(), "environment created");

        Ok(Rc::new_cyclic(|me| Environment {
            config,
            root: Box::new(ControlBlock::root(me.as_ptr())),
            call_stack: RefCell::new(Vec::new()),
            #[cfg(unix)]
            transfer,
            poller: RefCell::new(poller),
            events: RefCell::new(events),
            timeouts: RefCell::new(timeouts),
            waiters: RefCell::new(HashMap::new()),
            next_waiter: Cell::new(1),
            ready: RefCell::new(VecDeque::new()),
            default_pool,
        }))
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Pool used by coroutines created without explicit stack options
    pub fn default_pool(&self) -> Option<Rc<SharedStackPool>> {
        self.default_pool.clone()
    }

    /// Create a coroutine with default attributes and resume it once.
    pub fn spawn<F>(self: &Rc<Self>, f: F) -> CoResult<Coroutine>
    where
        F: FnOnce() + 'static,
    {
        let co = Coroutine::new(self, &CoroutineAttr::default(), f)?;
        co.resume()?;
        Ok(co)
    }

    // ---------------------------------------------------------------------
    // Call stack
    // ---------------------------------------------------------------------

    #[inline]
    fn root_ptr(&self) -> NonNull<ControlBlock> {
        NonNull::from(&*self.root)
    }

    /// Running control block: call-stack top, or the root
    fn current_cb(&self) -> NonNull<ControlBlock> {
        self.call_stack
            .borrow()
            .last()
            .copied()
            .unwrap_or_else(|| self.root_ptr())
    }

    /// Running coroutine, or `None` on the root
    fn current_coroutine(&self) -> Option<&ControlBlock> {
        let top = self.call_stack.borrow().last().copied()?;
        // SAFETY: blocks on the call stack are alive until they leave it
        Some(unsafe { &*top.as_ptr() })
    }

    /// Id of the running coroutine ([`CoroutineId::ROOT`] on the root)
    pub fn current_id(&self) -> CoroutineId {
        // SAFETY: see `current_coroutine`
        unsafe { self.current_cb().as_ref().id }
    }

    /// Number of nested coroutines currently on the call stack
    pub fn call_depth(&self) -> usize {
        self.call_stack.borrow().len()
    }

    /// Whether the running coroutine has the syscall hook flag set
    pub fn is_hooked(&self) -> bool {
        self.current_coroutine().is_some_and(|cb| cb.hooked.get())
    }

    pub fn enable_hook(&self) -> CoResult<()> {
        let cb = self.current_coroutine().ok_or(CoError::NotInCoroutine)?;
        cb.hooked.set(true);
        Ok(())
    }

    pub fn disable_hook(&self) -> CoResult<()> {
        let cb = self.current_coroutine().ok_or(CoError::NotInCoroutine)?;
        cb.hooked.set(false);
        Ok(())
    }

    /// Store `value` in slot `key` of the running coroutine (or the root)
    pub fn set_specific<T: Any>(&self, key: usize, value: T) -> CoResult<()> {
        // SAFETY: see `current_coroutine`
        unsafe { self.current_cb().as_ref() }.set_specific(key, Box::new(value))
    }

    pub fn specific<T: Any + Clone>(&self, key: usize) -> CoResult<Option<T>> {
        unsafe { self.current_cb().as_ref() }.specific(key)
    }

    pub fn take_specific<T: Any>(&self, key: usize) -> CoResult<Option<T>> {
        unsafe { self.current_cb().as_ref() }.take_specific(key)
    }

    // ---------------------------------------------------------------------
    // Switching
    // ---------------------------------------------------------------------

    /// Switch into `to` until it yields or finishes.
    pub(crate) fn resume(&self, to: NonNull<ControlBlock>) -> CoResult<()> {
        // SAFETY: callers hold the owning handle, so `to` is alive
        let cb = unsafe { to.as_ref() };
        if !std::ptr::eq(cb.env, self) {
            return Err(CoError::WrongEnvironment);
        }
        if cb.is_root {
            return Err(CoError::AlreadyRunning);
        }
        let state = cb.state.get();
        if !state.is_resumable() {
            if state.is_finished() {
                tracing::warn!(id = %cb.id, "resume of finished coroutine");
                return Err(CoError::Finished);
            }
            tracing::warn!(id = %cb.id, "resume of running coroutine");
            return Err(CoError::AlreadyRunning);
        }
        if self.call_depth() >= self.config.max_call_depth {
            return Err(CoError::CallDepthExceeded(self.config.max_call_depth));
        }

        if !state.is_started() {
            let (low, size) = cb.bind_stack().ok_or(CoError::AlreadyRunning)?;
            // SAFETY: the stack belongs to `cb` (or its bound shared block)
            // and outlives the context; `cb` and `self` never move.
            unsafe {
                (*cb.ctx.get()).make(
                    low,
                    size,
                    coroutine_main,
                    to.as_ptr() as *mut c_void,
                    self as *const Environment as *mut c_void,
                );
            }
        }

        let from = self.current_cb();
        cb.state.set(CoroutineState::Running);
        self.call_stack.borrow_mut().push(to);
        let from_id = unsafe { from.as_ref() }.id;
        tracing::trace!(from = %from_id, to = %cb.id, "resume");

        // SAFETY: both contexts are live; `to` was made above or saved by
        // an earlier switch out of it
        unsafe { self.switch(from, to) };

        if cb.panic_pending.replace(false) {
            return Err(CoError::Panicked);
        }
        Ok(())
    }

    /// Suspend the running coroutine and return to its resumer.
    pub fn yield_now(&self) -> CoResult<()> {
        let (curr, prev) = {
            let mut stack = self.call_stack.borrow_mut();
            let curr = stack.pop().ok_or(CoError::NotInCoroutine)?;
            (curr, stack.last().copied().unwrap_or_else(|| self.root_ptr()))
        };
        // SAFETY: `curr` was on the call stack, so its handle is alive
        unsafe { curr.as_ref() }.state.set(CoroutineState::Suspended);
        unsafe { self.switch(curr, prev) };
        Ok(())
    }

    /// Final switch out of a coroutine whose body returned
    pub(crate) fn finish_current(&self, cb: NonNull<ControlBlock>) {
        let prev = {
            let mut stack = self.call_stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|c| *c == cb) {
                stack.remove(pos);
            }
            stack.last().copied().unwrap_or_else(|| self.root_ptr())
        };
        let block = unsafe { cb.as_ref() };
        block.state.set(CoroutineState::Finished);
        // frames on a shared block are dead from here on
        block.release_block();
        tracing::debug!(id = %block.id, "coroutine finished");
        unsafe { self.switch(cb, prev) };
    }

    /// Save into `from`, continue in `to`, loading `to`'s shared block first
    /// when another coroutine occupies it.
    ///
    /// # Safety
    ///
    /// Both control blocks must be alive and `to` must be switchable.
    unsafe fn switch(&self, from: NonNull<ControlBlock>, to: NonNull<ControlBlock>) {
        if self.switch_via_transfer(from, to) {
            return;
        }
        arch::swap(from.as_ref().ctx.get(), to.as_ref().ctx.get());
    }

    /// Route the switch through the transfer context when `to`'s shared
    /// block must be reloaded first. Returns false when a direct swap is
    /// enough.
    #[cfg(unix)]
    unsafe fn switch_via_transfer(&self, from: NonNull<ControlBlock>, to: NonNull<ControlBlock>) -> bool {
        let target = to.as_ref();
        let Some((_, block)) = target.stack.shared_block() else {
            return false;
        };
        if block.occupant() == Some(to) {
            return false;
        }
        if block.occupant().is_none() && target.spill.is_empty() {
            block.set_occupant(Some(to));
            return false;
        }

        self.transfer.job.set(Some(to));
        if !(*self.transfer.ctx.get()).is_made() {
            (*self.transfer.ctx.get()).make(
                self.transfer.stack.low(),
                self.transfer.stack.capacity(),
                transfer_main,
                self as *const Environment as *mut c_void,
                std::ptr::null_mut(),
            );
        }
        arch::swap(from.as_ref().ctx.get(), self.transfer.ctx.get());
        true
    }

    #[cfg(not(unix))]
    unsafe fn switch_via_transfer(&self, _from: NonNull<ControlBlock>, _to: NonNull<ControlBlock>) -> bool {
        false
    }

    // ---------------------------------------------------------------------
    // Waiting
    // ---------------------------------------------------------------------

    /// Park the running coroutine on `fds` and an optional timeout.
    /// Registration failures roll back every descriptor already added.
    pub(crate) fn prepare_wait(&self, fds: &[PollFd], timeout_ms: Option<u64>) -> CoResult<u64> {
        let cb = match self.call_stack.borrow().last().copied() {
            Some(cb) => cb,
            None => return Err(CoError::NotInCoroutine),
        };
        if fds.len() as u64 > TAG_INDEX_MASK {
            return Err(PollError::TooManyDescriptors(fds.len()).into());
        }

        let wid = self.next_waiter.get();
        self.next_waiter.set(wid + 1);

        {
            let mut poller = self.poller.borrow_mut();
            for (i, pfd) in fds.iter().enumerate() {
                let tag = (wid << TAG_INDEX_BITS) | i as u64;
                if let Err(e) = poller.register(pfd.fd, pfd.events, tag) {
                    tracing::debug!(fd = pfd.fd as i64, error = %e, "poll registration failed");
                    for done in &fds[..i] {
                        if let Err(e) = poller.unregister(done.fd) {
                            tracing::warn!(fd = done.fd as i64, error = %e, "rollback unregister failed");
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        let timeout = timeout_ms.map(|ms| {
            self.timeouts
                .borrow_mut()
                .add(now_ms().saturating_add(ms), wid)
        });
        self.waiters.borrow_mut().insert(
            wid,
            Waiter {
                cb,
                fds: fds.iter().map(|p| (p.fd, p.events)).collect(),
                revents: vec![Interest::NONE; fds.len()],
                timeout,
                wake: Wake::Pending,
            },
        );
        unsafe { cb.as_ref() }.waiter.set(Some(wid));
        Ok(wid)
    }

    /// Yield until waiter `wid` is woken, then tear it down.
    pub(crate) fn complete_wait(&self, wid: u64) -> CoResult<Waiter> {
        self.yield_now()?;
        self.take_waiter(wid).ok_or(CoError::NotInCoroutine)
    }

    /// Remove a waiter and release its timeout and registrations
    fn take_waiter(&self, wid: u64) -> Option<Waiter> {
        let mut waiter = self.waiters.borrow_mut().remove(&wid)?;
        unsafe { waiter.cb.as_ref() }.waiter.set(None);
        if let Some(key) = waiter.timeout.take() {
            self.timeouts.borrow_mut().remove(key);
        }
        let mut poller = self.poller.borrow_mut();
        for (fd, _) in &waiter.fds {
            if let Err(e) = poller.unregister(*fd) {
                tracing::warn!(fd = *fd as i64, error = %e, "unregister failed");
            }
        }
        Some(waiter)
    }

    /// Drop a wait whose coroutine is going away
    pub(crate) fn cancel_waiter(&self, wid: u64) {
        self.ready.borrow_mut().retain(|w| *w != wid);
        self.take_waiter(wid);
    }

    /// Wake waiter `wid` on the next tick. Returns false if it is gone or
    /// already woken.
    pub(crate) fn wake_waiter(&self, wid: u64) -> bool {
        let mut waiters = self.waiters.borrow_mut();
        let Some(w) = waiters.get_mut(&wid) else {
            return false;
        };
        if w.wake != Wake::Pending {
            return false;
        }
        w.wake = Wake::Signal;
        if let Some(key) = w.timeout.take() {
            self.timeouts.borrow_mut().remove(key);
        }
        self.ready.borrow_mut().push_back(wid);
        true
    }

    /// Wait for readiness on `fds` for up to `timeout_ms` (forever on
    /// `None`). Fills each `revents` and returns how many are non-empty.
    ///
    /// Inside a coroutine this parks the coroutine and lets the drive loop
    /// resume it. On the root it blocks the thread on a private poller.
    pub fn poll(&self, fds: &mut [PollFd], timeout_ms: Option<u64>) -> CoResult<usize> {
        for pfd in fds.iter_mut() {
            pfd.revents = Interest::NONE;
        }
        if self.call_depth() == 0 {
            return poll_blocking(fds, timeout_ms, self.config.max_events);
        }

        let wid = self.prepare_wait(fds, timeout_ms)?;
        let waiter = self.complete_wait(wid)?;

        let mut ready = 0;
        for (pfd, rev) in fds.iter_mut().zip(waiter.revents) {
            pfd.revents = rev;
            if !rev.is_empty() {
                ready += 1;
            }
        }
        Ok(ready)
    }

    /// Suspend the running coroutine for `ms` milliseconds (blocks the
    /// thread when called on the root).
    pub fn sleep_ms(&self, ms: u64) -> CoResult<()> {
        self.poll(&mut [], Some(ms)).map(|_| ())
    }

    /// Number of coroutines currently parked
    pub fn waiting(&self) -> usize {
        self.waiters.borrow().len()
    }

    /// Number of pending timeout items
    pub fn pending_timeouts(&self) -> usize {
        self.timeouts.borrow().len()
    }

    // ---------------------------------------------------------------------
    // Drive loop
    // ---------------------------------------------------------------------

    /// One scheduling tick: wait for events (bounded by the nearest
    /// deadline and `max_wait_ms`), expire timeouts, resume every woken
    /// coroutine. Returns the number of coroutines resumed.
    pub fn run_once(&self) -> CoResult<usize> {
        if self.call_depth() != 0 {
            return Err(CoError::NotOnRoot);
        }

        let max_wait = self.config.max_wait_ms;
        let wait = if self.ready.borrow().is_empty() {
            self.timeouts
                .borrow()
                .next_wait(now_ms(), max_wait)
                .unwrap_or(max_wait)
        } else {
            0
        };

        let fired: Vec<Event> = {
            let mut events = self.events.borrow_mut();
            self.poller.borrow_mut().wait(&mut events, Some(wait))?;
            events.iter().copied().collect()
        };

        let mut active: Vec<u64> = self.ready.borrow_mut().drain(..).collect();
        {
            let mut waiters = self.waiters.borrow_mut();
            for ev in &fired {
                let wid = ev.tag >> TAG_INDEX_BITS;
                let idx = (ev.tag & TAG_INDEX_MASK) as usize;
                let Some(w) = waiters.get_mut(&wid) else {
                    continue;
                };
                if let Some((_, requested)) = w.fds.get(idx) {
                    let mask = *requested | Interest::ERROR | Interest::HANGUP;
                    w.revents[idx] |= Interest::from_bits(ev.interest().bits() & mask.bits())
                        .unwrap_or(Interest::NONE);
                }
                if w.wake == Wake::Pending {
                    w.wake = Wake::Io;
                    if let Some(key) = w.timeout.take() {
                        self.timeouts.borrow_mut().remove(key);
                    }
                    active.push(wid);
                }
            }

            let expired = self.timeouts.borrow_mut().expire(now_ms());
            for wid in expired {
                if let Some(w) = waiters.get_mut(&wid) {
                    w.timeout = None;
                    if w.wake == Wake::Pending {
                        w.wake = Wake::Timeout;
                        active.push(wid);
                    }
                }
            }
        }

        let mut resumed = 0;
        for wid in active {
            let cb = match self.waiters.borrow().get(&wid) {
                Some(w) if w.wake != Wake::Pending => w.cb,
                _ => continue,
            };
            if unsafe { cb.as_ref() }.state.get() != CoroutineState::Suspended {
                continue;
            }
            match self.resume(cb) {
                Ok(()) => {}
                Err(e) => tracing::warn!(waiter = wid, error = %e, "resumed coroutine failed"),
            }
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Tick until `stop` returns true
    pub fn run_until<F>(&self, mut stop: F) -> CoResult<()>
    where
        F: FnMut(&Environment) -> bool,
    {
        while !stop(self) {
            self.run_once()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("call_depth", &self.call_depth())
            .field("waiting", &self.waiters.borrow().len())
            .field("pending_timeouts", &self.timeouts.borrow().len())
            .field("shared_pool", &self.default_pool)
            .finish()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        tracing::debug!(waiting = self.waiters.borrow().len(), "environment dropped");
    }
}

/// Body of the shared-stack transfer context
///
/// Each job saves the block's current occupant into its spill, restores
/// the target's spill and jumps into the target.
#[cfg(unix)]
extern "C" fn transfer_main(arg1: *mut c_void, _arg2: *mut c_void) {
    // SAFETY: `arg1` is the environment that made this context
    let env = unsafe { &*(arg1 as *const Environment) };
    loop {
        let Some(to) = env.transfer.job.take() else {
            tracing::error!("transfer context entered without a job");
            std::process::abort();
        };
        let target = unsafe { to.as_ref() };
        if let Some((pool, block)) = target.stack.shared_block() {
            if let Some(occ) = block.occupant() {
                let occ = unsafe { occ.as_ref() };
                if !occ.is_finished() {
                    // SAFETY: the occupant is suspended; its context holds
                    // the stack pointer it stopped at
                    let sp = unsafe { (*occ.ctx.get()).stack_pointer() };
                    let n = unsafe { block.save(&occ.spill, sp) };
                    pool.record_copy_out(n);
                    tracing::trace!(from = %occ.id, bytes = n, "shared stack saved");
                }
            }
            let n = unsafe { block.restore(&target.spill) };
            if n > 0 {
                pool.record_copy_in(n);
                tracing::trace!(to = %target.id, bytes = n, "shared stack restored");
            }
            block.set_occupant(Some(to));
        }
        unsafe { arch::swap(env.transfer.ctx.get(), target.ctx.get()) };
    }
}

/// Blocking poll on a private poller, for callers on the root
fn poll_blocking(fds: &mut [PollFd], timeout_ms: Option<u64>, max_events: usize) -> CoResult<usize> {
    if fds.is_empty() {
        match timeout_ms {
            Some(ms) => std::thread::sleep(std::time::Duration::from_millis(ms)),
            // nothing can wake the thread
            None => loop {
                std::thread::park();
            },
        }
        return Ok(0);
    }

    let mut poller = Poller::new()?;
    for (i, pfd) in fds.iter().enumerate() {
        poller.register(pfd.fd, pfd.events, i as u64)?;
    }
    let mut events = Events::with_capacity(fds.len().min(max_events).max(1))?;
    poller.wait(&mut events, timeout_ms)?;

    for ev in events.iter() {
        if let Some(pfd) = fds.get_mut(ev.tag as usize) {
            let mask = pfd.events | Interest::ERROR | Interest::HANGUP;
            pfd.revents |= Interest::from_bits(ev.interest().bits() & mask.bits()).unwrap_or(Interest::NONE);
        }
    }
    Ok(fds.iter().filter(|p| !p.revents.is_empty()).count())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Rc<Environment> {
        Environment::new(RuntimeConfig::new().max_wait_ms(10)).unwrap()
    }

    #[test]
    fn test_root_is_current() {
        let env = env();
        assert!(env.current_id().is_root());
        assert_eq!(env.call_depth(), 0);
        assert!(!env.is_hooked());
        assert_eq!(env.yield_now(), Err(CoError::NotInCoroutine));
    }

    #[test]
    fn test_resume_yield_finish() {
        let env = env();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (e, l) = (env.clone(), log.clone());
        let co = Coroutine::new(&env, &CoroutineAttr::new(), move || {
            l.borrow_mut().push(1);
            assert_eq!(e.call_depth(), 1);
            e.yield_now().unwrap();
            l.borrow_mut().push(3);
        })
        .unwrap();

        co.resume().unwrap();
        assert_eq!(co.state(), CoroutineState::Suspended);
        log.borrow_mut().push(2);
        co.resume().unwrap();
        assert!(co.is_finished());
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert_eq!(env.call_depth(), 0);
    }

    #[test]
    fn test_resume_finished_rejected() {
        let env = env();
        let co = Coroutine::new(&env, &CoroutineAttr::new(), || {}).unwrap();
        co.resume().unwrap();
        assert_eq!(co.resume(), Err(CoError::Finished));
    }

    #[test]
    fn test_nested_resume() {
        let env = env();
        let trace = Rc::new(RefCell::new(Vec::new()));
        let (e, t) = (env.clone(), trace.clone());
        let outer = Coroutine::new(&env, &CoroutineAttr::new(), move || {
            let (e2, t2) = (e.clone(), t.clone());
            let inner = Coroutine::new(&e, &CoroutineAttr::new(), move || {
                t2.borrow_mut().push(("inner", e2.call_depth()));
                e2.yield_now().unwrap();
                t2.borrow_mut().push(("inner", e2.call_depth()));
            })
            .unwrap();
            inner.resume().unwrap();
            t.borrow_mut().push(("outer", e.call_depth()));
            inner.resume().unwrap();
            assert!(inner.is_finished());
        })
        .unwrap();

        outer.resume().unwrap();
        assert!(outer.is_finished());
        assert_eq!(
            *trace.borrow(),
            vec![("inner", 2), ("outer", 1), ("inner", 2)]
        );
    }

    #[test]
    fn test_call_depth_limit() {
        let env = Environment::new(RuntimeConfig::new().max_call_depth(1)).unwrap();
        let e = env.clone();
        let result = Rc::new(Cell::new(None));
        let r = result.clone();
        let co = Coroutine::new(&env, &CoroutineAttr::new(), move || {
            let inner = Coroutine::new(&e, &CoroutineAttr::new(), || {}).unwrap();
            r.set(Some(inner.resume()));
        })
        .unwrap();
        co.resume().unwrap();
        assert_eq!(result.take(), Some(Err(CoError::CallDepthExceeded(1))));
    }

    #[test]
    fn test_panic_contained() {
        let env = env();
        let co = Coroutine::new(&env, &CoroutineAttr::new(), || panic!("boom")).unwrap();
        assert_eq!(co.resume(), Err(CoError::Panicked));
        assert!(co.is_finished());
        let payload = co.take_panic().unwrap();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
        assert_eq!(co.resume(), Err(CoError::Finished));
    }

    #[test]
    fn test_wrong_environment() {
        let a = env();
        let b = env();
        let co = Coroutine::new(&a, &CoroutineAttr::new(), || {}).unwrap();
        assert_eq!(b.resume(co.cb), Err(CoError::WrongEnvironment));
    }

    #[test]
    fn test_sleep_resumed_by_run_once() {
        let env = env();
        let e = env.clone();
        let co = Coroutine::new(&env, &CoroutineAttr::new(), move || {
            e.sleep_ms(5).unwrap();
        })
        .unwrap();
        co.resume().unwrap();
        assert_eq!(env.waiting(), 1);
        assert_eq!(env.pending_timeouts(), 1);

        env.run_until(|_| co.is_finished()).unwrap();
        assert_eq!(env.waiting(), 0);
        assert_eq!(env.pending_timeouts(), 0);
    }

    #[test]
    fn test_run_once_inside_coroutine_rejected() {
        let env = env();
        let e = env.clone();
        let result = Rc::new(Cell::new(None));
        let r = result.clone();
        let co = Coroutine::new(&env, &CoroutineAttr::new(), move || {
            r.set(Some(e.run_once()));
        })
        .unwrap();
        co.resume().unwrap();
        assert_eq!(result.take(), Some(Err(CoError::NotOnRoot)));
    }

    #[test]
    fn test_drop_parked_coroutine_cancels_wait() {
        let env = env();
        let e = env.clone();
        let co = Coroutine::new(&env, &CoroutineAttr::new(), move || {
            let _ = e.sleep_ms(60_000);
        })
        .unwrap();
        co.resume().unwrap();
        assert_eq!(env.waiting(), 1);
        drop(co);
        assert_eq!(env.waiting(), 0);
        assert_eq!(env.pending_timeouts(), 0);
    }

    #[test]
    fn test_specific_per_coroutine() {
        let env = env();
        env.set_specific(1, 10u32).unwrap();
        let e = env.clone();
        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        let co = Coroutine::new(&env, &CoroutineAttr::new(), move || {
            assert_eq!(e.specific::<u32>(1).unwrap(), None);
            e.set_specific(1, 20u32).unwrap();
            s.set(e.specific::<u32>(1).unwrap());
        })
        .unwrap();
        co.resume().unwrap();
        assert_eq!(seen.get(), Some(20));
        assert_eq!(env.specific::<u32>(1).unwrap(), Some(10));
    }

    #[test]
    fn test_hook_flag_follows_current() {
        let env = env();
        assert_eq!(env.enable_hook(), Err(CoError::NotInCoroutine));
        let e = env.clone();
        let hooked = Rc::new(Cell::new(false));
        let h = hooked.clone();
        let co = Coroutine::new(&env, &CoroutineAttr::new(), move || {
            e.enable_hook().unwrap();
            h.set(e.is_hooked());
        })
        .unwrap();
        co.resume().unwrap();
        assert!(hooked.get());
        assert!(!env.is_hooked());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_registration_rolls_back() {
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let env = env();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let result = Rc::new(RefCell::new(None));

        let (e, r) = (env.clone(), result.clone());
        let co = Coroutine::new(&env, &CoroutineAttr::new(), move || {
            let mut fds = [PollFd::new(fd, Interest::READABLE), PollFd::new(-1, Interest::READABLE)];
            *r.borrow_mut() = Some(e.poll(&mut fds, Some(10)));
        })
        .unwrap();
        co.resume().unwrap();

        assert!(co.is_finished());
        assert!(matches!(*result.borrow(), Some(Err(CoError::Poll(_)))));
        assert_eq!(env.waiting(), 0);
        assert_eq!(env.pending_timeouts(), 0);
        // the first descriptor was released again
        assert!(env.poller.borrow_mut().register(fd, Interest::READABLE, 1).is_ok());
    }

    #[test]
    fn test_root_poll_without_fds_blocks_forever() {
        let returned = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = returned.clone();
        std::thread::spawn(move || {
            let env = Environment::new(RuntimeConfig::new()).unwrap();
            let _ = env.poll(&mut [], None);
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!returned.load(std::sync::atomic::Ordering::SeqCst));
    }
}
