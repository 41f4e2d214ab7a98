//! Coroutine control block and the owning handle
//!
//! A [`ControlBlock`] is heap-allocated and never moves: its saved
//! [`Context`] is referenced by address from the switch code and by the
//! shared-stack occupancy bookkeeping. [`Coroutine`] is the owning handle
//! that frees it.

use crate::arch::Context;
use crate::environment::Environment;
use crate::memory::{SharedStackPool, StackBlock, StackSpill};
use cothread_core::constants::MAX_SPECIFIC_SLOTS;
use cothread_core::{CoError, CoResult, CoroutineId, CoroutineState};
use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::ffi::c_void;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::rc::Rc;

type EntryBox = Box<dyn FnOnce() + 'static>;

/// Where a coroutine's frames live
pub(crate) enum StackRef {
    /// The thread's own stack (root only)
    Native,
    /// One block owned by this coroutine
    Dedicated(StackBlock),
    /// A pool block, bound on first resume and kept for life
    Shared {
        pool: Rc<SharedStackPool>,
        index: Cell<Option<usize>>,
    },
}

impl StackRef {
    /// The shared block this coroutine is bound to, if any
    pub(crate) fn shared_block(&self) -> Option<(&SharedStackPool, &StackBlock)> {
        match self {
            StackRef::Shared { pool, index } => index.get().map(|i| (&**pool, pool.block(i))),
            _ => None,
        }
    }
}

/// Identity, state and storage of one flow of control
pub(crate) struct ControlBlock {
    pub(crate) id: CoroutineId,
    pub(crate) env: *const Environment,
    entry: Cell<Option<EntryBox>>,
    pub(crate) ctx: UnsafeCell<Context>,
    pub(crate) state: Cell<CoroutineState>,
    pub(crate) is_root: bool,
    pub(crate) hooked: Cell<bool>,
    pub(crate) stack: StackRef,
    pub(crate) spill: StackSpill,
    specific: RefCell<Vec<Option<Box<dyn Any>>>>,
    panic: RefCell<Option<Box<dyn Any + Send>>>,
    /// Set by the entry trampoline, consumed by the resume that observes it
    pub(crate) panic_pending: Cell<bool>,
    /// Id of the wait this coroutine is parked in
    pub(crate) waiter: Cell<Option<u64>>,
}

impl ControlBlock {
    /// Sentinel for the thread's native stack
    pub(crate) fn root(env: *const Environment) -> Self {
        Self::with_stack(CoroutineId::ROOT, env, StackRef::Native, None, true, false)
    }

    fn with_stack(
        id: CoroutineId,
        env: *const Environment,
        stack: StackRef,
        entry: Option<EntryBox>,
        is_root: bool,
        hooked: bool,
    ) -> Self {
        Self {
            id,
            env,
            entry: Cell::new(entry),
            ctx: UnsafeCell::new(Context::new()),
            state: Cell::new(if is_root {
                CoroutineState::Running
            } else {
                CoroutineState::Created
            }),
            is_root,
            hooked: Cell::new(hooked),
            stack,
            spill: StackSpill::new(),
            specific: RefCell::new(Vec::new()),
            panic: RefCell::new(None),
            panic_pending: Cell::new(false),
            waiter: Cell::new(None),
        }
    }

    #[inline]
    pub(crate) fn is_finished(&self) -> bool {
        self.state.get().is_finished()
    }

    /// Stack range handed to `Context::make`, binding a shared block if
    /// this is the first resume.
    pub(crate) fn bind_stack(&self) -> Option<(*mut u8, usize)> {
        match &self.stack {
            StackRef::Native => None,
            StackRef::Dedicated(block) => Some((block.low(), block.capacity())),
            StackRef::Shared { pool, index } => {
                let i = match index.get() {
                    Some(i) => i,
                    None => {
                        let i = pool.next_block();
                        index.set(Some(i));
                        tracing::trace!(id = %self.id, block = i, "bound shared stack block");
                        i
                    }
                };
                let block = pool.block(i);
                Some((block.low(), block.capacity()))
            }
        }
    }

    /// Drop this coroutine's claim on its shared block
    pub(crate) fn release_block(&self) {
        if let Some((_, block)) = self.stack.shared_block() {
            if block.occupant() == Some(NonNull::from(self)) {
                block.set_occupant(None);
            }
        }
    }

    fn check_key(key: usize) -> CoResult<()> {
        if key >= MAX_SPECIFIC_SLOTS {
            return Err(CoError::SlotOutOfRange(key));
        }
        Ok(())
    }

    pub(crate) fn set_specific(&self, key: usize, value: Box<dyn Any>) -> CoResult<()> {
        Self::check_key(key)?;
        let mut slots = self.specific.borrow_mut();
        if slots.len() <= key {
            slots.resize_with(key + 1, || None);
        }
        slots[key] = Some(value);
        Ok(())
    }

    pub(crate) fn specific<T: Any + Clone>(&self, key: usize) -> CoResult<Option<T>> {
        Self::check_key(key)?;
        let slots = self.specific.borrow();
        Ok(slots
            .get(key)
            .and_then(|s| s.as_ref())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned())
    }

    pub(crate) fn take_specific<T: Any>(&self, key: usize) -> CoResult<Option<T>> {
        Self::check_key(key)?;
        let mut slots = self.specific.borrow_mut();
        let Some(slot) = slots.get_mut(key) else {
            return Ok(None);
        };
        match slot.take().map(|v| v.downcast::<T>()) {
            Some(Ok(v)) => Ok(Some(*v)),
            Some(Err(v)) => {
                // wrong type requested; leave the value in place
                *slot = Some(v);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// First function run on a coroutine's stack
///
/// `arg1` is the control block, `arg2` the owning environment.
pub(crate) extern "C" fn coroutine_main(arg1: *mut c_void, arg2: *mut c_void) {
    // SAFETY: both pointers were supplied by `Environment::resume`, and
    // the environment keeps them alive while the coroutine runs.
    let cb = unsafe { &*(arg1 as *const ControlBlock) };
    let env = unsafe { &*(arg2 as *const Environment) };

    if let Some(entry) = cb.entry.take() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
            tracing::warn!(id = %cb.id, "coroutine panicked");
            *cb.panic.borrow_mut() = Some(payload);
            cb.panic_pending.set(true);
        }
    }

    env.finish_current(NonNull::from(cb));
    // a finished coroutine is never switched back into
    std::process::abort();
}

/// Options for [`Coroutine::new`]
#[derive(Clone, Default)]
pub struct CoroutineAttr {
    /// Dedicated stack size; environment default when `None`
    pub stack_size: Option<usize>,
    /// Run on this shared pool instead of a dedicated stack
    pub share_stack: Option<Rc<SharedStackPool>>,
}

impl CoroutineAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn share_stack(mut self, pool: Rc<SharedStackPool>) -> Self {
        self.share_stack = Some(pool);
        self
    }
}

impl fmt::Debug for CoroutineAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineAttr")
            .field("stack_size", &self.stack_size)
            .field("share_stack", &self.share_stack.is_some())
            .finish()
    }
}

/// Owning handle to a coroutine
///
/// Dropping a suspended coroutine cancels any wait it is parked in and
/// frees its stack; values still alive on that stack are leaked.
pub struct Coroutine {
    env: Rc<Environment>,
    pub(crate) cb: NonNull<ControlBlock>,
}

impl Coroutine {
    /// Create a coroutine in `env` that runs `f` when first resumed.
    pub fn new<F>(env: &Rc<Environment>, attr: &CoroutineAttr, f: F) -> CoResult<Coroutine>
    where
        F: FnOnce() + 'static,
    {
        let stack = match (&attr.share_stack, attr.stack_size, env.default_pool()) {
            (Some(pool), _, _) => StackRef::Shared {
                pool: pool.clone(),
                index: Cell::new(None),
            },
            (None, None, Some(pool)) => StackRef::Shared {
                pool,
                index: Cell::new(None),
            },
            (None, size, _) => {
                StackRef::Dedicated(StackBlock::new(size.unwrap_or(env.config().stack_size))?)
            }
        };

        let id = CoroutineId::next();
        let cb = Box::new(ControlBlock::with_stack(
            id,
            Rc::as_ptr(env),
            stack,
            Some(Box::new(f)),
            false,
            env.config().enable_hook,
        ));
        tracing::debug!(%id, "coroutine created");

        Ok(Coroutine {
            env: env.clone(),
            cb: NonNull::from(Box::leak(cb)),
        })
    }

    #[inline]
    fn cb(&self) -> &ControlBlock {
        // SAFETY: the block lives until this handle is dropped
        unsafe { self.cb.as_ref() }
    }

    /// Switch into this coroutine until it yields or finishes.
    pub fn resume(&self) -> CoResult<()> {
        self.env.resume(self.cb)
    }

    #[inline]
    pub fn id(&self) -> CoroutineId {
        self.cb().id
    }

    #[inline]
    pub fn state(&self) -> CoroutineState {
        self.cb().state.get()
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.cb().is_finished()
    }

    /// Environment this coroutine belongs to
    pub fn env(&self) -> &Rc<Environment> {
        &self.env
    }

    /// Payload of a panic raised by the body, once
    pub fn take_panic(&self) -> Option<Box<dyn Any + Send>> {
        self.cb().panic.borrow_mut().take()
    }

    pub fn enable_hook(&self) {
        self.cb().hooked.set(true);
    }

    pub fn disable_hook(&self) {
        self.cb().hooked.set(false);
    }

    pub fn is_hooked(&self) -> bool {
        self.cb().hooked.get()
    }

    /// Store `value` in slot `key` of this coroutine
    pub fn set_specific<T: Any>(&self, key: usize, value: T) -> CoResult<()> {
        self.cb().set_specific(key, Box::new(value))
    }

    /// Clone of the value in slot `key`, if present and of type `T`
    pub fn specific<T: Any + Clone>(&self, key: usize) -> CoResult<Option<T>> {
        self.cb().specific(key)
    }

    /// Remove and return the value in slot `key`, if present and of type `T`
    pub fn take_specific<T: Any>(&self, key: usize) -> CoResult<Option<T>> {
        self.cb().take_specific(key)
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        let cb = self.cb();
        if cb.state.get() == CoroutineState::Running {
            tracing::warn!(id = %cb.id, "dropping a running coroutine; leaking its control block");
            return;
        }
        if let Some(wid) = cb.waiter.take() {
            self.env.cancel_waiter(wid);
        }
        cb.release_block();
        tracing::debug!(id = %cb.id, state = %cb.state.get(), "coroutine dropped");
        // SAFETY: allocated by Box in `new`, not referenced by the
        // environment once off the call stack and out of every wait
        drop(unsafe { Box::from_raw(self.cb.as_ptr()) });
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
