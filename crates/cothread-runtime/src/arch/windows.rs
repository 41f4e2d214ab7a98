//! Windows context switching on top of fibers
//!
//! A fiber owns its own stack, so `make` only uses the requested size. The
//! thread is converted to a fiber lazily the first time it swaps out.

use super::EntryFn;
use std::cell::Cell;
use std::ffi::c_void;
use std::ptr;
use windows_sys::Win32::System::Threading::{
    ConvertThreadToFiber, CreateFiber, DeleteFiber, SwitchToFiber,
};

thread_local! {
    static THREAD_FIBER: Cell<*mut c_void> = const { Cell::new(ptr::null_mut()) };
}

fn thread_fiber() -> *mut c_void {
    THREAD_FIBER.with(|f| {
        if f.get().is_null() {
            let fiber = unsafe { ConvertThreadToFiber(ptr::null()) };
            if fiber.is_null() {
                tracing::error!("ConvertThreadToFiber failed");
                std::process::abort();
            }
            f.set(fiber);
        }
        f.get()
    })
}

/// A fiber handle plus the entry point it starts with
#[derive(Debug)]
pub struct Context {
    fiber: *mut c_void,
    owned: bool,
    entry: Option<EntryFn>,
    arg1: *mut c_void,
    arg2: *mut c_void,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub const fn new() -> Self {
        Self {
            fiber: ptr::null_mut(),
            owned: false,
            entry: None,
            arg1: ptr::null_mut(),
            arg2: ptr::null_mut(),
        }
    }

    /// Create a fiber that runs `entry(arg1, arg2)`.
    ///
    /// # Safety
    ///
    /// `self` must not move while the fiber is alive; the fiber start
    /// routine reads the entry point through this address.
    pub unsafe fn make(
        &mut self,
        _stack_low: *mut u8,
        stack_size: usize,
        entry: EntryFn,
        arg1: *mut c_void,
        arg2: *mut c_void,
    ) {
        self.release();
        self.entry = Some(entry);
        self.arg1 = arg1;
        self.arg2 = arg2;
        self.fiber = CreateFiber(
            stack_size,
            Some(fiber_start),
            self as *mut Context as *const c_void,
        );
        if self.fiber.is_null() {
            tracing::error!(stack_size, "CreateFiber failed");
            std::process::abort();
        }
        self.owned = true;
    }

    #[inline]
    pub fn is_made(&self) -> bool {
        !self.fiber.is_null()
    }

    /// Fibers keep their stack pointer private
    #[inline]
    pub fn stack_pointer(&self) -> *mut u8 {
        ptr::null_mut()
    }

    fn release(&mut self) {
        if self.owned && !self.fiber.is_null() {
            unsafe { DeleteFiber(self.fiber) };
        }
        self.fiber = ptr::null_mut();
        self.owned = false;
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.release();
    }
}

unsafe extern "system" fn fiber_start(param: *mut c_void) {
    let ctx = &*(param as *const Context);
    if let Some(entry) = ctx.entry {
        entry(ctx.arg1, ctx.arg2);
    }
    // entry functions never return
    std::process::abort();
}

/// Switch from the running fiber to `to`.
///
/// # Safety
///
/// `to` must hold a live fiber created by `make` or captured by an earlier
/// `swap`.
pub unsafe fn swap(from: *mut Context, to: *const Context) {
    let from = &mut *from;
    if from.fiber.is_null() {
        from.fiber = thread_fiber();
    }
    SwitchToFiber((*to).fiber);
}
