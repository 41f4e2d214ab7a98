//! aarch64 (AAPCS64) context switching
//!
//! Callee-saved set: sp, x19-x28, fp (x29), lr (x30) and the low halves of
//! v8-v15 (d8-d15).

use super::{aligned_top, EntryFn};
use std::arch::naked_asm;
use std::ffi::c_void;

/// Saved register state of a suspended flow of control
///
/// Layout:
/// ```text
/// 0x00: sp   0x08: lr   0x10: fp
/// 0x18: x19 .. 0x60: x28
/// 0x68: d8  .. 0xa0: d15
/// ```
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    sp: u64,
    lr: u64,
    fp: u64,
    x: [u64; 10],
    d: [u64; 8],
}

const _: () = {
    assert!(core::mem::size_of::<Context>() == 0xa8);
};

impl Context {
    /// Zeroed context with no stack assigned
    pub const fn new() -> Self {
        Self {
            sp: 0,
            lr: 0,
            fp: 0,
            x: [0; 10],
            d: [0; 8],
        }
    }

    /// Prepare this context so that switching into it runs
    /// `entry(arg1, arg2)` on the stack `[stack_low, stack_low + stack_size)`.
    ///
    /// # Safety
    ///
    /// The stack must stay valid and unused by anything else for as long as
    /// the context is live.
    pub unsafe fn make(
        &mut self,
        stack_low: *mut u8,
        stack_size: usize,
        entry: EntryFn,
        arg1: *mut c_void,
        arg2: *mut c_void,
    ) {
        let sp = aligned_top(stack_low, stack_size);

        *self = Self::new();
        self.sp = sp as u64;
        self.lr = entry_trampoline as usize as u64;
        self.x[0] = entry as usize as u64; // x19
        self.x[1] = arg1 as u64; // x20
        self.x[2] = arg2 as u64; // x21
    }

    /// Whether `make` (or a previous `swap` out of it) filled this context
    #[inline]
    pub fn is_made(&self) -> bool {
        self.lr != 0
    }

    /// Saved stack pointer. Only meaningful while the context is suspended.
    #[inline]
    pub fn stack_pointer(&self) -> *mut u8 {
        self.sp as *mut u8
    }
}

/// First code run on a fresh stack: `entry(x20, x21)`
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov x29, xzr",
        "mov x0, x20",
        "mov x1, x21",
        "blr x19",
        // entry functions never return
        "brk #0x1",
    );
}

/// Save the running state into `from` and resume `to`.
///
/// # Safety
///
/// `to` must have been made or previously saved by `swap`, and its stack
/// must still hold that context's frames.
#[unsafe(naked)]
pub unsafe extern "C" fn swap(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        // Save callee-saved state to `from` (x0)
        "mov x9, sp",
        "str x9,       [x0, #0x00]",
        "stp x30, x29, [x0, #0x08]",
        "stp x19, x20, [x0, #0x18]",
        "stp x21, x22, [x0, #0x28]",
        "stp x23, x24, [x0, #0x38]",
        "stp x25, x26, [x0, #0x48]",
        "stp x27, x28, [x0, #0x58]",
        "stp d8,  d9,  [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load callee-saved state from `to` (x1)
        "ldr x9,       [x1, #0x00]",
        "mov sp, x9",
        "ldp x30, x29, [x1, #0x08]",
        "ldp x19, x20, [x1, #0x18]",
        "ldp x21, x22, [x1, #0x28]",
        "ldp x23, x24, [x1, #0x38]",
        "ldp x25, x26, [x1, #0x48]",
        "ldp x27, x28, [x1, #0x58]",
        "ldp d8,  d9,  [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}
