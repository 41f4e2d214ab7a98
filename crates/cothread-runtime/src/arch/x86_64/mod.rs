//! x86_64 (System V) context switching
//!
//! Saves only what the ABI requires a callee to preserve: rsp, the resume
//! address, rbx, rbp, r12-r15, the MXCSR control bits and the x87 control
//! word. Caller-saved state is already spilled by the compiler around the
//! `swap` call.

use super::{aligned_top, EntryFn};
use std::arch::naked_asm;
use std::ffi::c_void;

/// Default MXCSR: all exceptions masked, round-to-nearest
const MXCSR_DEFAULT: u32 = 0x1F80;

/// Default x87 control word: all exceptions masked, 64-bit precision
const FPUCW_DEFAULT: u16 = 0x037F;

/// Saved register state of a suspended flow of control
///
/// Layout (offsets used by the assembly below):
/// ```text
/// 0x00: rsp     0x08: rip     0x10: rbx     0x18: rbp
/// 0x20: r12     0x28: r13     0x30: r14     0x38: r15
/// 0x40: mxcsr (u32)           0x44: x87 cw (u16)
/// ```
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    rsp: u64,
    rip: u64,
    rbx: u64,
    rbp: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    mxcsr: u32,
    fpucw: u16,
    _pad: u16,
}

const _: () = {
    assert!(core::mem::size_of::<Context>() == 0x48);
};

impl Context {
    /// Zeroed context with no stack assigned
    pub const fn new() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: 0,
            fpucw: 0,
            _pad: 0,
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
        // 16-byte aligned at the trampoline's `call`, so the entry function
        // sees the usual rsp % 16 == 8 on its first instruction.
        let sp = aligned_top(stack_low, stack_size);

        *self = Self::new();
        self.rsp = sp as u64;
        self.rip = entry_trampoline as usize as u64;
        self.r12 = entry as usize as u64;
        self.r13 = arg1 as u64;
        self.r14 = arg2 as u64;
        self.mxcsr = MXCSR_DEFAULT;
        self.fpucw = FPUCW_DEFAULT;
    }

    /// Whether `make` (or a previous `swap` out of it) filled this context
    #[inline]
    pub fn is_made(&self) -> bool {
        self.rip != 0
    }

    /// Saved stack pointer. Only meaningful while the context is suspended.
    #[inline]
    pub fn stack_pointer(&self) -> *mut u8 {
        self.rsp as *mut u8
    }
}

/// First code run on a fresh stack: `entry(r13, r14)`
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "xor ebp, ebp",
        "mov rdi, r13",
        "mov rsi, r14",
        "call r12",
        // entry functions never return
        "ud2",
    );
}

/// Save the running state into `from` and resume `to`.
///
/// Returns only when some other context later swaps back into `from`.
///
/// # Safety
///
/// `to` must have been made or previously saved by `swap`, and its stack
/// must still hold that context's frames.
#[unsafe(naked)]
pub unsafe extern "C" fn swap(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        // Save callee-saved state to `from` (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr [rdi + 0x40]",
        "fnstcw [rdi + 0x44]",
        // Load callee-saved state from `to` (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "ldmxcsr [rsi + 0x40]",
        "fldcw [rsi + 0x44]",
        "jmp rax",
        // Resume point of a saved context: rsp points at our return address
        "2:",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn never(_: *mut c_void, _: *mut c_void) {}

    #[test]
    fn test_context_offsets() {
        let ctx = Context::new();
        let base = &ctx as *const _ as usize;
        assert_eq!(&ctx.rip as *const _ as usize - base, 0x08);
        assert_eq!(&ctx.r15 as *const _ as usize - base, 0x38);
        assert_eq!(&ctx.mxcsr as *const _ as usize - base, 0x40);
        assert_eq!(&ctx.fpucw as *const _ as usize - base, 0x44);
    }

    #[test]
    fn test_make_sets_aligned_stack() {
        let mut stack = vec![0u8; 8192];
        let mut ctx = Context::new();
        assert!(!ctx.is_made());
        unsafe {
            ctx.make(
                stack.as_mut_ptr(),
                stack.len(),
                never,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            );
        }
        assert!(ctx.is_made());
        assert_eq!(ctx.rsp % 16, 0);
        assert!((ctx.rsp as usize) < stack.as_ptr() as usize + stack.len());
        assert_eq!(ctx.mxcsr, MXCSR_DEFAULT);
    }
}
