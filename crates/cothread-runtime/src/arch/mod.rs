//! Architecture-specific context switching
//!
//! Every backend exposes the same narrow surface:
//!
//! - [`Context::new`] - zeroed context, no stack assigned (`init`)
//! - [`Context::make`] - prepare a context that starts `entry(arg1, arg2)`
//!   on the given stack
//! - [`swap`] - save the running registers into `from`, load `to`
//! - [`Context::stack_pointer`] - saved stack pointer of a suspended context
//!
//! Everything above this module treats a [`Context`] as opaque.

use std::ffi::c_void;

/// Entry point of a freshly made context. Must never return.
pub type EntryFn = extern "C" fn(arg1: *mut c_void, arg2: *mut c_void);

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        mod windows;
        pub use self::windows::{Context, swap};
    } else if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{Context, swap};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{Context, swap};
    } else {
        compile_error!("Unsupported architecture");
    }
}

/// Highest usable, 16-byte aligned address of a stack `[low, low + size)`
/// after reserving [`STACK_RESERVED`](cothread_core::constants::STACK_RESERVED)
/// bytes at the top.
#[inline]
#[cfg_attr(windows, allow(dead_code))]
pub(crate) fn aligned_top(low: *mut u8, size: usize) -> usize {
    let top = low as usize + size - cothread_core::constants::STACK_RESERVED;
    top & !0xF
}
