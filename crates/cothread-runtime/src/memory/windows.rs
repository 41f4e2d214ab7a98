//! Windows stack reservation
//!
//! Fibers allocate their own stacks, so a block only reserves address space
//! to keep `low`/`high` meaningful for bookkeeping.

use cothread_core::StackError;
use windows_sys::Win32::Foundation::GetLastError;
use windows_sys::Win32::System::Memory::{VirtualAlloc, VirtualFree, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS};

pub(super) fn allocate(capacity: usize) -> Result<*mut u8, StackError> {
    let base = unsafe { VirtualAlloc(std::ptr::null(), capacity, MEM_RESERVE, PAGE_NOACCESS) };
    if base.is_null() {
        return Err(StackError::AllocationFailed(unsafe { GetLastError() } as i32));
    }
    Ok(base as *mut u8)
}

pub(super) fn release(low: *mut u8, _capacity: usize) {
    if low.is_null() {
        return;
    }
    if unsafe { VirtualFree(low as *mut _, 0, MEM_RELEASE) } == 0 {
        tracing::warn!(error = unsafe { GetLastError() }, "VirtualFree of stack block failed");
    }
}
