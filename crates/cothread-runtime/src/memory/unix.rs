//! Unix stack mapping using mmap
//!
//! Each block is mapped with one extra PROT_NONE page below `low` so a
//! runaway stack faults instead of scribbling over its neighbour.

use cothread_core::constants::PAGE_SIZE;
use cothread_core::StackError;
use nix::errno::Errno;

pub(super) fn allocate(capacity: usize) -> Result<*mut u8, StackError> {
    let total = capacity + PAGE_SIZE;
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(StackError::AllocationFailed(Errno::last_raw()));
    }

    // Guard page at the low end
    let ret = unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) };
    if ret != 0 {
        let errno = Errno::last_raw();
        unsafe { libc::munmap(base, total) };
        return Err(StackError::ProtectionFailed(errno));
    }

    Ok(unsafe { (base as *mut u8).add(PAGE_SIZE) })
}

pub(super) fn release(low: *mut u8, capacity: usize) {
    if low.is_null() {
        return;
    }
    let base = unsafe { low.sub(PAGE_SIZE) };
    let ret = unsafe { libc::munmap(base as *mut libc::c_void, capacity + PAGE_SIZE) };
    if ret != 0 {
        tracing::warn!(errno = Errno::last_raw(), "munmap of stack block failed");
    }
}
