//! Stack memory for coroutines
//!
//! Two modes:
//! - dedicated: one [`StackBlock`] per coroutine, freed with it
//! - shared: a [`SharedStackPool`] of blocks handed out round-robin; a
//!   coroutine displaced from its block keeps its live bytes in a
//!   [`StackSpill`] until it is switched back in
//!
//! Platform code only maps and unmaps memory (`allocate`, `release`).

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use self::unix::{allocate, release};
    } else if #[cfg(windows)] {
        mod windows;
        use self::windows::{allocate, release};
    }
}

use crate::coroutine::ControlBlock;
use cothread_core::constants::MAX_STACK_SIZE;
use cothread_core::{page_round_up, StackError};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ptr::NonNull;

/// A contiguous stack region `[low, high)`
pub struct StackBlock {
    low: *mut u8,
    capacity: usize,
    /// Coroutine whose frames are currently loaded in this block
    occupant: Cell<Option<NonNull<ControlBlock>>>,
}

impl StackBlock {
    /// Map a new block of at least `size` usable bytes
    pub fn new(size: usize) -> Result<Self, StackError> {
        if size == 0 {
            return Err(StackError::InvalidSize);
        }
        let capacity = page_round_up(size.min(MAX_STACK_SIZE));
        let low = allocate(capacity)?;
        Ok(Self {
            low,
            capacity,
            occupant: Cell::new(None),
        })
    }

    /// Lowest usable address
    #[inline]
    pub fn low(&self) -> *mut u8 {
        self.low
    }

    /// One past the highest usable address
    #[inline]
    pub fn high(&self) -> *mut u8 {
        self.low.wrapping_add(self.capacity)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn occupant(&self) -> Option<NonNull<ControlBlock>> {
        self.occupant.get()
    }

    #[inline]
    pub(crate) fn set_occupant(&self, cb: Option<NonNull<ControlBlock>>) {
        self.occupant.set(cb);
    }

    /// Whether `addr` lies inside this block
    #[inline]
    pub fn contains(&self, addr: *const u8) -> bool {
        let a = addr as usize;
        a >= self.low as usize && a < self.high() as usize
    }

    /// Copy the live extent `[sp, high)` into `spill`. Returns bytes copied.
    ///
    /// # Safety
    ///
    /// Nothing may be executing on this block while it is copied.
    pub(crate) unsafe fn save(&self, spill: &StackSpill, sp: *const u8) -> usize {
        if !self.contains(sp) {
            return 0;
        }
        let len = self.high() as usize - sp as usize;
        let src = std::slice::from_raw_parts(sp, len);
        let mut buf = spill.buf.borrow_mut();
        buf.clear();
        buf.extend_from_slice(src);
        len
    }

    /// Copy a previously saved extent back to the same offset from `high`
    /// and empty the spill. Returns bytes copied.
    ///
    /// # Safety
    ///
    /// Nothing may be executing on this block while it is overwritten.
    pub(crate) unsafe fn restore(&self, spill: &StackSpill) -> usize {
        let mut buf = spill.buf.borrow_mut();
        let len = buf.len().min(self.capacity);
        if len == 0 {
            return 0;
        }
        let dst = self.high().sub(len);
        std::ptr::copy_nonoverlapping(buf.as_ptr(), dst, len);
        buf.clear();
        len
    }
}

impl Drop for StackBlock {
    fn drop(&mut self) {
        release(self.low, self.capacity);
    }
}

impl fmt::Debug for StackBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackBlock")
            .field("low", &self.low)
            .field("capacity", &self.capacity)
            .field("occupied", &self.occupant.get().is_some())
            .finish()
    }
}

/// Per-coroutine save area for shared-stack mode
#[derive(Debug, Default)]
pub struct StackSpill {
    buf: RefCell<Vec<u8>>,
}

impl StackSpill {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently held
    pub fn len(&self) -> usize {
        self.buf.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Copy counters of a [`SharedStackPool`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Occupants saved out of a block
    pub copy_outs: u64,
    /// Spills restored into a block
    pub copy_ins: u64,
    /// Total bytes moved in either direction
    pub bytes_copied: u64,
}

/// A fixed set of stack blocks shared by many coroutines
///
/// Not thread-safe. Sharing one pool across threads is the embedder's
/// responsibility.
pub struct SharedStackPool {
    blocks: Vec<StackBlock>,
    alloc_idx: Cell<usize>,
    stats: Cell<PoolStats>,
}

impl SharedStackPool {
    /// Create `count` blocks of `size` bytes each
    pub fn new(count: usize, size: usize) -> Result<Self, StackError> {
        if count == 0 {
            return Err(StackError::EmptyPool);
        }
        if size == 0 {
            return Err(StackError::InvalidSize);
        }
        if cfg!(windows) {
            return Err(StackError::Unsupported);
        }
        let blocks = (0..count)
            .map(|_| StackBlock::new(size))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(count, size, "shared stack pool created");
        Ok(Self {
            blocks,
            alloc_idx: Cell::new(0),
            stats: Cell::new(PoolStats::default()),
        })
    }

    /// Number of blocks
    #[inline]
    pub fn count(&self) -> usize {
        self.blocks.len()
    }

    /// Per-block capacity
    #[inline]
    pub fn block_size(&self) -> usize {
        self.blocks[0].capacity()
    }

    /// Index of the next block in round-robin order
    pub fn next_block(&self) -> usize {
        let idx = self.alloc_idx.get();
        self.alloc_idx.set((idx + 1) % self.blocks.len());
        idx
    }

    #[inline]
    pub fn block(&self, index: usize) -> &StackBlock {
        &self.blocks[index]
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.get()
    }

    pub(crate) fn record_copy_out(&self, bytes: usize) {
        let mut s = self.stats.get();
        s.copy_outs += 1;
        s.bytes_copied += bytes as u64;
        self.stats.set(s);
    }

    pub(crate) fn record_copy_in(&self, bytes: usize) {
        let mut s = self.stats.get();
        s.copy_ins += 1;
        s.bytes_copied += bytes as u64;
        self.stats.set(s);
    }
}

impl fmt::Debug for SharedStackPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStackPool")
            .field("count", &self.blocks.len())
            .field("alloc_idx", &self.alloc_idx.get())
            .field("stats", &self.stats.get())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use cothread_core::constants::PAGE_SIZE;

    #[test]
    fn test_block_rounds_to_page() {
        let block = StackBlock::new(1000).unwrap();
        assert_eq!(block.capacity(), PAGE_SIZE);
        assert_eq!(block.high() as usize - block.low() as usize, PAGE_SIZE);
        assert!(block.occupant().is_none());
    }

    #[test]
    fn test_block_rejects_zero() {
        assert_eq!(StackBlock::new(0).unwrap_err(), StackError::InvalidSize);
    }

    #[test]
    fn test_block_clamps_huge_size() {
        let block = StackBlock::new(usize::MAX).unwrap();
        assert_eq!(block.capacity(), MAX_STACK_SIZE);
        let block = StackBlock::new(usize::MAX - 10).unwrap();
        assert_eq!(block.capacity(), MAX_STACK_SIZE);

        let pool = SharedStackPool::new(1, usize::MAX).unwrap();
        assert_eq!(pool.block_size(), MAX_STACK_SIZE);
    }

    #[test]
    fn test_block_is_writable() {
        let block = StackBlock::new(16 * 1024).unwrap();
        unsafe {
            std::ptr::write_bytes(block.low(), 0x5A, block.capacity());
            assert_eq!(*block.high().sub(1), 0x5A);
        }
    }

    #[test]
    fn test_save_restore_same_offset() {
        let block = StackBlock::new(8192).unwrap();
        let spill = StackSpill::new();
        unsafe {
            let sp = block.high().sub(100);
            for i in 0..100 {
                *sp.add(i) = i as u8;
            }
            assert_eq!(block.save(&spill, sp), 100);
            assert_eq!(spill.len(), 100);

            std::ptr::write_bytes(sp, 0xFF, 100);
            assert_eq!(block.restore(&spill), 100);
            for i in 0..100 {
                assert_eq!(*sp.add(i), i as u8);
            }
        }
        assert!(spill.is_empty());
    }

    #[test]
    fn test_save_ignores_foreign_sp() {
        let block = StackBlock::new(4096).unwrap();
        let spill = StackSpill::new();
        let local = 0u8;
        assert_eq!(unsafe { block.save(&spill, &local) }, 0);
    }

    #[test]
    fn test_pool_round_robin() {
        let pool = SharedStackPool::new(3, 4096).unwrap();
        let picks: Vec<_> = (0..7).map(|_| pool.next_block()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_pool_rejects_bad_config() {
        assert_eq!(SharedStackPool::new(0, 4096).unwrap_err(), StackError::EmptyPool);
        assert_eq!(SharedStackPool::new(2, 0).unwrap_err(), StackError::InvalidSize);
    }

    #[test]
    fn test_pool_stats() {
        let pool = SharedStackPool::new(1, 4096).unwrap();
        pool.record_copy_out(64);
        pool.record_copy_in(64);
        let stats = pool.stats();
        assert_eq!(stats.copy_outs, 1);
        assert_eq!(stats.copy_ins, 1);
        assert_eq!(stats.bytes_copied, 128);
    }
}
