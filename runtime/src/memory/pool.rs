// =============================================================================
// ARNm Runtime — Small-Block Pool
// =============================================================================
//
// A free list of uniform blocks with no synchronization. Each OS thread
// owns its own pool (see task/mailbox.rs), so alloc/free never contend:
// blocks are freed into the pool of the thread that releases them and may
// migrate between pools over their lifetime, but any single pool is only
// ever touched by its owning thread.
//
// The free list is intrusive — a freed block's first word links to the
// next free block — so the pool itself needs no storage beyond a head
// pointer and a length. A retention cap bounds how many blocks a pool
// keeps; past the cap, frees go straight back to the global allocator.
// =============================================================================

use std::alloc::{self, Layout};

/// Intrusive free-list link written into the first word of a freed block.
struct FreeBlock {
    next: *mut FreeBlock,
}

/// A fixed-block free-list allocator. Not thread-safe; owned per thread.
pub struct BlockPool {
    layout: Layout,
    free: *mut FreeBlock,
    /// Blocks currently held on the free list.
    len: usize,
    /// Retention cap — frees beyond this go to the global allocator.
    cap: usize,
}

impl BlockPool {
    /// Create a pool of blocks of (at least) `size` bytes aligned to
    /// (at least) `align`, retaining up to `cap` free blocks.
    pub fn new(size: usize, align: usize, cap: usize) -> Self {
        // A freed block stores the free-list link in its own bytes.
        let size = size.max(size_of::<FreeBlock>());
        let align = align.max(align_of::<FreeBlock>());
        let layout = Layout::from_size_align(size, align).expect("pool block layout");
        BlockPool {
            layout,
            free: std::ptr::null_mut(),
            len: 0,
            cap,
        }
    }

    /// Pop a block from the free list, or fall back to the global
    /// allocator. Returns null on allocation failure.
    pub fn alloc(&mut self) -> *mut u8 {
        if !self.free.is_null() {
            let block = self.free;
            // SAFETY: every pointer on the free list was written by
            // `free()` below and is exclusively ours.
            self.free = unsafe { (*block).next };
            self.len -= 1;
            return block as *mut u8;
        }
        // SAFETY: layout has nonzero size by construction.
        unsafe { alloc::alloc(self.layout) }
    }

    /// Return a block to the pool (or to the global allocator when the
    /// pool is at its retention cap).
    ///
    /// # Safety
    /// `ptr` must come from `alloc()` of a pool with this block layout and
    /// must not be used again.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if self.len >= self.cap {
            // SAFETY: same layout the block was allocated with.
            unsafe { alloc::dealloc(ptr, self.layout) };
            return;
        }
        let block = ptr as *mut FreeBlock;
        // SAFETY: the block is dead storage of at least FreeBlock's size.
        unsafe { (*block).next = self.free };
        self.free = block;
        self.len += 1;
    }

    /// Number of blocks currently retained on the free list.
    pub fn retained(&self) -> usize {
        self.len
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        let mut block = self.free;
        while !block.is_null() {
            // SAFETY: walking links we wrote; each block came from the
            // global allocator with `self.layout`.
            unsafe {
                let next = (*block).next;
                alloc::dealloc(block as *mut u8, self.layout);
                block = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freed_block_is_reused() {
        let mut pool = BlockPool::new(48, 8, 16);
        let a = pool.alloc();
        assert!(!a.is_null());
        unsafe { pool.free(a) };
        assert_eq!(pool.retained(), 1);
        let b = pool.alloc();
        assert_eq!(a, b, "free list should hand back the same block");
        assert_eq!(pool.retained(), 0);
        unsafe { pool.free(b) };
    }

    #[test]
    fn retention_cap_is_honored() {
        let mut pool = BlockPool::new(32, 8, 2);
        let blocks: Vec<_> = (0..4).map(|_| pool.alloc()).collect();
        for b in blocks {
            unsafe { pool.free(b) };
        }
        assert_eq!(pool.retained(), 2);
    }

    #[test]
    fn tiny_blocks_still_fit_the_link() {
        // Requesting less than a pointer's worth must not corrupt the list.
        let mut pool = BlockPool::new(1, 1, 8);
        let a = pool.alloc();
        let b = pool.alloc();
        unsafe {
            pool.free(a);
            pool.free(b);
        }
        assert_eq!(pool.retained(), 2);
        let _ = pool.alloc();
        let _ = pool.alloc();
    }
}
