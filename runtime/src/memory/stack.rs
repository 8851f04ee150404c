// =============================================================================
// ARNm Runtime — Process Stack Allocator
// =============================================================================
//
// Each process gets its own stack from an anonymous private mapping, with
// the lowest page remapped PROT_NONE as a guard. Running off the end of
// the stack then faults deterministically instead of silently corrupting
// whatever the allocator placed below.
//
// LAYOUT (addresses grow upward):
//
//   base ──► ┌───────────────┐
//            │  guard page   │  PROT_NONE
//            ├───────────────┤ ◄── lowest usable byte
//            │               │
//            │  usable stack │  PROT_READ | PROT_WRITE
//            │               │
//            └───────────────┘ ◄── top() (initial stack pointer source)
//
// The requested size is rounded up to page granularity; freeing unmaps the
// whole mapping including the guard page.
// =============================================================================

use std::ptr;
use std::sync::OnceLock;

/// Default per-process stack size: 64 KiB.
///
/// Virtual memory lazy-commits pages, so tens of thousands of processes
/// with 64 KiB virtual stacks are feasible on modern systems.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// The system page size, queried once.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf is always callable; _SC_PAGESIZE never fails on
        // the platforms we target.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 { 4096 } else { sz as usize }
    })
}

/// An owned, guard-paged process stack.
///
/// Dropping the `Stack` unmaps the entire mapping, guard page included.
pub struct Stack {
    /// Mapping base — the guard page itself.
    base: *mut u8,
    /// Total mapping length (guard + usable).
    total: usize,
    /// Usable length (total minus the guard page).
    usable: usize,
}

// SAFETY: the stack moves between threads with its owning process; it is
// only ever used by the thread currently running that process.
unsafe impl Send for Stack {}

impl Stack {
    /// Map a stack with at least `size` usable bytes (rounded up to page
    /// granularity) plus a guard page below.
    pub fn alloc(size: usize) -> Result<Stack, &'static str> {
        let page = page_size();
        let usable = size
            .checked_add(page - 1)
            .ok_or("stack size overflow")?
            & !(page - 1);
        let total = usable.checked_add(page).ok_or("stack size overflow")?;

        // SAFETY: requesting a fresh anonymous private mapping; no existing
        // memory is affected.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err("mmap failed for process stack");
        }

        // SAFETY: `base` is ours and page-aligned; revoking access to the
        // lowest page turns overflow into a fault.
        let rc = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if rc != 0 {
            // SAFETY: unmapping the mapping we just created.
            unsafe { libc::munmap(base, total) };
            return Err("mprotect failed for stack guard page");
        }

        Ok(Stack {
            base: base as *mut u8,
            total,
            usable,
        })
    }

    /// Lowest usable byte (just above the guard page).
    pub fn bottom(&self) -> *mut u8 {
        // SAFETY: base + page is inside our mapping.
        unsafe { self.base.add(self.total - self.usable) }
    }

    /// One past the highest usable byte — where a fresh stack pointer
    /// starts (stacks grow downward).
    pub fn top(&self) -> *mut u8 {
        // SAFETY: one-past-the-end of our mapping is a valid provenance.
        unsafe { self.base.add(self.total) }
    }

    /// Usable size in bytes.
    pub fn usable_size(&self) -> usize {
        self.usable
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: `base`/`total` describe exactly the mapping we created.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_page_granularity() {
        let page = page_size();
        let stack = Stack::alloc(1).unwrap();
        assert_eq!(stack.usable_size(), page);
        let stack = Stack::alloc(page + 1).unwrap();
        assert_eq!(stack.usable_size(), 2 * page);
    }

    #[test]
    fn usable_region_is_writable() {
        let stack = Stack::alloc(DEFAULT_STACK_SIZE).unwrap();
        let bottom = stack.bottom();
        let len = stack.usable_size();
        // Touch first, middle, and last usable bytes.
        unsafe {
            bottom.write(0xAA);
            bottom.add(len / 2).write(0xBB);
            bottom.add(len - 1).write(0xCC);
            assert_eq!(bottom.read(), 0xAA);
            assert_eq!(bottom.add(len - 1).read(), 0xCC);
        }
    }

    #[test]
    fn top_is_page_aligned() {
        let stack = Stack::alloc(DEFAULT_STACK_SIZE).unwrap();
        assert_eq!(stack.top() as usize % page_size(), 0);
        assert_eq!(stack.top() as usize - stack.bottom() as usize, stack.usable_size());
    }
}
