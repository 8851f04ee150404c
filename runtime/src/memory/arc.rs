// =============================================================================
// ARNm Runtime — Atomic Reference Counting
// =============================================================================
//
// Every heap object compiled ARNm code allocates is prefixed by a header:
//
//   ┌────────────┬────────────┬──────┬─────────────────────────┐
//   │ refcount   │ destructor │ size │ object bytes (zeroed)…  │
//   └────────────┴────────────┴──────┴─────────────────────────┘
//                                    ▲
//                                    └── the pointer handed out
//
// The header sits immediately before the returned pointer, so retain and
// release recover it with constant pointer arithmetic. The refcount starts
// at 1; the 1→0 release runs the destructor (if any) and frees the whole
// allocation.
//
// ORDERING: every decrement is a release so prior writes to the object are
// published; the final decrement issues an acquire fence so the destructor
// observes them all.
// =============================================================================

use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Destructor hook invoked on the final release, with the object pointer.
pub type Destructor = Option<extern "C" fn(*mut c_void)>;

/// The header placed immediately before every ARC object.
///
/// `align(16)` keeps the object pointer 16-byte aligned for any payload
/// type the compiler emits.
#[repr(C, align(16))]
struct Header {
    refcount: AtomicU64,
    destructor: Destructor,
    size: usize,
}

const HEADER_SIZE: usize = size_of::<Header>();

fn object_layout(size: usize) -> Option<Layout> {
    let total = HEADER_SIZE.checked_add(size)?;
    Layout::from_size_align(total, align_of::<Header>()).ok()
}

/// Recover the header from an object pointer.
///
/// # Safety
/// `obj` must have been returned by [`arc_alloc`] and not yet freed.
unsafe fn header_of(obj: *const u8) -> *mut Header {
    unsafe { obj.sub(HEADER_SIZE) as *mut Header }
}

/// Allocate a zeroed object of `size` bytes with refcount 1.
///
/// Returns null on allocation failure or size overflow; no partial state
/// is left behind.
pub fn arc_alloc(size: usize, destructor: Destructor) -> *mut u8 {
    let Some(layout) = object_layout(size) else {
        return std::ptr::null_mut();
    };
    // SAFETY: layout has nonzero size (the header alone is 32 bytes).
    let base = unsafe { alloc::alloc_zeroed(layout) };
    if base.is_null() {
        return std::ptr::null_mut();
    }
    let header = base as *mut Header;
    // SAFETY: `base` is a fresh, properly aligned allocation.
    unsafe {
        header.write(Header {
            refcount: AtomicU64::new(1),
            destructor,
            size,
        });
        base.add(HEADER_SIZE)
    }
}

/// Increment the reference count.
///
/// # Safety
/// `obj` must be a live pointer from [`arc_alloc`].
pub unsafe fn arc_retain(obj: *mut u8) {
    // Relaxed suffices: a retain can only happen through an existing
    // reference, which already keeps the object alive.
    unsafe {
        (*header_of(obj)).refcount.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decrement the reference count; on the 1→0 transition run the destructor
/// and free the allocation.
///
/// # Safety
/// `obj` must be a live pointer from [`arc_alloc`]. After this call the
/// caller's reference is gone.
pub unsafe fn arc_release(obj: *mut u8) {
    let header = unsafe { header_of(obj) };
    // Release publishes this owner's writes before the count drops.
    let prev = unsafe { (*header).refcount.fetch_sub(1, Ordering::Release) };
    if prev != 1 {
        return;
    }
    // Acquire pairs with every other owner's release decrement, so the
    // destructor sees all prior writes to the object.
    fence(Ordering::Acquire);

    let (destructor, size) = unsafe { ((*header).destructor, (*header).size) };
    if let Some(dtor) = destructor {
        dtor(obj as *mut c_void);
    }
    // The layout that produced a live object always round-trips.
    let layout = object_layout(size).expect("arc header layout");
    // SAFETY: freeing the exact allocation created in arc_alloc.
    unsafe { alloc::dealloc(header as *mut u8, layout) };
}

/// Current reference count.
///
/// # Safety
/// `obj` must be a live pointer from [`arc_alloc`].
pub unsafe fn arc_refcount(obj: *const u8) -> u64 {
    unsafe { (*header_of(obj)).refcount.load(Ordering::Relaxed) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn count_drop(_obj: *mut c_void) {
        DROPS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn alloc_is_zeroed_and_aligned() {
        let obj = arc_alloc(64, None);
        assert!(!obj.is_null());
        assert_eq!(obj as usize % 16, 0);
        unsafe {
            for i in 0..64 {
                assert_eq!(obj.add(i).read(), 0);
            }
            assert_eq!(arc_refcount(obj), 1);
            arc_release(obj);
        }
    }

    #[test]
    fn retain_release_preserves_object() {
        let obj = arc_alloc(8, None);
        unsafe {
            obj.cast::<u64>().write(0xDEAD_BEEF);
            arc_retain(obj);
            arc_release(obj);
            // Still reachable with the original count.
            assert_eq!(arc_refcount(obj), 1);
            assert_eq!(obj.cast::<u64>().read(), 0xDEAD_BEEF);
            arc_release(obj);
        }
    }

    #[test]
    fn destructor_fires_exactly_once() {
        DROPS.store(0, Ordering::SeqCst);
        let obj = arc_alloc(16, Some(count_drop));
        unsafe {
            // 1 (alloc) + 3 retains = 4 references; 4 releases → one drop.
            arc_retain(obj);
            arc_retain(obj);
            arc_retain(obj);
            assert_eq!(arc_refcount(obj), 4);
            arc_release(obj);
            arc_release(obj);
            arc_release(obj);
            assert_eq!(DROPS.load(Ordering::SeqCst), 0);
            arc_release(obj);
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_races_drop_once() {
        const OWNERS: usize = 8;
        static RACE_DROPS: AtomicUsize = AtomicUsize::new(0);
        extern "C" fn race_drop(_obj: *mut c_void) {
            RACE_DROPS.fetch_add(1, Ordering::SeqCst);
        }

        let obj = arc_alloc(8, Some(race_drop));
        for _ in 0..OWNERS - 1 {
            unsafe { arc_retain(obj) };
        }
        let addr = obj as usize;
        let handles: Vec<_> = (0..OWNERS)
            .map(|_| {
                std::thread::spawn(move || unsafe { arc_release(addr as *mut u8) })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(RACE_DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_size_object_allocates() {
        let obj = arc_alloc(0, None);
        assert!(!obj.is_null());
        unsafe { arc_release(obj) };
    }
}
