// =============================================================================
// ARNm Runtime — Intrusive Process Queues
// =============================================================================
//
// Run queues and the wait queue share one shape: a singly-linked FIFO
// threaded through `Process.next`, so enqueue and dequeue allocate
// nothing. A ticket spinlock guards the handful of pointer writes; an
// atomic count rides outside the lock for cheap size queries (advisory —
// it can lag the list by a beat under contention).
//
// Stealing pops from the head with the same unlink a normal dequeue uses,
// but only when the victim holds MORE THAN ONE process. Together with
// tail-insertion this means a process a worker just re-queued for itself
// (whose context may still be mid-save) can never be the one a thief
// takes: it is at the tail, and a tail that is also the head means a
// single-element queue, which stealing refuses.
// =============================================================================

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sync::spinlock::SpinLock;
use crate::task::process::{Process, ProcessState};
use crate::util::diag;

/// The linked list inside a queue; always manipulated under the lock.
struct List {
    head: *mut Process,
    tail: *mut Process,
}

// SAFETY: the raw links are only dereferenced by the lock holder.
unsafe impl Send for List {}

impl List {
    const fn new() -> List {
        List {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    /// Append at the tail.
    unsafe fn push(&mut self, proc: *mut Process) {
        unsafe { (*proc).next = ptr::null_mut() };
        if self.tail.is_null() {
            self.head = proc;
        } else {
            unsafe { (*self.tail).next = proc };
        }
        self.tail = proc;
    }

    /// Unlink the head.
    unsafe fn pop(&mut self) -> Option<*mut Process> {
        if self.head.is_null() {
            return None;
        }
        let proc = self.head;
        self.head = unsafe { (*proc).next };
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        unsafe { (*proc).next = ptr::null_mut() };
        Some(proc)
    }

    /// Unlink `proc` wherever it sits. O(N) scan; N is bounded by the
    /// waiting-set size.
    unsafe fn remove(&mut self, proc: *mut Process) -> bool {
        let mut prev: *mut Process = ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            if cur == proc {
                let next = unsafe { (*cur).next };
                if prev.is_null() {
                    self.head = next;
                } else {
                    unsafe { (*prev).next = next };
                }
                if self.tail == cur {
                    self.tail = prev;
                }
                unsafe { (*cur).next = ptr::null_mut() };
                return true;
            }
            prev = cur;
            cur = unsafe { (*cur).next };
        }
        false
    }

    fn has_more_than_one(&self) -> bool {
        !self.head.is_null() && self.head != self.tail
    }
}

/// FIFO of Ready processes (one per worker, plus the global queue).
pub struct RunQueue {
    list: SpinLock<List>,
    count: AtomicUsize,
}

impl RunQueue {
    pub const fn new() -> RunQueue {
        RunQueue {
            list: SpinLock::new(List::new()),
            count: AtomicUsize::new(0),
        }
    }

    /// Append a runnable process.
    pub fn push(&self, proc: *mut Process) {
        // SAFETY: queue residency is exclusive — the pushing thread owns
        // the process's link until this insertion publishes it.
        unsafe { self.list.lock().push(proc) };
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Dequeue the oldest process, verifying the state invariant: only
    /// Ready (or not-yet-parked Waiting) processes belong in a run queue.
    pub fn pop(&self) -> Option<*mut Process> {
        // SAFETY: list surgery under the lock.
        let proc = unsafe { self.list.lock().pop() }?;
        self.count.fetch_sub(1, Ordering::Release);
        // SAFETY: a queued process is a valid allocation.
        let state = unsafe { (*proc).state() };
        if state != ProcessState::Ready && state != ProcessState::Waiting {
            diag::invariant_failed("run queue popped a process that is neither Ready nor Waiting");
        }
        Some(proc)
    }

    /// Steal the oldest process, but only when the victim has more than
    /// one — a thief must never race the victim down to empty.
    pub fn steal(&self) -> Option<*mut Process> {
        let proc = {
            let mut list = self.list.lock();
            if !list.has_more_than_one() {
                return None;
            }
            // SAFETY: same unlink a normal dequeue uses.
            unsafe { list.pop() }?
        };
        self.count.fetch_sub(1, Ordering::Release);
        let state = unsafe { (*proc).state() };
        if state != ProcessState::Ready && state != ProcessState::Waiting {
            diag::invariant_failed("stolen process is neither Ready nor Waiting");
        }
        Some(proc)
    }

    /// Advisory length.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Drain every queued process into the caller's hands (teardown).
    pub(crate) fn drain(&mut self) -> Vec<*mut Process> {
        let list = self.list.get_mut();
        let mut out = Vec::new();
        // SAFETY: &mut self — nobody else can touch the list.
        while let Some(p) = unsafe { list.pop() } {
            out.push(p);
        }
        self.count.store(0, Ordering::Release);
        out
    }
}

/// FIFO of parked Waiting processes awaiting wake-up.
pub struct WaitQueue {
    list: SpinLock<List>,
    count: AtomicUsize,
}

impl WaitQueue {
    pub const fn new() -> WaitQueue {
        WaitQueue {
            list: SpinLock::new(List::new()),
            count: AtomicUsize::new(0),
        }
    }

    /// Park a Waiting process.
    pub fn push(&self, proc: *mut Process) {
        // SAFETY: as in RunQueue::push.
        unsafe { self.list.lock().push(proc) };
        self.count.fetch_add(1, Ordering::Release);
    }

    /// Remove `proc` by identity. Returns false if it was not parked —
    /// wake is idempotent and racing wakers must get exactly one winner.
    pub fn remove(&self, proc: *mut Process) -> bool {
        // SAFETY: list surgery under the lock.
        let removed = unsafe { self.list.lock().remove(proc) };
        if removed {
            self.count.fetch_sub(1, Ordering::Release);
        }
        removed
    }

    /// Advisory length.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Drain every parked process into the caller's hands (teardown).
    pub(crate) fn drain(&mut self) -> Vec<*mut Process> {
        let list = self.list.get_mut();
        let mut out = Vec::new();
        // SAFETY: &mut self — nobody else can touch the list.
        while let Some(p) = unsafe { list.pop() } {
            out.push(p);
        }
        self.count.store(0, Ordering::Release);
        out
    }
}
