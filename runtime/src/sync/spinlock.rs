// =============================================================================
// ARNm Runtime — Ticket Spinlock
// =============================================================================
//
// A ticket spinlock provides mutual exclusion between worker threads.
// Two counters: `next_ticket` and `now_serving`. To lock: atomically
// increment `next_ticket` to get a ticket, spin until `now_serving`
// equals it. To unlock: increment `now_serving`.
//
// Waiters are served in arrival order, so no worker starves even when a
// queue is hammered by spawns, yields, and steals at once. The critical
// sections guarded here are a handful of pointer writes; holders must not
// call into anything that can block or switch contexts.
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// A ticket-based spinlock.
///
/// Guarantees FIFO ordering of waiters. Suitable only for short critical
/// sections (queue link/unlink); never hold one across a context switch.
pub struct SpinLock<T> {
    /// The next ticket to be dispensed (atomically incremented by each locker).
    next_ticket: AtomicU32,

    /// The ticket number currently being served (incremented on unlock).
    now_serving: AtomicU32,

    /// The protected data. UnsafeCell is required because we mutate through
    /// a shared reference (the lock ensures exclusive access at runtime).
    data: UnsafeCell<T>,
}

// SAFETY: the lock ensures at most one thread accesses T at a time, so the
// usual Mutex bounds apply.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock wrapping the given value.
    ///
    /// `const` so queues can live in statics during tests.
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it is available.
    ///
    /// Returns a guard that releases the lock on drop.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        // Relaxed is fine for the ticket grab — the acquire spin below is
        // the synchronizing edge.
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        // Acquire ordering ensures we see all writes made by the previous
        // holder before touching the protected data.
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            core::hint::spin_loop();
        }

        SpinLockGuard { lock: self }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let current = self.now_serving.load(Ordering::Relaxed);
        // Take the next ticket only if it equals the currently-served one
        // (meaning the lock is free).
        self.next_ticket
            .compare_exchange(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// `&mut self` guarantees exclusive access at compile time — no lock
    /// needed. Used during scheduler construction and teardown.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for a held spinlock.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release ordering publishes our writes to the next holder.
        self.lock.now_serving.fetch_add(1, Ordering::Release);
    }
}
