// =============================================================================
// ARNm Runtime — Process-Level Mutex
// =============================================================================
//
// Mutual exclusion between *processes*, not OS threads: a contended
// acquire yields the CPU back to the scheduler instead of spinning the
// worker, so the holder can run and release. The owner is recorded so the
// two classic misuses are diagnosed per the error policy:
//
//   - unlock by a non-owner      → warning, no state change
//   - relock by the current owner → warning, treated as already held
//
// Callable from plain OS threads too (the runtime's bootstrap thread);
// outside a process the caller is identified by a per-thread token and
// contention falls back to an OS-level yield.
// =============================================================================

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::task::scheduler::{current_process, yield_now};

/// Owner word value when the mutex is free.
const UNLOCKED: u64 = 0;

/// High bit marks non-process (plain thread) owners so their tokens never
/// collide with PIDs.
const THREAD_TOKEN_BIT: u64 = 1 << 63;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: Cell<u64> = const { Cell::new(0) };
}

/// Identity of the caller: its PID inside a process, a stable per-thread
/// token outside.
fn caller_token() -> u64 {
    if let Some(proc) = current_process() {
        return proc.pid().as_u64();
    }
    THREAD_TOKEN.with(|cell| {
        let mut token = cell.get();
        if token == 0 {
            token = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed) | THREAD_TOKEN_BIT;
            cell.set(token);
        }
        token
    })
}

/// Yield appropriately for the calling context.
fn back_off() {
    if current_process().is_some() {
        yield_now();
    } else {
        std::thread::yield_now();
    }
}

/// A mutex whose waiters are processes.
pub struct Mutex {
    /// UNLOCKED, or the owner's token.
    owner: AtomicU64,
}

impl Mutex {
    pub const fn new() -> Mutex {
        Mutex {
            owner: AtomicU64::new(UNLOCKED),
        }
    }

    /// Acquire, yielding to the scheduler while contended.
    pub fn lock(&self) {
        let me = caller_token();
        loop {
            match self
                .owner
                .compare_exchange(UNLOCKED, me, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(holder) if holder == me => {
                    log::warn!("mutex: relock by current owner {:#x}", me);
                    return;
                }
                Err(_) => back_off(),
            }
        }
    }

    /// Acquire without waiting. Returns false if held by someone else.
    pub fn try_lock(&self) -> bool {
        let me = caller_token();
        match self
            .owner
            .compare_exchange(UNLOCKED, me, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => true,
            Err(holder) => holder == me,
        }
    }

    /// Release. A non-owner unlock is diagnosed and ignored.
    pub fn unlock(&self) {
        let me = caller_token();
        if self
            .owner
            .compare_exchange(me, UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            log::warn!("mutex: unlock by non-owner {:#x}", me);
        }
    }

    /// Whether the mutex is currently held.
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != UNLOCKED
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Mutex::new()
    }
}
