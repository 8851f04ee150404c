// =============================================================================
// ARNm Runtime — Process (the unit of concurrent execution)
// =============================================================================
//
// A process owns everything it needs to run: a guard-paged stack, a saved
// CPU context, a mailbox, and an optional zero-initialized actor-state
// buffer whose size the spawner chooses. Identity is a 64-bit PID drawn
// from a process-wide counter starting at 1.
//
// State machine:
//
//     spawn                       dispatched by worker
//   ∅ ─────► Ready ◄──── wake ──── Waiting
//              │                      ▲
//              ▼                      │ receive on empty mailbox
//           Running ──────────────────┘
//              │
//              ▼ entry returned (exit handler)
//            Dead ──► destroyed by the worker that observed Dead
//
// Invariants: a Running process is in no queue; a Ready process is in
// exactly one run queue; a Waiting process is in the wait queue (or about
// to be parked there by its worker); a Dead process is referenced only by
// the worker destroying it.
// =============================================================================

use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

use crate::memory::stack::{Stack, DEFAULT_STACK_SIZE};
use crate::task::context::{Context, EntryFn};
use crate::task::mailbox::Mailbox;
use crate::task::scheduler::Scheduler;

// ── Process identifiers ─────────────────────────────────────────

/// Monotonically increasing PID counter, shared by every runtime instance
/// in the program so PIDs never collide.
static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Allocate a unique PID.
fn alloc_pid() -> Pid {
    Pid(NEXT_PID.fetch_add(1, Ordering::Relaxed))
}

/// Unique process identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u64);

impl Pid {
    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

// ── Process state ───────────────────────────────────────────────

/// The possible states of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    /// Runnable, sitting in exactly one run queue.
    Ready = 0,
    /// Executing on a worker right now.
    Running = 1,
    /// Parked on an empty mailbox until a sender wakes it.
    Waiting = 2,
    /// Finished; about to be destroyed by its worker.
    Dead = 3,
}

impl ProcessState {
    fn from_u8(raw: u8) -> ProcessState {
        match raw {
            0 => ProcessState::Ready,
            1 => ProcessState::Running,
            2 => ProcessState::Waiting,
            _ => ProcessState::Dead,
        }
    }
}

// ── Process record ──────────────────────────────────────────────

/// Alignment handed to the actor-state buffer, matching what the compiler
/// assumes for any state struct it lays out.
const STATE_ALIGN: usize = 16;

/// The process control block.
pub struct Process {
    /// Unique identity.
    pub pid: Pid,
    /// Atomic state — senders read it cross-thread for the wake protocol.
    state: AtomicU8,
    /// Saved CPU context; live only while the process is off-CPU.
    pub(crate) context: Context,
    /// Owned guard-paged stack.
    stack: Stack,
    /// Owned MPSC mailbox.
    pub(crate) mailbox: Mailbox,
    /// Opaque per-actor state buffer (zeroed at spawn), or null.
    actor_state: *mut u8,
    actor_state_size: usize,
    /// Intrusive link for run/wait queues. Only touched while holding the
    /// owning queue's lock; a process is in at most one queue at a time.
    pub(crate) next: *mut Process,
    /// Worker that last dispatched this process.
    pub(crate) worker_id: AtomicUsize,
    /// When the process was spawned (monotonic).
    pub spawn_time: Instant,
    /// Times this process has been dispatched.
    pub run_count: AtomicU64,
    /// Owning scheduler, so `send` can run the wake protocol without
    /// consulting globals. Null only in unit tests.
    pub(crate) sched: *const Scheduler,
}

// SAFETY: a Process migrates between worker threads but is only ever
// *executed* by one at a time; cross-thread access is limited to the
// atomic state, the mailbox, and lock-guarded queue links.
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

impl Process {
    /// Create a process ready to run `entry(arg)` on a fresh stack.
    ///
    /// Allocates the stack, the mailbox, and (when `state_size > 0`) a
    /// zeroed actor-state buffer, then forges the initial context. On any
    /// failure everything already allocated is released and no partial
    /// record remains.
    pub fn create(
        sched: *const Scheduler,
        entry: EntryFn,
        arg: *mut c_void,
        stack_size: usize,
        state_size: usize,
    ) -> Result<Box<Process>, &'static str> {
        let stack_size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let stack = Stack::alloc(stack_size)?;
        let mailbox = Mailbox::new()?;

        let actor_state = if state_size > 0 {
            let layout = Layout::from_size_align(state_size, STATE_ALIGN)
                .map_err(|_| "actor state size overflow")?;
            // SAFETY: nonzero size checked above.
            let buf = unsafe { alloc::alloc_zeroed(layout) };
            if buf.is_null() {
                return Err("actor state allocation failed");
            }
            buf
        } else {
            std::ptr::null_mut()
        };

        let mut proc = Box::new(Process {
            pid: alloc_pid(),
            state: AtomicU8::new(ProcessState::Ready as u8),
            context: Context::new(),
            stack,
            mailbox,
            actor_state,
            actor_state_size: state_size,
            next: std::ptr::null_mut(),
            worker_id: AtomicUsize::new(usize::MAX),
            spawn_time: Instant::now(),
            run_count: AtomicU64::new(0),
            sched,
        });

        // SAFETY: the stack was just mapped and is exclusively ours.
        unsafe {
            let top = proc.stack.top();
            proc.context.init(top, entry, arg);
        }
        Ok(proc)
    }

    /// Current state.
    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition to `state`. Release-ordered so a sender that observes
    /// Waiting also observes everything the process did before parking.
    pub(crate) fn set_state(&self, state: ProcessState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The actor-state buffer, or null when spawned with `state_size == 0`.
    pub fn actor_state(&self) -> *mut u8 {
        self.actor_state
    }

    /// Usable stack size in bytes.
    pub fn stack_size(&self) -> usize {
        self.stack.usable_size()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // Mailbox and stack release themselves; the actor-state buffer is
        // a raw allocation we own.
        if !self.actor_state.is_null() {
            let layout = Layout::from_size_align(self.actor_state_size, STATE_ALIGN)
                .expect("actor state layout");
            // SAFETY: allocated in `create` with exactly this layout.
            unsafe { alloc::dealloc(self.actor_state, layout) };
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .field("mailbox_len", &self.mailbox.len())
            .field("stack_size", &self.stack.usable_size())
            .field("run_count", &self.run_count.load(Ordering::Relaxed))
            .finish()
    }
}

// ── Process references ──────────────────────────────────────────

/// Opaque handle to a process, used for addressing sends.
///
/// Valid from `spawn` until the target's entry function returns; the
/// handle carries no generation counter, so using it past the target's
/// death is undefined (as in the C ABI it mirrors).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ProcessRef(*mut Process);

// SAFETY: the handle is an address; every operation through it goes to
// the target's atomics, mailbox, or lock-guarded queue links.
unsafe impl Send for ProcessRef {}
unsafe impl Sync for ProcessRef {}

impl ProcessRef {
    pub(crate) fn new(proc: *mut Process) -> ProcessRef {
        ProcessRef(proc)
    }

    pub(crate) fn as_ptr(self) -> *mut Process {
        self.0
    }

    /// The target's PID.
    pub fn pid(self) -> Pid {
        // SAFETY: handle validity per the type's contract.
        unsafe { (*self.0).pid }
    }
}
