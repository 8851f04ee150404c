// =============================================================================
// ARNm Runtime — M:N Scheduler
// =============================================================================
//
// One OS thread per worker. Each worker owns a FIFO run queue; a global
// run queue catches spawns from outside the worker pool and woken
// receivers. A worker picks work local-first, then global, then steals
// from a sibling, then backs off briefly. Dispatch is a context switch
// from the worker's own saved context into the process's; the switch
// returns when the process yields, parks on an empty mailbox, or dies.
//
// PARKING: a receiver that finds its mailbox empty marks itself Waiting
// and yields. The *worker* then parks it — after the switch back, when the
// process's context is fully saved — and immediately re-checks the
// mailbox, self-waking the process if a send raced in. Senders wake any
// target they observe Waiting. Wake removes from the wait queue by
// identity (idempotent; exactly one waker wins) and requeues on the
// global queue so any idle worker picks the receiver up.
//
// DEADLOCK: when every live process is parked (active == waiting > 0) no
// wake can ever arrive from inside the pool; the runtime reports it on
// the diagnostic stream once per episode and keeps running, since an
// external thread may still send.
//
// The scheduler is an owned value: worker threads share it via Arc, and
// several instances can coexist (the C ABI installs exactly one).
// =============================================================================

use std::cell::Cell;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::task::context::{context_switch, Context, EntryFn};
use crate::task::mailbox::Envelope;
use crate::task::process::{Process, ProcessRef, ProcessState};
use crate::task::queue::{RunQueue, WaitQueue};
use crate::util::diag;

/// Compile-time ceiling on the worker pool.
pub const MAX_WORKERS: usize = 64;

/// How long an idle worker sleeps before rescanning the queues.
const IDLE_BACKOFF: Duration = Duration::from_micros(100);

// ── Per-thread scheduling state ─────────────────────────────────
//
// Written only by the owning thread. The current-process cell is what
// lets yield, receive, self, and the exit handler find their process
// without threading it through every call.

thread_local! {
    static CURRENT_SCHED: Cell<*const Scheduler> = const { Cell::new(ptr::null()) };
    static CURRENT_WORKER: Cell<usize> = const { Cell::new(usize::MAX) };
    static CURRENT_PROC: Cell<*mut Process> = const { Cell::new(ptr::null_mut()) };
}

// ── Worker ──────────────────────────────────────────────────────

/// Per-OS-thread scheduling record.
pub struct Worker {
    /// Worker index, 0-based; worker 0 runs on the thread that called
    /// `run()`.
    pub id: usize,
    /// This worker's FIFO of Ready processes.
    run_queue: RunQueue,
    /// The worker loop's own saved context — what a process switches back
    /// into when it yields.
    sched_ctx: UnsafeCellContext,
    /// The process executing right now, if any.
    current: AtomicPtr<Process>,
    /// Processes taken from siblings.
    steals: AtomicU64,
    /// Total dispatches.
    runs: AtomicU64,
}

/// A Context in a cell only the owning worker thread touches.
struct UnsafeCellContext(std::cell::UnsafeCell<Context>);

// SAFETY: the inner context is only accessed from the worker's own thread
// (by the worker loop and by processes that thread is running).
unsafe impl Sync for UnsafeCellContext {}

impl Worker {
    fn new(id: usize) -> Worker {
        Worker {
            id,
            run_queue: RunQueue::new(),
            sched_ctx: UnsafeCellContext(std::cell::UnsafeCell::new(Context::new())),
            current: AtomicPtr::new(ptr::null_mut()),
            steals: AtomicU64::new(0),
            runs: AtomicU64::new(0),
        }
    }
}

// ── Scheduler ───────────────────────────────────────────────────

/// The M:N dispatcher: worker pool, global run queue, wait queue,
/// process accounting, and lifecycle.
pub struct Scheduler {
    workers: Box<[Worker]>,
    /// Spawns from non-worker threads and woken receivers land here.
    global: RunQueue,
    /// Parked receivers.
    waiting: WaitQueue,
    /// Live (spawned, not yet dead) processes.
    active: AtomicUsize,
    /// Parked processes; equal to `active` means nobody can make progress.
    waiting_count: AtomicUsize,
    shutdown: AtomicBool,
    /// Latches the deadlock warning so one episode logs once.
    deadlock_reported: AtomicBool,
}

impl Scheduler {
    /// Build a scheduler with `num_workers` workers (0 ⇒ one per online
    /// processor), clamped to [`MAX_WORKERS`]. No threads start until
    /// [`run`](Scheduler::run).
    pub fn new(num_workers: usize) -> Arc<Scheduler> {
        let n = if num_workers == 0 {
            std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1)
        } else {
            num_workers
        };
        let n = n.clamp(1, MAX_WORKERS);

        let workers: Box<[Worker]> = (0..n).map(Worker::new).collect();
        Arc::new(Scheduler {
            workers,
            global: RunQueue::new(),
            waiting: WaitQueue::new(),
            active: AtomicUsize::new(0),
            waiting_count: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            deadlock_reported: AtomicBool::new(false),
        })
    }

    /// Number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    // ── Spawning and enqueueing ─────────────────────────────────

    /// Create a process running `entry(arg)` and make it Ready.
    ///
    /// `stack_size == 0` selects the default stack size. Works both from
    /// inside a running process (enqueues on the calling worker's local
    /// queue) and from any other thread (enqueues globally).
    pub fn spawn(
        &self,
        entry: EntryFn,
        arg: *mut c_void,
        stack_size: usize,
        state_size: usize,
    ) -> Result<ProcessRef, &'static str> {
        let proc = Process::create(self as *const Scheduler, entry, arg, stack_size, state_size)?;
        let proc = Box::into_raw(proc);
        self.enqueue(proc);
        Ok(ProcessRef::new(proc))
    }

    /// Make `proc` Ready and queue it: on the calling worker's local queue
    /// when the caller is one of this scheduler's workers, else globally.
    fn enqueue(&self, proc: *mut Process) {
        // SAFETY: `proc` is live — it was just created or is being
        // re-queued by its owner.
        unsafe { (*proc).set_state(ProcessState::Ready) };
        self.active.fetch_add(1, Ordering::AcqRel);
        self.deadlock_reported.store(false, Ordering::Relaxed);

        let on_own_worker = CURRENT_SCHED.get() == self as *const _
            && CURRENT_WORKER.get() != usize::MAX;
        if on_own_worker {
            self.workers[CURRENT_WORKER.get()].run_queue.push(proc);
        } else {
            self.global.push(proc);
        }
    }

    /// Variant of the enqueue policy that targets a specific worker.
    /// Used sparingly — pinned helpers and tests.
    #[allow(dead_code)]
    pub(crate) fn enqueue_local(&self, proc: *mut Process, worker_id: usize) {
        // SAFETY: as in `enqueue`.
        unsafe { (*proc).set_state(ProcessState::Ready) };
        self.active.fetch_add(1, Ordering::AcqRel);
        self.deadlock_reported.store(false, Ordering::Relaxed);
        self.workers[worker_id].run_queue.push(proc);
    }

    // ── Messaging entry points ──────────────────────────────────

    /// Deliver a message to `target`, waking it if it is parked.
    pub fn send(
        &self,
        target: ProcessRef,
        tag: u64,
        data: *const u8,
        size: usize,
    ) -> Result<(), &'static str> {
        let proc = target.as_ptr();
        // SAFETY: handle validity per ProcessRef's contract.
        unsafe { (*proc).mailbox.send(tag, data, size)? };
        // The count increment above is ordered before this state read, so
        // either we see Waiting and wake, or the receiver's park re-check
        // sees our message. No wakeup is lost.
        if unsafe { (*proc).state() } == ProcessState::Waiting {
            self.wake(proc);
        }
        Ok(())
    }

    /// Wake a parked process: remove it from the wait queue (losing racers
    /// no-op), mark Ready, requeue globally so any idle worker takes it.
    pub(crate) fn wake(&self, proc: *mut Process) -> bool {
        if !self.waiting.remove(proc) {
            return false;
        }
        self.waiting_count.fetch_sub(1, Ordering::AcqRel);
        self.deadlock_reported.store(false, Ordering::Relaxed);
        // SAFETY: a parked process stays valid until its worker destroys
        // it, which cannot happen while it sits in the wait queue.
        unsafe { (*proc).set_state(ProcessState::Ready) };
        self.global.push(proc);
        true
    }

    // ── Worker loop ─────────────────────────────────────────────

    /// Pick the next runnable process: local queue, then global, then a
    /// round-robin steal sweep starting just after ourselves.
    fn next_process(&self, worker_id: usize) -> Option<*mut Process> {
        if let Some(p) = self.workers[worker_id].run_queue.pop() {
            return Some(p);
        }
        if let Some(p) = self.global.pop() {
            return Some(p);
        }
        self.steal(worker_id)
    }

    fn steal(&self, worker_id: usize) -> Option<*mut Process> {
        let n = self.workers.len();
        for offset in 1..n {
            let victim = &self.workers[(worker_id + offset) % n];
            if let Some(p) = victim.run_queue.steal() {
                self.workers[worker_id].steals.fetch_add(1, Ordering::Relaxed);
                return Some(p);
            }
        }
        None
    }

    /// The per-worker dispatch loop.
    fn worker_loop(&self, worker_id: usize) {
        CURRENT_SCHED.set(self as *const Scheduler);
        CURRENT_WORKER.set(worker_id);
        let worker = &self.workers[worker_id];

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let Some(proc) = self.next_process(worker_id) else {
                if self.active.load(Ordering::Acquire) == 0 {
                    break;
                }
                self.check_deadlock();
                std::thread::sleep(IDLE_BACKOFF);
                continue;
            };

            // Dispatch. SAFETY: a popped process is live and exclusively
            // ours until it is re-queued or destroyed.
            unsafe {
                worker.current.store(proc, Ordering::Release);
                CURRENT_PROC.set(proc);
                (*proc).set_state(ProcessState::Running);
                (*proc).worker_id.store(worker_id, Ordering::Relaxed);
                (*proc).run_count.fetch_add(1, Ordering::Relaxed);
                worker.runs.fetch_add(1, Ordering::Relaxed);

                // Returns when the process yields, parks, or exits.
                context_switch(worker.sched_ctx.0.get(), &raw const (*proc).context);

                CURRENT_PROC.set(ptr::null_mut());
                worker.current.store(ptr::null_mut(), Ordering::Release);

                match (*proc).state() {
                    // The exit handler already dropped it from the active
                    // count; reclaim stack, mailbox, state, and record.
                    ProcessState::Dead => drop(Box::from_raw(proc)),
                    // Empty-mailbox receive: park now that the context is
                    // fully saved.
                    ProcessState::Waiting => self.park(proc),
                    // Ready: the process re-queued itself in yield.
                    _ => {}
                }
            }
        }

        CURRENT_WORKER.set(usize::MAX);
        CURRENT_SCHED.set(ptr::null());
    }

    /// Park a process that yielded in the Waiting state, then close the
    /// race with senders that missed it: if a message slipped in between
    /// the receiver's last poll and this park, wake it ourselves.
    fn park(&self, proc: *mut Process) {
        self.waiting.push(proc);
        self.waiting_count.fetch_add(1, Ordering::AcqRel);
        // SAFETY: the process is parked, not destroyed.
        if !unsafe { (*proc).mailbox.is_empty() } {
            self.wake(proc);
        }
    }

    /// Report when every live process is parked. Latched so one episode
    /// produces one warning; any enqueue or wake re-arms it.
    fn check_deadlock(&self) {
        let active = self.active.load(Ordering::Acquire);
        if active == 0 {
            return;
        }
        if self.waiting_count.load(Ordering::Acquire) == active
            && !self.deadlock_reported.swap(true, Ordering::AcqRel)
        {
            log::warn!(
                "potential deadlock: all {} live processes are blocked in receive",
                active
            );
        }
    }

    /// True if a deadlock episode has been reported and not re-armed.
    pub fn deadlock_reported(&self) -> bool {
        self.deadlock_reported.load(Ordering::Relaxed)
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Run the scheduler: workers 1..N on fresh OS threads, worker 0 on
    /// the calling thread. Returns when every process has finished (or
    /// [`shutdown`](Scheduler::shutdown) was requested), with the helper
    /// threads joined.
    pub fn run(&self) {
        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.workers.len().saturating_sub(1));
            for id in 1..self.workers.len() {
                let handle = std::thread::Builder::new()
                    .name(format!("arnm-worker-{}", id))
                    .spawn_scoped(scope, move || self.worker_loop(id))
                    .expect("failed to spawn worker thread");
                handles.push(handle);
            }

            self.worker_loop(0);

            for handle in handles {
                let _ = handle.join();
            }
        });
    }

    /// Ask every worker to exit at its next loop iteration.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    // ── Accounting ──────────────────────────────────────────────

    /// Live processes (spawned and not yet dead).
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Parked processes.
    pub fn waiting_count(&self) -> usize {
        self.waiting_count.load(Ordering::Acquire)
    }

    /// Dispatches performed by worker `id`.
    pub fn worker_runs(&self, id: usize) -> u64 {
        self.workers[id].runs.load(Ordering::Relaxed)
    }

    /// Steals performed by worker `id`.
    pub fn worker_steals(&self, id: usize) -> u64 {
        self.workers[id].steals.load(Ordering::Relaxed)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Workers are gone by now (run joined them). Any process still
        // queued or parked — shutdown mid-flight, or a deadlocked set —
        // is reclaimed here so stacks and mailboxes never leak.
        let mut leftovers = Vec::new();
        for worker in self.workers.iter_mut() {
            leftovers.extend(worker.run_queue.drain());
        }
        leftovers.extend(self.global.drain());
        leftovers.extend(self.waiting.drain());
        for proc in leftovers {
            // SAFETY: drained processes are no longer referenced by any
            // queue or worker.
            drop(unsafe { Box::from_raw(proc) });
        }
    }
}

// ── Process-side entry points (thread-local dispatch) ───────────

/// Handle to the process running on the current thread, if any.
pub fn current_process() -> Option<ProcessRef> {
    let proc = CURRENT_PROC.get();
    if proc.is_null() {
        None
    } else {
        Some(ProcessRef::new(proc))
    }
}

/// Surrender the CPU back to the worker loop.
///
/// A Ready/Running caller re-queues itself on its worker's local queue; a
/// Dead caller drops out of the active count (its record is destroyed by
/// the worker); a Waiting caller is left for the worker to park. No-op
/// when called outside a process.
pub fn yield_now() {
    let proc = CURRENT_PROC.get();
    if proc.is_null() {
        return;
    }
    let sched = CURRENT_SCHED.get();
    let worker_id = CURRENT_WORKER.get();

    // SAFETY: the TLS triple is consistent while a process is on-CPU.
    unsafe {
        let sched = &*sched;
        match (*proc).state() {
            ProcessState::Ready | ProcessState::Running => {
                (*proc).set_state(ProcessState::Ready);
                sched.workers[worker_id].run_queue.push(proc);
            }
            ProcessState::Dead => {
                sched.active.fetch_sub(1, Ordering::AcqRel);
            }
            ProcessState::Waiting => {} // parked by the worker after the switch
        }
        context_switch(
            &raw mut (*proc).context,
            sched.workers[worker_id].sched_ctx.0.get(),
        );
    }
}

/// Deliver a message through a process handle, waking a parked target.
///
/// The free-function form of [`Scheduler::send`]: the owning scheduler is
/// found through the handle, so senders need no scheduler reference (this
/// is what `arnm_send` compiles down to).
pub fn send_to(
    target: ProcessRef,
    tag: u64,
    data: *const u8,
    size: usize,
) -> Result<(), &'static str> {
    let proc = target.as_ptr();
    // SAFETY: handle validity per ProcessRef's contract; a process's
    // owning scheduler outlives it.
    unsafe {
        let sched = (*proc).sched;
        if sched.is_null() {
            (*proc).mailbox.send(tag, data, size)
        } else {
            (*sched).send(target, tag, data, size)
        }
    }
}

/// Actor-state buffer of the current process (null when it was spawned
/// with `state_size == 0`, or outside a process).
pub fn current_actor_state() -> *mut u8 {
    let proc = CURRENT_PROC.get();
    if proc.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: the current process is live.
    unsafe { (*proc).actor_state() }
}

/// Non-blocking receive on the current process's mailbox.
pub fn try_receive() -> Option<*mut Envelope> {
    let proc = CURRENT_PROC.get();
    if proc.is_null() {
        return None;
    }
    // SAFETY: we are the owning (consuming) process.
    unsafe { (*proc).mailbox.try_receive() }
}

/// Blocking receive: poll the mailbox, park on empty, retry on wake.
///
/// Must be called from inside a process; anything else is a hard error.
pub fn receive() -> *mut Envelope {
    let proc = CURRENT_PROC.get();
    if proc.is_null() {
        diag::invariant_failed("receive called outside a process");
    }
    loop {
        // SAFETY: we are the owning process.
        if let Some(msg) = unsafe { (*proc).mailbox.try_receive() } {
            return msg;
        }
        // SAFETY: marking ourselves Waiting; the worker parks us once our
        // context is saved, and any sender that sees this state wakes us.
        unsafe { (*proc).set_state(ProcessState::Waiting) };
        yield_now();
    }
}

/// Process-exit handler: the trampoline lands here when `entry` returns
/// (and `arnm_exit` calls it directly). Marks the process Dead and yields;
/// the worker destroys the record. Never returns.
pub(crate) extern "C" fn process_exit() {
    let proc = CURRENT_PROC.get();
    if proc.is_null() {
        diag::invariant_failed("process exit outside a process");
    }
    // SAFETY: we are the current process.
    unsafe { (*proc).set_state(ProcessState::Dead) };
    yield_now();
    // The worker never resumes a Dead process; if control somehow lands
    // back here, spin rather than return onto a freed frame.
    loop {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    extern "C" fn nop_entry(_arg: *mut c_void) {}

    static TICKS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn tick_entry(_arg: *mut c_void) {
        TICKS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn worker_count_clamps() {
        assert_eq!(Scheduler::new(1).num_workers(), 1);
        assert_eq!(Scheduler::new(4).num_workers(), 4);
        assert_eq!(Scheduler::new(1000).num_workers(), MAX_WORKERS);
        assert!(Scheduler::new(0).num_workers() >= 1);
    }

    #[test]
    fn spawn_enqueues_globally_from_outside() {
        let sched = Scheduler::new(2);
        let handle = sched
            .spawn(nop_entry, ptr::null_mut(), 0, 0)
            .unwrap();
        assert_eq!(sched.active_count(), 1);
        assert!(handle.pid().as_u64() >= 1);
        // Not run — the Drop impl must reclaim the queued process.
        drop(sched);
    }

    #[test]
    fn run_executes_spawned_processes_to_completion() {
        TICKS.store(0, Ordering::SeqCst);
        let sched = Scheduler::new(2);
        for _ in 0..16 {
            sched.spawn(tick_entry, ptr::null_mut(), 0, 0).unwrap();
        }
        sched.run();
        assert_eq!(TICKS.load(Ordering::SeqCst), 16);
        assert_eq!(sched.active_count(), 0);
        assert_eq!(sched.waiting_count(), 0);
    }

    #[test]
    fn enqueue_local_targets_the_chosen_worker() {
        let sched = Scheduler::new(3);
        let proc = Process::create(
            Arc::as_ptr(&sched),
            nop_entry,
            ptr::null_mut(),
            0,
            0,
        )
        .unwrap();
        let proc = Box::into_raw(proc);
        sched.enqueue_local(proc, 2);
        assert_eq!(sched.active_count(), 1);
        // Worker 2's queue holds it; nothing else does.
        assert_eq!(sched.workers[2].run_queue.len(), 1);
        assert_eq!(sched.global.len(), 0);
        drop(sched); // reclaims the queued process
    }

    #[test]
    fn shutdown_stops_an_idle_run() {
        let sched = Scheduler::new(2);
        sched.shutdown();
        // No processes: run must return promptly via the shutdown flag.
        sched.run();
    }
}
