// =============================================================================
// ARNm Runtime — C ABI Surface
// =============================================================================
//
// The flat symbol contract the ARNm compiler emits calls against. Handles
// are opaque pointers on this side of the fence:
//
//   process handle — a `*mut Process` (never dereferenced by user code)
//   message handle — a `*mut Envelope` (read through arnm_message_*)
//
// Exactly one runtime instance is installed at a time, behind a spinlocked
// slot: `arnm_init` fills it, `arnm_shutdown` clears it. Calls that need
// the current process (`arnm_self`, `arnm_yield`, `arnm_receive`, …) go
// through thread-local dispatch and work regardless of the slot.
//
// Every fallible entry point reports failure with a status integer or a
// null handle; nothing unwinds across this boundary.
// =============================================================================

use std::ffi::{c_int, c_void};
use std::sync::Arc;

use crate::memory::arc::{arc_alloc, arc_refcount, arc_release, arc_retain, Destructor};
use crate::task::mailbox::{free_envelope, Envelope};
use crate::task::process::{Process, ProcessRef};
use crate::task::scheduler::{self, Scheduler};
use crate::util::diag;

/// The installed runtime instance.
///
/// A spin mutex, not a std one: the slot is touched before any scheduler
/// machinery exists and from ABI calls that must never block on OS locks.
static RUNTIME: spin::Mutex<Option<Arc<Scheduler>>> = spin::Mutex::new(None);

fn installed() -> Option<Arc<Scheduler>> {
    RUNTIME.lock().clone()
}

// ── Runtime lifecycle ───────────────────────────────────────────

/// Initialize the runtime with `num_workers` workers (0 ⇒ one per online
/// processor, clamped to 64). Returns 0 on success.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_init(num_workers: u32) -> c_int {
    diag::init();
    let mut slot = RUNTIME.lock();
    if slot.is_some() {
        log::error!("arnm_init: runtime already initialized");
        return -1;
    }
    *slot = Some(Scheduler::new(num_workers as usize));
    0
}

/// Run the scheduler on the calling thread (as worker 0) until every
/// process has finished. Workers 1..N run on their own threads and are
/// joined before this returns.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_run() {
    match installed() {
        Some(sched) => sched.run(),
        None => log::error!("arnm_run: runtime not initialized"),
    }
}

/// Tear the runtime down: request worker exit and release the instance
/// (queues, leftover processes, worker table).
#[unsafe(no_mangle)]
pub extern "C" fn arnm_shutdown() {
    let taken = RUNTIME.lock().take();
    match taken {
        Some(sched) => sched.shutdown(),
        None => log::warn!("arnm_shutdown: runtime not initialized"),
    }
    // Dropping the Arc (last reference once run() has returned) frees
    // everything the scheduler still owns.
}

// ── Processes ───────────────────────────────────────────────────

/// Spawn a process running `entry(arg)` with a default-size stack and a
/// zeroed actor-state buffer of `state_size` bytes (0 for none).
/// Returns the process handle, or null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_spawn(
    entry: Option<extern "C" fn(*mut c_void)>,
    arg: *mut c_void,
    state_size: usize,
) -> *mut c_void {
    let Some(entry) = entry else {
        log::error!("arnm_spawn: null entry function");
        return std::ptr::null_mut();
    };
    let Some(sched) = installed() else {
        log::error!("arnm_spawn: runtime not initialized");
        return std::ptr::null_mut();
    };
    match sched.spawn(entry, arg, 0, state_size) {
        Ok(handle) => handle.as_ptr() as *mut c_void,
        Err(err) => {
            log::error!("arnm_spawn: {}", err);
            std::ptr::null_mut()
        }
    }
}

/// Handle of the calling process, or null outside one.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_self() -> *mut c_void {
    match scheduler::current_process() {
        Some(proc) => proc.as_ptr() as *mut c_void,
        None => std::ptr::null_mut(),
    }
}

/// PID of `process`, or 0 for a null handle.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_pid(process: *mut c_void) -> u64 {
    if process.is_null() {
        return 0;
    }
    // SAFETY: a non-null handle came from arnm_spawn/arnm_self and is
    // valid per the handle contract.
    unsafe { (*(process as *mut Process)).pid.as_u64() }
}

/// Actor-state buffer of the calling process, or null when it was spawned
/// without one. Compiled actor bodies load their state through this.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_state() -> *mut c_void {
    scheduler::current_actor_state() as *mut c_void
}

/// Cooperatively yield the CPU. No-op outside a process.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_yield() {
    scheduler::yield_now();
}

/// Terminate the calling process. Never returns.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_exit() -> ! {
    scheduler::process_exit();
    // process_exit never returns; parallel the trampoline's guard.
    loop {
        std::hint::spin_loop();
    }
}

// ── Messaging ───────────────────────────────────────────────────

/// Send a message to `target`. `size > 0` copies that many bytes from
/// `data`; `size == 0` adopts `data` as the payload pointer. Returns 0 on
/// success.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_send(
    target: *mut c_void,
    tag: u64,
    data: *const c_void,
    size: usize,
) -> c_int {
    if target.is_null() {
        log::error!("arnm_send: null target");
        return -1;
    }
    let handle = ProcessRef::new(target as *mut Process);
    match scheduler::send_to(handle, tag, data as *const u8, size) {
        Ok(()) => 0,
        Err(err) => {
            log::error!("arnm_send: {}", err);
            -1
        }
    }
}

/// Blocking receive on the calling process's mailbox.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_receive() -> *mut c_void {
    scheduler::receive() as *mut c_void
}

/// Non-blocking receive; null when the mailbox is empty (or when called
/// outside a process).
#[unsafe(no_mangle)]
pub extern "C" fn arnm_try_receive() -> *mut c_void {
    match scheduler::try_receive() {
        Some(msg) => msg as *mut c_void,
        None => std::ptr::null_mut(),
    }
}

/// Tag of a received message.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_message_tag(message: *mut c_void) -> u64 {
    if message.is_null() {
        return 0;
    }
    // SAFETY: message handles come from arnm_receive/arnm_try_receive.
    unsafe { (*(message as *mut Envelope)).tag }
}

/// Payload pointer of a received message.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_message_data(message: *mut c_void) -> *mut c_void {
    if message.is_null() {
        return std::ptr::null_mut();
    }
    // SAFETY: as above.
    unsafe { (*(message as *mut Envelope)).data as *mut c_void }
}

/// Payload size of a received message (0 for adopted-pointer sends).
#[unsafe(no_mangle)]
pub extern "C" fn arnm_message_size(message: *mut c_void) -> usize {
    if message.is_null() {
        return 0;
    }
    // SAFETY: as above.
    unsafe { (*(message as *mut Envelope)).size }
}

/// Free a received message (copied payload included).
#[unsafe(no_mangle)]
pub extern "C" fn arnm_message_free(message: *mut c_void) {
    if message.is_null() {
        return;
    }
    // SAFETY: the receiver owns a delivered message exclusively.
    unsafe { free_envelope(message as *mut Envelope) };
}

/// Called by compiled receive blocks when no pattern matched the inbound
/// message. Reports and aborts the program.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_panic_nomatch() -> ! {
    match scheduler::current_process() {
        Some(proc) => diag::panic_abort(&format!(
            "unmatched receive: no pattern matched the message in process {}",
            proc.pid()
        )),
        None => diag::panic_abort("unmatched receive outside a process"),
    }
}

// ── ARC ─────────────────────────────────────────────────────────

/// Allocate a zeroed, reference-counted object. Null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_alloc(size: usize, destructor: Destructor) -> *mut c_void {
    arc_alloc(size, destructor) as *mut c_void
}

/// Increment an object's reference count.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_retain(object: *mut c_void) {
    if object.is_null() {
        return;
    }
    // SAFETY: non-null objects come from arnm_alloc.
    unsafe { arc_retain(object as *mut u8) };
}

/// Decrement an object's reference count, destroying it on the last
/// release.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_release(object: *mut c_void) {
    if object.is_null() {
        return;
    }
    // SAFETY: as above.
    unsafe { arc_release(object as *mut u8) };
}

/// Current reference count of an object (0 for null).
#[unsafe(no_mangle)]
pub extern "C" fn arnm_refcount(object: *mut c_void) -> u64 {
    if object.is_null() {
        return 0;
    }
    // SAFETY: as above.
    unsafe { arc_refcount(object as *const u8) }
}

// ── Utility hooks ───────────────────────────────────────────────

/// Print an integer and a newline to standard output. The code generator
/// calls this for ARNm's built-in integer print.
#[unsafe(no_mangle)]
pub extern "C" fn arnm_print_int(value: i64) {
    use std::io::Write;
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{}", value);
    let _ = out.flush();
}

// ── Bootstrap entry point ───────────────────────────────────────
//
// Compiled ARNm programs have no C main of their own; the runtime
// provides it. Gated behind the `bootstrap` feature so the rlib links
// cleanly into test binaries that bring their own main.

#[cfg(all(feature = "bootstrap", not(test)))]
mod bootstrap {
    use super::*;

    unsafe extern "C" {
        /// The compiled program's entry, emitted by the ARNm compiler.
        fn _arnm_main();
    }

    /// Adapter between the process entry signature and `_arnm_main`.
    extern "C" fn main_trampoline(_arg: *mut c_void) {
        // SAFETY: the compiler guarantees _arnm_main's existence and ABI.
        unsafe { _arnm_main() };
    }

    /// The OS entry point: init, spawn the program's main process, run to
    /// completion, tear down.
    #[unsafe(no_mangle)]
    pub extern "C" fn main(_argc: c_int, _argv: *mut *mut std::ffi::c_char) -> c_int {
        if arnm_init(0) != 0 {
            return 1;
        }
        if arnm_spawn(Some(main_trampoline), std::ptr::null_mut(), 0).is_null() {
            log::error!("bootstrap: failed to spawn the main process");
            arnm_shutdown();
            return 1;
        }
        arnm_run();
        arnm_shutdown();
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::mailbox::Mailbox;

    #[test]
    fn arc_abi_roundtrip() {
        let obj = arnm_alloc(24, None);
        assert!(!obj.is_null());
        assert_eq!(arnm_refcount(obj), 1);
        arnm_retain(obj);
        assert_eq!(arnm_refcount(obj), 2);
        arnm_release(obj);
        assert_eq!(arnm_refcount(obj), 1);
        arnm_release(obj);
    }

    #[test]
    fn arc_abi_tolerates_null() {
        arnm_retain(std::ptr::null_mut());
        arnm_release(std::ptr::null_mut());
        assert_eq!(arnm_refcount(std::ptr::null_mut()), 0);
    }

    #[test]
    fn message_accessors_read_the_envelope() {
        let mbox = Mailbox::new().unwrap();
        let payload = [9u8, 8, 7];
        mbox.send(42, payload.as_ptr(), payload.len()).unwrap();
        let msg = mbox.try_receive().unwrap() as *mut c_void;

        assert_eq!(arnm_message_tag(msg), 42);
        assert_eq!(arnm_message_size(msg), 3);
        let data = arnm_message_data(msg) as *const u8;
        let bytes = unsafe { std::slice::from_raw_parts(data, 3) };
        assert_eq!(bytes, &payload[..]);
        arnm_message_free(msg);
    }

    #[test]
    fn message_accessors_tolerate_null() {
        assert_eq!(arnm_message_tag(std::ptr::null_mut()), 0);
        assert_eq!(arnm_message_size(std::ptr::null_mut()), 0);
        assert!(arnm_message_data(std::ptr::null_mut()).is_null());
        arnm_message_free(std::ptr::null_mut());
    }

    #[test]
    fn send_to_null_target_fails_cleanly() {
        assert_eq!(arnm_send(std::ptr::null_mut(), 1, std::ptr::null(), 0), -1);
    }

    #[test]
    fn pid_of_null_handle_is_zero() {
        assert_eq!(arnm_pid(std::ptr::null_mut()), 0);
    }

    #[test]
    fn self_outside_a_process_is_null() {
        assert!(arnm_self().is_null());
        assert!(arnm_try_receive().is_null());
    }
}
