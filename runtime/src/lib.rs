// =============================================================================
// ARNm Runtime — crate root
// =============================================================================

//! The runtime core of the ARNm actor language: a userland M:N scheduler,
//! lightweight processes with their own guard-paged stacks and saved CPU
//! contexts, lock-free MPSC mailboxes, and reference-counted memory.
//!
//! Compiled ARNm programs link against this crate's `staticlib` and call
//! the flat C ABI in [`abi`] (`arnm_init`, `arnm_spawn`, `arnm_send`, …).
//! Rust callers — the test suite, future tooling — use the typed surface
//! instead: build a [`task::scheduler::Scheduler`], spawn processes, and
//! drive them with the process-side entry points in [`task::scheduler`].
//!
//! ```no_run
//! use std::ffi::c_void;
//! use arnm_runtime::task::scheduler::Scheduler;
//!
//! extern "C" fn hello(_arg: *mut c_void) {
//!     arnm_runtime::abi::arnm_print_int(42);
//! }
//!
//! let sched = Scheduler::new(0); // one worker per core
//! sched.spawn(hello, std::ptr::null_mut(), 0, 0).unwrap();
//! sched.run(); // returns when every process has finished
//! ```

pub mod abi;
pub mod memory;
pub mod sync;
pub mod task;
pub mod util;

pub use task::process::{Pid, ProcessRef, ProcessState};
pub use task::scheduler::{Scheduler, MAX_WORKERS};
