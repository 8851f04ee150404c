// =============================================================================
// ARNm Runtime — Process Scheduling and Messaging
// =============================================================================
//
// The layers, leaves first:
//
//   context.rs   — ABI-level context switch and the entry trampoline
//   mailbox.rs   — the per-process lock-free MPSC message queue
//   process.rs   — the process record: PID, state, stack, mailbox, state
//   queue.rs     — intrusive run/wait queues under a ticket spinlock
//   scheduler.rs — workers, work stealing, park/wake, runtime lifecycle
// =============================================================================

pub mod context;
pub mod mailbox;
pub mod process;
pub mod queue;
pub mod scheduler;
