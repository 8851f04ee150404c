// =============================================================================
// ARNm Runtime — Memory Subsystem
// =============================================================================
//
// The memory subsystem manages the runtime's three allocation shapes:
//
//   stack.rs — per-process stacks: anonymous page mappings with a
//              no-access guard page below the usable region
//   arc.rs   — reference-counted heap objects with destructor hooks,
//              the lifetime policy for everything compiled code allocates
//   pool.rs  — a fixed-block free list, one per OS thread, reused for
//              hot-path nodes (mailbox envelopes)
//
// This module only exposes what's needed. Internal details stay private.
// =============================================================================

pub mod arc;
pub mod pool;
pub mod stack;
