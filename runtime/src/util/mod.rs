// =============================================================================
// ARNm Runtime — Utilities
// =============================================================================
//
// Shared utilities used across the entire runtime.
// These are deliberately minimal — just the essentials.
//
//   diag.rs — the [ARNM ...] diagnostic backend for the `log` facade,
//             plus the hard-invariant abort path
// =============================================================================

pub mod diag;
