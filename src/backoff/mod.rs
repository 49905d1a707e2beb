// ============================================================================
// Backoff Module
// ============================================================================
//
// Generic retry executor: bounded by attempts and wall-clock time, filtered
// by an optional allow-list of failure patterns, paced by jittered
// exponential delays.
//
// ============================================================================

pub mod budget;
pub mod engine;

pub use budget::{RetryBudget, RetryConfig};
pub use engine::{BASE_DELAY_MS, MAX_DELAY_MS, backoff_delay_ms, jitter, retry};
