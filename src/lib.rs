// ============================================================================
// robust-tx Library
// ============================================================================
//
// Serializable, non-interleaving transactions over backends whose own
// isolation cannot be trusted.
//
// - backoff:      bounded, jittered exponential retry of classifiable failures
// - transaction:  coordinators that frame, retry and serialize caller work
// - memory:       in-process reference backend implementing both capabilities
//
// ============================================================================

pub mod backoff;
pub mod core;
pub mod memory;
pub mod transaction;

// Re-export main types for convenience
pub use backoff::{RetryBudget, RetryConfig, retry};
pub use crate::core::{Result, TxError, failure_chain};
pub use transaction::{
    AdmissionQueue, AnyCoordinator, BackendKind, Coordinator, CoordinatorConfig,
    FramedCoordinator, LockingMode, NativeCallback, NativeCoordinator, NativeTransactions,
    StatementExecutor, TransactionOptions,
};
