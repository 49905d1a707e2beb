// ============================================================================
// Transaction Coordination Module
// ============================================================================
//
// Gives every backend the same contract: run caller work as one isolated,
// non-interleaving transaction.
//
// - Trusted backends:  pass-through to the native transaction primitive
// - Manual backends:   BEGIN/COMMIT/ROLLBACK framing, bounded retry of
//                      contention failures, FIFO admission queue
//
// ============================================================================

pub mod backend;
pub mod coordinator;
pub mod options;
pub mod queue;

pub use backend::{NativeCallback, NativeTransactions, StatementExecutor};
pub use coordinator::{AnyCoordinator, Coordinator, FramedCoordinator, NativeCoordinator};
pub use options::{
    BackendKind, CONTENTION_PATTERNS, CoordinatorConfig, LockingMode, TransactionOptions,
};
pub use queue::AdmissionQueue;
