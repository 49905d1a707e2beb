// ============================================================================
// Backend Capabilities
// ============================================================================
//
// A backend adapter offers exactly one of two transaction capabilities:
//
// - StatementExecutor:   raw statements only; the coordinator frames work in
//                        BEGIN/COMMIT/ROLLBACK and serializes it itself
// - NativeTransactions:  a callback-style transaction primitive that already
//                        isolates correctly
//
// ============================================================================

use super::queue::AdmissionQueue;
use crate::core::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Callback handed to a native transaction primitive.
///
/// Returning `Err` asks the backend to roll back.
pub type NativeCallback<H> = Box<dyn FnOnce(H) -> BoxFuture<'static, Result<()>> + Send>;

/// Manual-framing capability.
#[async_trait]
pub trait StatementExecutor: Send + Sync + 'static {
    /// Execute a raw statement such as `BEGIN IMMEDIATE`, `COMMIT` or `ROLLBACK`
    async fn execute(&self, statement: &str) -> Result<()>;

    /// Queue that serializes framed transactions on this connection.
    ///
    /// Every clone of one connection must return the same queue. The default
    /// is the process-wide queue; adapters that can tell their connections
    /// apart may key a queue to each one.
    fn admission_queue(&self) -> Arc<AdmissionQueue> {
        Arc::clone(AdmissionQueue::global())
    }
}

/// Trusted native transaction capability.
#[async_trait]
pub trait NativeTransactions: Send + Sync + 'static {
    /// Transactional handle passed to the callback
    type Handle: Send + 'static;

    /// Run `callback` inside one native transaction, committing when it
    /// returns `Ok` and rolling back otherwise.
    async fn transaction(&self, callback: NativeCallback<Self::Handle>) -> Result<()>;
}
