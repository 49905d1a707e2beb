// ============================================================================
// Admission Queue
// ============================================================================
//
// FIFO serializer: at most one enqueued task runs at a time, and tasks start
// in the order they were enqueued. Built on tokio's Mutex, whose waiters are
// granted the lock strictly in arrival order.
//
// ============================================================================

use lazy_static::lazy_static;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::trace;

lazy_static! {
    static ref GLOBAL_QUEUE: Arc<AdmissionQueue> = Arc::new(AdmissionQueue::new());
}

#[derive(Debug, Default)]
pub struct AdmissionQueue {
    gate: Mutex<()>,
    next_ticket: AtomicU64,
    pending: AtomicUsize,
}

/// Keeps the pending gauge right even when a waiter is dropped mid-queue.
struct PendingSlot<'a>(&'a AtomicUsize);

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide queue, created on first use.
    ///
    /// Backends that cannot key a queue to their connection serialize all of
    /// their framed transactions through this one.
    pub fn global() -> &'static Arc<AdmissionQueue> {
        &GLOBAL_QUEUE
    }

    /// Waits for this task's turn, then runs it.
    ///
    /// The task's output goes back to this caller only, so a failing task
    /// never affects the ones queued behind it.
    pub async fn enqueue<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _slot = PendingSlot(&self.pending);

        trace!(ticket, "Waiting for admission");
        let _turn = self.gate.lock().await;
        trace!(ticket, "Admitted");

        task().await
    }

    /// Tasks enqueued and not yet finished, the running one included
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}
