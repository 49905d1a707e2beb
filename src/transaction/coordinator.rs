// ============================================================================
// Transaction Coordinators
// ============================================================================

use super::backend::{NativeCallback, NativeTransactions, StatementExecutor};
use super::options::{BackendKind, CoordinatorConfig, TransactionOptions};
use super::queue::AdmissionQueue;
use crate::backoff::{RetryBudget, retry};
use crate::core::{Result, TxError};
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

const COMMIT: &str = "COMMIT";
const ROLLBACK: &str = "ROLLBACK";

/// Uniform "run this work as one isolated transaction" contract.
///
/// `work` may be invoked more than once when a framed transaction is retried,
/// so it must be safe to re-run from scratch.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Handle passed to `work` for issuing queries inside the transaction
    type Handle: Send + 'static;

    async fn transaction<T, F, Fut>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Self::Handle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static;
}

// ----------------------------------------------------------------------------
// Trusted backends
// ----------------------------------------------------------------------------

/// Pass-through for backends whose native transactions isolate correctly.
pub struct NativeCoordinator<B> {
    backend: B,
}

impl<B: NativeTransactions> NativeCoordinator<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[async_trait]
impl<B: NativeTransactions> Coordinator for NativeCoordinator<B> {
    type Handle = B::Handle;

    async fn transaction<T, F, Fut>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Self::Handle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        // The native primitive only reports commit/rollback; the work's own
        // value or failure travels back through the channel.
        let (sender, receiver) = oneshot::channel::<Result<T>>();
        let callback: NativeCallback<B::Handle> = Box::new(move |handle| {
            async move {
                match work(handle).await {
                    Ok(value) => {
                        let _ = sender.send(Ok(value));
                        Ok(())
                    }
                    Err(err) => {
                        let _ = sender.send(Err(err));
                        Err(TxError::WorkAborted)
                    }
                }
            }
            .boxed()
        });

        let outcome = self.backend.transaction(callback).await;
        match (receiver.await, outcome) {
            (Ok(Ok(value)), Ok(())) => Ok(value),
            (Ok(Err(work_err)), _) => Err(work_err),
            (Ok(Ok(_)), Err(commit_err)) => Err(commit_err),
            (Err(_), Err(err)) => Err(err),
            (Err(_), Ok(())) => Err(TxError::NativeBridge),
        }
    }
}

// ----------------------------------------------------------------------------
// Manual-framing backends
// ----------------------------------------------------------------------------

/// Frames work in explicit BEGIN/COMMIT/ROLLBACK, retries contention
/// failures within the busy timeout, and admits one transaction at a time.
///
/// # Examples
///
/// ```
/// # use robust_tx::{Coordinator, FramedCoordinator, TransactionOptions, LockingMode};
/// # use robust_tx::memory::MemoryStore;
/// # use serde_json::json;
/// # #[tokio::main]
/// # async fn main() -> robust_tx::Result<()> {
/// let store = MemoryStore::new();
/// let coordinator = FramedCoordinator::new(
///     store.clone(),
///     TransactionOptions::new().locking_mode(LockingMode::Immediate),
/// )?;
///
/// let id = coordinator
///     .transaction(|tx: MemoryStore| async move {
///         tx.insert("users", json!({ "name": "Alice" })).await
///     })
///     .await?;
///
/// assert_eq!(store.select("users").await?[0].id, id);
/// # Ok(())
/// # }
/// ```
pub struct FramedCoordinator<B> {
    backend: B,
    options: TransactionOptions,
    budget: RetryBudget,
    begin: String,
    queue: Arc<AdmissionQueue>,
}

impl<B: StatementExecutor + Clone> FramedCoordinator<B> {
    pub fn new(backend: B, options: TransactionOptions) -> Result<Self> {
        options.validate()?;
        let budget = options.retry_budget()?;
        let begin = options.locking_mode.begin_statement();
        let queue = backend.admission_queue();

        Ok(Self {
            backend,
            options,
            budget,
            begin,
            queue,
        })
    }

    /// Serialize through `queue` instead of the connection's own.
    ///
    /// Only safe when every coordinator on the same connection uses it too.
    pub fn with_queue(self, queue: Arc<AdmissionQueue>) -> Self {
        Self { queue, ..self }
    }

    /// The admission queue: the connection's, unless one was injected
    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    /// One BEGIN → work → COMMIT cycle, rolled back on any failure after BEGIN.
    async fn attempt<T, F, Fut>(&self, work: &F) -> Result<T>
    where
        F: Fn(B) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.backend.execute(&self.begin).await?;
        debug!(statement = %self.begin, "Transaction opened");

        let outcome = match work(self.backend.clone()).await {
            Ok(value) => self.backend.execute(COMMIT).await.map(|()| value),
            Err(err) => Err(err),
        };

        let err = match outcome {
            Ok(value) => {
                debug!("Transaction committed");
                return Ok(value);
            }
            Err(err) => err,
        };

        match self.backend.execute(ROLLBACK).await {
            Ok(()) => {
                debug!(error = %err, "Transaction rolled back");
                Err(err)
            }
            Err(rollback) => {
                warn!(error = %err, rollback = %rollback, "Rollback failed");
                Err(TxError::Rollback {
                    source: Box::new(err),
                    rollback: Box::new(rollback),
                })
            }
        }
    }
}

#[async_trait]
impl<B: StatementExecutor + Clone> Coordinator for FramedCoordinator<B> {
    type Handle = B;

    async fn transaction<T, F, Fut>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Self::Handle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let work = &work;
        let budget = &self.budget;
        let run = move || retry(move || self.attempt(work), budget);

        if self.options.bypass_admission_queue {
            run().await
        } else {
            self.queue().enqueue(run).await
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration-selected coordinator
// ----------------------------------------------------------------------------

/// Either coordinator, chosen once from a [`CoordinatorConfig`] for backends
/// that implement both capabilities.
pub enum AnyCoordinator<B> {
    Native(NativeCoordinator<B>),
    Framed(FramedCoordinator<B>),
}

impl<B> AnyCoordinator<B>
where
    B: NativeTransactions<Handle = B> + StatementExecutor + Clone,
{
    pub fn from_config(backend: B, config: &CoordinatorConfig) -> Result<Self> {
        config.validate()?;
        match config.backend {
            BackendKind::Trusted => Ok(Self::Native(NativeCoordinator::new(backend))),
            BackendKind::Manual => Ok(Self::Framed(FramedCoordinator::new(
                backend,
                config.transaction.clone(),
            )?)),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            AnyCoordinator::Native(_) => BackendKind::Trusted,
            AnyCoordinator::Framed(_) => BackendKind::Manual,
        }
    }
}

#[async_trait]
impl<B> Coordinator for AnyCoordinator<B>
where
    B: NativeTransactions<Handle = B> + StatementExecutor + Clone,
{
    type Handle = B;

    async fn transaction<T, F, Fut>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Self::Handle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        match self {
            AnyCoordinator::Native(coordinator) => coordinator.transaction(work).await,
            AnyCoordinator::Framed(coordinator) => coordinator.transaction(work).await,
        }
    }
}
