//! Write batching
//!
//! Writes issued between two flushes are collected in one
//! [`OperationQueue`] and committed together in a single engine write
//! transaction. The first write of a batch starts a commit timer; callers
//! get a [`CommitFuture`] that resolves once their batch has committed.

pub mod commit;
pub mod queue;
pub mod recovery;

pub use queue::{NO_EXIST_VERSION, Operation, OperationQueue, VersionCondition, matches};
pub use recovery::{Recovery, classify};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::config::AsyncTxnOrder;
use crate::engine::EngineError;
use crate::env::{EnvInner, TxnOutcome, WriteTxn};
use crate::error::{StoreError, StoreResult};
use queue::{TxnCallback, UserTxn};

/// Result code of one replayed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpStatus {
    Ok = 0,
    /// Guard failed, key missing, or skipped by an enclosing guard
    ConditionFailed = 1,
    /// Zero-length key
    InvalidKey = 3,
}

/// Result codes of a committed batch, by result index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResults {
    codes: Vec<OpStatus>,
}

impl BatchResults {
    pub(crate) fn new(codes: Vec<OpStatus>) -> Self {
        Self { codes }
    }

    pub fn codes(&self) -> &[OpStatus] {
        &self.codes
    }

    pub fn status(&self, index: usize) -> Option<OpStatus> {
        self.codes.get(index).copied()
    }

    /// Map a result code to what a caller sees.
    pub(crate) fn flag(&self, index: usize) -> StoreResult<bool> {
        match self.status(index) {
            Some(OpStatus::Ok) => Ok(true),
            Some(OpStatus::ConditionFailed) => Ok(false),
            Some(OpStatus::InvalidKey) => Err(StoreError::InvalidKey),
            None => Err(StoreError::Transaction(format!(
                "no result recorded for operation {}",
                index
            ))),
        }
    }
}

/// Why a whole batch was rejected
#[derive(Debug, Clone, PartialEq)]
pub enum BatchFailure {
    Fatal { store: String, source: EngineError },
    Exhausted { retries: usize, source: EngineError },
    /// The environment went away before the batch ran
    Closed,
}

impl From<BatchFailure> for StoreError {
    fn from(failure: BatchFailure) -> Self {
        match failure {
            BatchFailure::Fatal { store, source } => StoreError::EngineFatal { store, source },
            BatchFailure::Exhausted { retries, source } => {
                StoreError::ResourceExhausted { retries, source }
            }
            BatchFailure::Closed => StoreError::Closed,
        }
    }
}

pub(crate) type BatchOutcome = Result<Arc<BatchResults>, BatchFailure>;
pub(crate) type SharedOutcome = Shared<BoxFuture<'static, BatchOutcome>>;

/// The batch currently accepting operations
pub(crate) struct PendingBatch {
    pub id: u64,
    pub queue: OperationQueue,
    pub sender: oneshot::Sender<BatchOutcome>,
    pub outcome: SharedOutcome,
}

pub(crate) struct Scheduler {
    pending: Option<PendingBatch>,
    next_id: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            pending: None,
            next_id: 1,
        }
    }

    fn open(&mut self, order: AsyncTxnOrder) -> PendingBatch {
        let id = self.next_id;
        self.next_id += 1;
        let (sender, receiver) = oneshot::channel();
        let outcome = receiver
            .map(|received| received.unwrap_or(Err(BatchFailure::Closed)))
            .boxed()
            .shared();
        PendingBatch {
            id,
            queue: OperationQueue::new(order),
            sender,
            outcome,
        }
    }

    /// Take the pending batch, whatever it is.
    pub fn take(&mut self) -> Option<PendingBatch> {
        self.pending.take()
    }

    /// Take the pending batch only if it is batch `id`.
    pub fn take_if(&mut self, id: u64) -> Option<PendingBatch> {
        match &self.pending {
            Some(batch) if batch.id == id => self.pending.take(),
            _ => None,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .as_ref()
            .map_or(0, |batch| batch.queue.result_count() + batch.queue.txn_count())
    }
}

/// Resolves once the batch holding an operation has committed.
#[must_use = "writes are queued either way; await the future to see the result"]
pub struct CommitFuture<T> {
    inner: BoxFuture<'static, StoreResult<T>>,
}

impl<T> CommitFuture<T> {
    pub(crate) fn new(future: impl Future<Output = StoreResult<T>> + Send + 'static) -> Self {
        Self {
            inner: future.boxed(),
        }
    }
}

impl<T> Future for CommitFuture<T> {
    type Output = StoreResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl EnvInner {
    /// Add operations to the pending batch, opening one (and starting its
    /// commit timer) if there is none.
    pub(crate) fn enqueue<T>(
        self: &Arc<Self>,
        delay: Duration,
        build: impl FnOnce(&mut OperationQueue) -> StoreResult<T>,
    ) -> StoreResult<(T, SharedOutcome)> {
        self.ensure_open()?;
        let mut scheduler = self.scheduler.lock();

        let batch = match scheduler.pending.take() {
            Some(batch) => batch,
            None => {
                let runtime = Handle::try_current().map_err(|_| StoreError::NoRuntime)?;
                let batch = scheduler.open(self.config.async_txn_order);
                self.spawn_commit_timer(&runtime, batch.id, delay);
                batch
            }
        };
        let batch = scheduler.pending.insert(batch);

        let value = build(&mut batch.queue)?;
        Ok((value, batch.outcome.clone()))
    }

    fn spawn_commit_timer(self: &Arc<Self>, runtime: &Handle, id: u64, delay: Duration) {
        let env = Arc::downgrade(self);
        runtime.spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            let Some(env) = env.upgrade() else {
                return;
            };
            let batch = env.scheduler.lock().take_if(id);
            if let Some(batch) = batch {
                commit::flush_batch(&env, batch).await;
            }
        });
    }

    /// Commit `batch` on its own task. Its callers are answered through the
    /// batch outcome whether or not anyone is still waiting here.
    pub(crate) fn spawn_flush(self: &Arc<Self>, batch: PendingBatch) -> StoreResult<()> {
        let runtime = Handle::try_current().map_err(|_| StoreError::NoRuntime)?;
        let env = Arc::clone(self);
        runtime.spawn(async move {
            commit::flush_batch(&env, batch).await;
        });
        Ok(())
    }

    /// Queue an asynchronous transaction callback.
    pub(crate) fn enqueue_txn<R, F, Fut>(
        self: &Arc<Self>,
        delay: Duration,
        as_child: bool,
        f: F,
    ) -> StoreResult<CommitFuture<TxnOutcome<R>>>
    where
        F: Fn(WriteTxn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StoreResult<TxnOutcome<R>>> + Send + 'static,
        R: Send + 'static,
    {
        let value: Arc<Mutex<Option<TxnOutcome<R>>>> = Arc::new(Mutex::new(None));
        let failure = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&value);
        let run: TxnCallback = Arc::new(move |txn: WriteTxn| {
            *slot.lock() = None;
            let slot = Arc::clone(&slot);
            let pending = f(txn);
            async move {
                let (marker, outcome) = match pending.await? {
                    TxnOutcome::Commit(result) => (TxnOutcome::Commit(()), TxnOutcome::Commit(result)),
                    TxnOutcome::Abort => (TxnOutcome::Abort, TxnOutcome::Abort),
                };
                *slot.lock() = Some(outcome);
                Ok::<_, StoreError>(marker)
            }
            .boxed()
        });

        let txn = UserTxn {
            run,
            as_child,
            failure: Arc::clone(&failure),
        };
        let ((), outcome) = self.enqueue(delay, |queue| {
            queue.push_txn(txn);
            Ok(())
        })?;

        Ok(CommitFuture::new(async move {
            outcome.await?;
            if let Some(error) = failure.lock().take() {
                return Err(error);
            }
            value.lock().take().ok_or_else(|| {
                StoreError::Transaction("transaction callback did not complete".into())
            })
        }))
    }
}
