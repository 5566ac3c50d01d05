//! Batch commit engine
//!
//! A flush replays the queued operations of one batch inside a single
//! engine write transaction. Replay is driven by a small state machine:
//! synchronous operations are applied until the next slot of asynchronous
//! transactions, the slot's callbacks are awaited, and so on until the
//! queue is drained and the transaction commits. Retryable engine failures
//! abort the transaction and replay the whole batch.

use futures::future::{BoxFuture, join_all};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, error, warn};

use super::queue::{Operation, OperationQueue, UserTxn};
use super::recovery::{Recovery, classify, is_retryable};
use super::{BatchFailure, BatchOutcome, BatchResults, OpStatus, PendingBatch};
use crate::engine::{DbId, EngineError, EngineResult, StorageEngine, TxnId, TxnKind};
use crate::env::{EnvInner, TxnOutcome, WriteTxn};
use crate::error::StoreResult;

/// Which set of asynchronous transactions to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnSet {
    Leading,
    Slot(usize),
    Trailing,
}

#[derive(Debug)]
enum FlushState {
    ApplySync,
    AwaitUserCallback(TxnSet),
    ApplyNextSlot,
    Commit,
    Rollback(EngineError),
}

enum Step {
    /// Stopped at a slot of asynchronous transactions
    Slot,
    End,
}

/// Engine failure that ended an attempt, with the database it hit
struct Failure {
    error: EngineError,
    db: Option<DbId>,
}

/// Replays synchronous operations and tracks guard nesting
struct Applier {
    codes: Vec<OpStatus>,
    db: DbId,
    depth: usize,
    validated: usize,
}

impl Applier {
    fn new(capacity: usize) -> Self {
        Self {
            codes: Vec::with_capacity(capacity),
            db: DbId(0),
            depth: 0,
            validated: 0,
        }
    }

    /// Negative engine answers become result codes; anything else fails the
    /// attempt.
    fn status(result: EngineResult<bool>) -> Result<OpStatus, EngineError> {
        match result {
            Ok(true) => Ok(OpStatus::Ok),
            Ok(false) => Ok(OpStatus::ConditionFailed),
            Err(EngineError::BadKey(_)) => Ok(OpStatus::InvalidKey),
            Err(e) if classify(&e) == Recovery::NotAnError => Ok(OpStatus::ConditionFailed),
            Err(e) => Err(e),
        }
    }

    fn apply_until_slot(
        &mut self,
        engine: &dyn StorageEngine,
        txn: TxnId,
        entries: &[Operation],
        cursor: &mut usize,
    ) -> Result<Step, EngineError> {
        while let Some(op) = entries.get(*cursor) {
            *cursor += 1;
            if let Operation::AsyncSlot = op {
                return Ok(Step::Slot);
            }
            self.apply(engine, txn, op)?;
        }
        Ok(Step::End)
    }

    fn apply(&mut self, engine: &dyn StorageEngine, txn: TxnId, op: &Operation) -> Result<(), EngineError> {
        let live = self.depth == self.validated;
        let db = self.db;

        let status = match op {
            Operation::SwitchDb(next) => {
                self.db = *next;
                return Ok(());
            }
            Operation::EndGuard => {
                self.depth = self.depth.saturating_sub(1);
                if self.validated > self.depth {
                    self.validated -= 1;
                }
                return Ok(());
            }
            Operation::AsyncSlot => return Ok(()),
            Operation::Guard { key, condition } => {
                let status = if live {
                    Self::status(
                        engine
                            .get(txn, db, key)
                            .map(|found| condition.matches(found.map(|loc| loc.version))),
                    )?
                } else {
                    OpStatus::ConditionFailed
                };
                self.depth += 1;
                if status == OpStatus::Ok {
                    self.validated += 1;
                }
                status
            }
            _ if !live => OpStatus::ConditionFailed,
            Operation::Put {
                key,
                value,
                version,
            } => Self::status(engine.put(txn, db, key, value, *version).map(|()| true))?,
            Operation::Remove { key, value } => {
                Self::status(engine.delete(txn, db, key, value.as_deref()))?
            }
            Operation::Drop { delete } => {
                Self::status(engine.drop_db(txn, db, *delete).map(|()| true))?
            }
        };

        self.codes.push(status);
        Ok(())
    }

    fn finish(self) -> BatchResults {
        BatchResults::new(self.codes)
    }
}

/// Commit `batch` and deliver its outcome to every waiting caller. Waits
/// for any flush already in flight first.
pub(crate) async fn flush_batch(env: &Arc<EnvInner>, batch: PendingBatch) {
    let PendingBatch {
        id, queue, sender, ..
    } = batch;

    let _writer = env.commit_lock.lock().await;
    let outcome = run_batch(env, id, &queue).await;
    let _ = sender.send(outcome);
}

async fn run_batch(env: &Arc<EnvInner>, id: u64, queue: &OperationQueue) -> BatchOutcome {
    if queue.is_empty() {
        return Ok(Arc::new(BatchResults::default()));
    }

    env.notify_before_commit(queue.entries());
    let started = Instant::now();
    let mut retries = 0;

    loop {
        for txn in queue.user_txns() {
            txn.clear();
        }

        let failure = match apply_batch(env, queue).await {
            Ok(results) => {
                let elapsed = started.elapsed();
                env.finish_commit(elapsed);
                env.stats.batches.fetch_add(1, Ordering::Relaxed);
                env.stats
                    .writes
                    .fetch_add(queue.result_count() as u64, Ordering::Relaxed);
                debug!(
                    "Committed batch {}: {} operations, {} async transactions, {} bytes in {:?}",
                    id,
                    queue.result_count(),
                    queue.txn_count(),
                    queue.bytes(),
                    elapsed
                );

                let results = Arc::new(results);
                env.notify_after_commit(queue.entries(), &results);
                return Ok(results);
            }
            Err(failure) => failure,
        };

        let step = classify(&failure.error);
        match step {
            Recovery::GrowMapAndRetry | Recovery::RemapAndRetry => {
                if retries >= env.config.max_retries {
                    error!(
                        "Batch {} still failing after {} retries: {}",
                        id, retries, failure.error
                    );
                    return Err(BatchFailure::Exhausted {
                        retries,
                        source: failure.error,
                    });
                }
                retries += 1;
                env.stats.retries.fetch_add(1, Ordering::Relaxed);
                warn!("Batch {} hit {}, replaying (attempt {})", id, failure.error, retries);

                if let Err(e) = env.recover(step) {
                    return Err(fail(env, failure.db, e));
                }
            }
            _ => return Err(fail(env, failure.db, failure.error)),
        }
    }
}

fn fail(env: &EnvInner, db: Option<DbId>, source: EngineError) -> BatchFailure {
    let store = env.store_name(db);
    env.report_fatal(&store, &source);
    BatchFailure::Fatal { store, source }
}

/// Root write transaction of one attempt. Aborted on drop unless it
/// committed.
struct RootTxn<'a> {
    engine: &'a dyn StorageEngine,
    id: TxnId,
    txn: WriteTxn,
    committed: bool,
}

impl<'a> RootTxn<'a> {
    fn begin(env: &'a Arc<EnvInner>) -> EngineResult<Self> {
        let engine = env.engine.as_ref();
        let id = engine.begin_txn(TxnKind::Write)?;
        Ok(Self {
            engine,
            id,
            txn: WriteTxn::new(Arc::clone(env), id),
            committed: false,
        })
    }

    fn commit(&mut self) -> EngineResult<()> {
        self.txn.close();
        match self.engine.commit(self.id) {
            Err(e) if classify(&e) != Recovery::TreatAsSuccess => Err(e),
            _ => {
                self.committed = true;
                Ok(())
            }
        }
    }
}

impl Drop for RootTxn<'_> {
    fn drop(&mut self) {
        self.txn.close();
        if !self.committed {
            let _ = self.engine.abort(self.id);
        }
    }
}

/// One attempt: begin, replay, commit.
async fn apply_batch(env: &Arc<EnvInner>, queue: &OperationQueue) -> Result<BatchResults, Failure> {
    let engine = env.engine.as_ref();
    let mut root = RootTxn::begin(env).map_err(|error| Failure { error, db: None })?;
    let txn = root.txn.clone();

    let mut applier = Applier::new(queue.result_count());
    let mut cursor = 0;
    let mut next_slot = 0;
    let mut state = if queue.leading().is_empty() {
        FlushState::ApplySync
    } else {
        FlushState::AwaitUserCallback(TxnSet::Leading)
    };

    loop {
        state = match state {
            FlushState::ApplySync => {
                match applier.apply_until_slot(engine, root.id, queue.entries(), &mut cursor) {
                    Ok(Step::Slot) => {
                        next_slot += 1;
                        FlushState::AwaitUserCallback(TxnSet::Slot(next_slot - 1))
                    }
                    Ok(Step::End) => FlushState::ApplyNextSlot,
                    Err(e) => FlushState::Rollback(e),
                }
            }
            FlushState::AwaitUserCallback(set) => {
                let txns = match set {
                    TxnSet::Leading => queue.leading(),
                    TxnSet::Slot(index) => queue.slot(index),
                    TxnSet::Trailing => queue.trailing(),
                };
                match run_transaction_set(env, &txn, txns).await {
                    Ok(()) if set == TxnSet::Trailing => FlushState::Commit,
                    Ok(()) => FlushState::ApplySync,
                    Err(e) => FlushState::Rollback(e),
                }
            }
            FlushState::ApplyNextSlot => {
                if queue.trailing().is_empty() {
                    FlushState::Commit
                } else {
                    FlushState::AwaitUserCallback(TxnSet::Trailing)
                }
            }
            FlushState::Commit => {
                return match root.commit() {
                    Ok(()) => Ok(applier.finish()),
                    Err(error) => Err(Failure {
                        error,
                        db: Some(applier.db),
                    }),
                };
            }
            // dropping `root` aborts the transaction
            FlushState::Rollback(error) => {
                return Err(Failure {
                    error,
                    db: Some(applier.db),
                });
            }
        };
    }
}

type Pending<'a> = Vec<(&'a UserTxn, BoxFuture<'static, StoreResult<TxnOutcome<()>>>)>;

/// Run one set of asynchronous transactions. Plain callbacks share the
/// batch transaction and run concurrently; each child callback waits for
/// everything before it and gets a nested transaction of its own.
async fn run_transaction_set(
    env: &Arc<EnvInner>,
    txn: &WriteTxn,
    set: &[UserTxn],
) -> Result<(), EngineError> {
    let mut pending: Pending<'_> = Vec::new();

    for user in set {
        if !user.as_child {
            pending.push((user, (user.run)(txn.clone())));
            continue;
        }

        settle(env, txn, std::mem::take(&mut pending)).await?;

        let parent = txn.current()?;
        let child = env.engine.begin_txn(TxnKind::Child(parent))?;
        txn.enter(child);
        let result = (user.run)(txn.clone()).await;
        txn.leave();

        if let Some(poison) = txn.take_poison() {
            let _ = env.engine.abort(child);
            return Err(poison);
        }
        match result {
            Ok(TxnOutcome::Commit(())) => {
                if let Err(e) = env.engine.commit(child) {
                    if is_retryable(&e) {
                        return Err(e);
                    }
                    user.fail(e.into());
                }
            }
            Ok(TxnOutcome::Abort) => {
                let _ = env.engine.abort(child);
            }
            Err(error) => {
                let _ = env.engine.abort(child);
                if let Some(e) = error.engine_error().filter(|e| is_retryable(e)) {
                    return Err(e.clone());
                }
                debug!("Child transaction failed and was rolled back: {}", error);
                user.fail(error);
            }
        }
    }

    settle(env, txn, pending).await
}

/// Wait for plain callbacks and record their failures.
async fn settle(env: &EnvInner, txn: &WriteTxn, pending: Pending<'_>) -> Result<(), EngineError> {
    if pending.is_empty() {
        return Ok(());
    }

    let (users, futures): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
    let results = join_all(futures).await;

    if let Some(poison) = txn.take_poison() {
        return Err(poison);
    }
    for (user, result) in users.into_iter().zip(results) {
        match result {
            Ok(TxnOutcome::Commit(())) => {}
            Ok(TxnOutcome::Abort) => env.warn_abort_once(),
            Err(error) => {
                if let Some(e) = error.engine_error().filter(|e| is_retryable(e)) {
                    return Err(e.clone());
                }
                user.fail(error);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::VersionCondition;
    use crate::engine::MemEngine;
    use pretty_assertions::assert_eq;

    fn put(key: &[u8], value: &[u8]) -> Operation {
        Operation::Put {
            key: key.to_vec(),
            value: value.to_vec(),
            version: None,
        }
    }

    fn guard(key: &[u8], condition: VersionCondition) -> Operation {
        Operation::Guard {
            key: key.to_vec(),
            condition,
        }
    }

    fn replay(engine: &MemEngine, ops: &[Operation]) -> Vec<OpStatus> {
        let txn = engine.begin_txn(TxnKind::Write).unwrap();
        let mut applier = Applier::new(ops.len());
        let mut cursor = 0;
        while cursor < ops.len() {
            applier
                .apply_until_slot(engine, txn, ops, &mut cursor)
                .unwrap();
        }
        engine.commit(txn).unwrap();
        applier.finish().codes().to_vec()
    }

    #[test]
    fn test_put_remove_codes() {
        let engine = MemEngine::new(64 * 1024, 64 * 1024, 2).unwrap();
        let codes = replay(&engine, &[
            Operation::SwitchDb(DbId(0)),
            put(b"a", b"1"),
            put(b"", b"empty"),
            Operation::Remove {
                key: b"a".to_vec(),
                value: None,
            },
            Operation::Remove {
                key: b"a".to_vec(),
                value: None,
            },
        ]);
        assert_eq!(codes, vec![
            OpStatus::Ok,
            OpStatus::InvalidKey,
            OpStatus::Ok,
            OpStatus::ConditionFailed
        ]);
    }

    #[test]
    fn test_failed_guard_skips_block() {
        let engine = MemEngine::new(64 * 1024, 64 * 1024, 2).unwrap();
        let codes = replay(&engine, &[
            put(b"k", b"1"),
            guard(b"k", VersionCondition::MustNotExist),
            put(b"k", b"2"),
            put(b"other", b"x"),
            Operation::EndGuard,
            put(b"after", b"y"),
        ]);
        assert_eq!(codes, vec![
            OpStatus::Ok,
            OpStatus::ConditionFailed,
            OpStatus::ConditionFailed,
            OpStatus::ConditionFailed,
            OpStatus::Ok
        ]);
    }

    #[test]
    fn test_nested_guards() {
        let engine = MemEngine::new(64 * 1024, 64 * 1024, 2).unwrap();
        let codes = replay(&engine, &[
            guard(b"a", VersionCondition::MustNotExist),
            put(b"a", b"1"),
            // fails: "a" now exists
            guard(b"a", VersionCondition::MustNotExist),
            put(b"b", b"2"),
            Operation::EndGuard,
            // the outer block is live again
            put(b"c", b"3"),
            Operation::EndGuard,
        ]);
        assert_eq!(codes, vec![
            OpStatus::Ok,
            OpStatus::Ok,
            OpStatus::ConditionFailed,
            OpStatus::ConditionFailed,
            OpStatus::Ok
        ]);
    }

    #[test]
    fn test_version_guard() {
        let engine = MemEngine::new(64 * 1024, 64 * 1024, 2).unwrap();
        let codes = replay(&engine, &[
            Operation::Put {
                key: b"k".to_vec(),
                value: b"1".to_vec(),
                version: Some(7.0),
            },
            guard(b"k", VersionCondition::MustEqual(7.0)),
            Operation::EndGuard,
            guard(b"k", VersionCondition::MustEqual(8.0)),
            Operation::EndGuard,
        ]);
        assert_eq!(codes, vec![
            OpStatus::Ok,
            OpStatus::Ok,
            OpStatus::ConditionFailed
        ]);
    }

    #[test]
    fn test_engine_failure_stops_replay() {
        let engine = MemEngine::new(1024, 1024, 2).unwrap();
        let txn = engine.begin_txn(TxnKind::Write).unwrap();
        let mut applier = Applier::new(2);
        let mut cursor = 0;
        let ops = [put(b"a", &[0u8; 600]), put(b"b", &[0u8; 600])];

        let result = applier.apply_until_slot(&engine, txn, &ops, &mut cursor);
        assert!(matches!(result, Err(EngineError::MapFull)));
        assert_eq!(cursor, 2);
        engine.abort(txn).unwrap();
    }
}
