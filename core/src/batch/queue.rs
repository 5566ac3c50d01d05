//! Operation queue
//!
//! Operations for one batch are kept in replay order. Every operation that
//! reports a result is given the next result index when it is queued; the
//! commit engine hands out codes in the same order when it replays them.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::AsyncTxnOrder;
use crate::engine::DbId;
use crate::env::{TxnOutcome, WriteTxn};
use crate::error::{StoreError, StoreResult};

/// Raw version value meaning "the key must not exist"
pub const NO_EXIST_VERSION: f64 = -4.2434325325532E-199;

/// Compare the version currently stored with an expected one.
///
/// `expected == None` means the key must not exist.
pub fn matches(previous: Option<f64>, expected: Option<f64>) -> bool {
    match (previous, expected) {
        (Some(prev), Some(want)) => prev == want,
        (Some(_), None) => false,
        (None, want) => want.is_none(),
    }
}

/// Version guard on one key
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum VersionCondition {
    #[default]
    Unconditional,
    MustNotExist,
    MustEqual(f64),
}

impl VersionCondition {
    pub fn matches(&self, previous: Option<f64>) -> bool {
        match self {
            VersionCondition::Unconditional => true,
            VersionCondition::MustNotExist => matches(previous, None),
            VersionCondition::MustEqual(v) => matches(previous, Some(*v)),
        }
    }

    /// `None` is no condition and [`NO_EXIST_VERSION`] is "must not exist".
    pub fn from_raw(raw: Option<f64>) -> Self {
        match raw {
            None => VersionCondition::Unconditional,
            Some(v) if v == NO_EXIST_VERSION => VersionCondition::MustNotExist,
            Some(v) => VersionCondition::MustEqual(v),
        }
    }

    pub fn to_raw(&self) -> Option<f64> {
        match self {
            VersionCondition::Unconditional => None,
            VersionCondition::MustNotExist => Some(NO_EXIST_VERSION),
            VersionCondition::MustEqual(v) => Some(*v),
        }
    }
}

/// One queued entry, as replayed by the commit engine
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Following entries target this database
    SwitchDb(DbId),
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        version: Option<f64>,
    },
    /// Remove a key, or a single value when given
    Remove {
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    },
    /// Entries up to the matching `EndGuard` only apply if the condition holds
    Guard {
        key: Vec<u8>,
        condition: VersionCondition,
    },
    EndGuard,
    /// Clear the current database, or delete it outright when `delete` is set
    Drop {
        delete: bool,
    },
    /// Position of a strictly ordered set of asynchronous transactions
    AsyncSlot,
}

impl Operation {
    /// Whether replaying this entry produces a result code
    pub fn has_result(&self) -> bool {
        matches!(
            self,
            Operation::Put { .. }
                | Operation::Remove { .. }
                | Operation::Guard { .. }
                | Operation::Drop { .. }
        )
    }

    fn payload_len(&self) -> usize {
        match self {
            Operation::Put { key, value, .. } => key.len() + value.len(),
            Operation::Remove { key, value } => key.len() + value.as_ref().map_or(0, Vec::len),
            Operation::Guard { key, .. } => key.len(),
            _ => 0,
        }
    }
}

pub(crate) type TxnCallback =
    Arc<dyn Fn(WriteTxn) -> BoxFuture<'static, StoreResult<TxnOutcome<()>>> + Send + Sync>;

/// An asynchronous transaction waiting for its batch
pub(crate) struct UserTxn {
    pub run: TxnCallback,
    pub as_child: bool,
    pub failure: Arc<Mutex<Option<StoreError>>>,
}

impl UserTxn {
    pub fn fail(&self, error: StoreError) {
        *self.failure.lock() = Some(error);
    }

    pub fn clear(&self) {
        *self.failure.lock() = None;
    }
}

/// Saved queue position, used to drop a half-built conditional block
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueMark {
    entries: usize,
    results: usize,
    bytes: usize,
    active_db: Option<DbId>,
}

pub struct OperationQueue {
    entries: Vec<Operation>,
    results: usize,
    bytes: usize,
    active_db: Option<DbId>,
    order: AsyncTxnOrder,
    leading: Vec<UserTxn>,
    slots: Vec<Vec<UserTxn>>,
    trailing: Vec<UserTxn>,
}

impl OperationQueue {
    pub fn new(order: AsyncTxnOrder) -> Self {
        Self {
            entries: Vec::new(),
            results: 0,
            bytes: 0,
            active_db: None,
            order,
            leading: Vec::new(),
            slots: Vec::new(),
            trailing: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[Operation] {
        &self.entries
    }

    /// Number of result codes a replay produces
    pub fn result_count(&self) -> usize {
        self.results
    }

    /// Bytes of keys and values queued
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn txn_count(&self) -> usize {
        self.leading.len() + self.trailing.len() + self.slots.iter().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.txn_count() == 0
    }

    pub(crate) fn leading(&self) -> &[UserTxn] {
        &self.leading
    }

    pub(crate) fn slot(&self, index: usize) -> &[UserTxn] {
        self.slots.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn trailing(&self) -> &[UserTxn] {
        &self.trailing
    }

    pub(crate) fn user_txns(&self) -> impl Iterator<Item = &UserTxn> {
        self.leading
            .iter()
            .chain(self.slots.iter().flatten())
            .chain(self.trailing.iter())
    }

    fn select_db(&mut self, db: DbId) {
        if self.active_db != Some(db) {
            self.entries.push(Operation::SwitchDb(db));
            self.active_db = Some(db);
        }
    }

    fn push(&mut self, db: DbId, op: Operation) -> usize {
        self.select_db(db);
        self.bytes += op.payload_len();
        let index = self.results;
        if op.has_result() {
            self.results += 1;
        }
        self.entries.push(op);
        index
    }

    pub fn push_put(&mut self, db: DbId, key: Vec<u8>, value: Vec<u8>, version: Option<f64>) -> usize {
        self.push(db, Operation::Put {
            key,
            value,
            version,
        })
    }

    pub fn push_remove(&mut self, db: DbId, key: Vec<u8>, value: Option<Vec<u8>>) -> usize {
        self.push(db, Operation::Remove { key, value })
    }

    /// Open a guarded block. Must be closed with [`OperationQueue::push_end_guard`].
    pub fn push_guard(&mut self, db: DbId, key: Vec<u8>, condition: VersionCondition) -> usize {
        self.push(db, Operation::Guard { key, condition })
    }

    pub fn push_end_guard(&mut self) {
        self.entries.push(Operation::EndGuard);
    }

    pub fn push_drop(&mut self, db: DbId, delete: bool) -> usize {
        self.push(db, Operation::Drop { delete })
    }

    /// Queue an asynchronous transaction according to the ordering policy.
    pub(crate) fn push_txn(&mut self, txn: UserTxn) {
        match self.order {
            AsyncTxnOrder::After => self.trailing.push(txn),
            AsyncTxnOrder::Before => self.leading.push(txn),
            AsyncTxnOrder::Strict => {
                if matches!(self.entries.last(), Some(Operation::AsyncSlot)) {
                    if let Some(slot) = self.slots.last_mut() {
                        slot.push(txn);
                        return;
                    }
                }
                self.entries.push(Operation::AsyncSlot);
                self.slots.push(vec![txn]);
            }
        }
    }

    pub(crate) fn mark(&self) -> QueueMark {
        QueueMark {
            entries: self.entries.len(),
            results: self.results,
            bytes: self.bytes,
            active_db: self.active_db,
        }
    }

    pub(crate) fn rollback_to(&mut self, mark: QueueMark) {
        self.entries.truncate(mark.entries);
        self.results = mark.results;
        self.bytes = mark.bytes;
        self.active_db = mark.active_db;
    }
}
