//! Read snapshots
//!
//! Most lookups share one read transaction. It is begun lazily, renewed on
//! the first access after it was reset and reset again once the environment
//! has been idle for a tick. A snapshot that still has open cursors is never
//! reset underneath them: it is detached instead and lives until the last
//! cursor goes away.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

use super::EnvInner;
use super::key_buffer::{Key, encode_key};
use super::store::{Entry, Store};
use crate::codec::Codec;
use crate::engine::{EngineResult, SessionId, StorageEngine, TxnId, TxnKind};
use crate::error::{StoreError, StoreResult};

/// One engine read transaction. Aborted when the last reference drops.
pub(crate) struct ReadTxnHandle {
    engine: Arc<dyn StorageEngine>,
    txn: TxnId,
    cursors: AtomicUsize,
}

impl ReadTxnHandle {
    pub fn begin(engine: &Arc<dyn StorageEngine>, session: SessionId) -> EngineResult<Arc<Self>> {
        let txn = engine.begin_txn(TxnKind::Read(session))?;
        Ok(Arc::new(Self {
            engine: Arc::clone(engine),
            txn,
            cursors: AtomicUsize::new(0),
        }))
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn cursors(&self) -> usize {
        self.cursors.load(Ordering::Acquire)
    }

    /// Register a cursor on this transaction.
    pub fn pin(self: &Arc<Self>) -> CursorPin {
        self.cursors.fetch_add(1, Ordering::AcqRel);
        CursorPin {
            handle: Arc::clone(self),
        }
    }
}

impl Drop for ReadTxnHandle {
    fn drop(&mut self) {
        let _ = self.engine.abort(self.txn);
    }
}

/// Keeps a read transaction alive and marked as in use by a cursor
pub(crate) struct CursorPin {
    handle: Arc<ReadTxnHandle>,
}

impl CursorPin {
    pub fn txn(&self) -> TxnId {
        self.handle.txn()
    }
}

impl Drop for CursorPin {
    fn drop(&mut self) {
        self.handle.cursors.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Owner of the shared read transaction
pub(crate) struct SnapshotManager {
    current: Option<Arc<ReadTxnHandle>>,
    renewed: bool,
    epoch: u64,
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self {
            current: None,
            renewed: false,
            epoch: 0,
        }
    }

    /// The shared read transaction, renewed or begun as needed.
    ///
    /// Returns the epoch of a new active period when one started; the
    /// caller should arrange an idle reset for it.
    pub fn acquire(
        &mut self,
        engine: &Arc<dyn StorageEngine>,
        session: SessionId,
    ) -> EngineResult<(Arc<ReadTxnHandle>, Option<u64>)> {
        if let Some(handle) = &self.current {
            if self.renewed {
                return Ok((Arc::clone(handle), None));
            }
            match engine.renew_read_txn(handle.txn()) {
                Ok(()) => {
                    let handle = Arc::clone(handle);
                    return Ok((handle, Some(self.start_period())));
                }
                Err(e) => {
                    debug!("Read transaction could not be renewed ({}), beginning a new one", e);
                    self.current = None;
                }
            }
        }

        let handle = ReadTxnHandle::begin(engine, session)?;
        self.current = Some(Arc::clone(&handle));
        Ok((handle, Some(self.start_period())))
    }

    fn start_period(&mut self) -> u64 {
        self.renewed = true;
        self.epoch += 1;
        self.epoch
    }

    /// Release the snapshot so the next access observes new commits.
    pub fn reset(&mut self, engine: &dyn StorageEngine) {
        if let Some(handle) = &self.current {
            if handle.cursors() > 0 {
                debug!("Detaching read transaction with {} open cursors", handle.cursors());
                self.current = None;
            } else if self.renewed {
                if engine.reset_read_txn(handle.txn()).is_err() {
                    self.current = None;
                }
            }
        }
        self.renewed = false;
        self.epoch += 1;
    }

    /// Reset only if no access happened since `epoch` started.
    pub fn reset_if_idle(&mut self, engine: &dyn StorageEngine, epoch: u64) -> bool {
        if self.epoch != epoch {
            return false;
        }
        self.reset(engine);
        true
    }

    /// Drop the shared transaction entirely, after a fatal engine error.
    pub fn abort(&mut self) {
        self.current = None;
        self.renewed = false;
        self.epoch += 1;
    }

    pub fn is_active(&self) -> bool {
        self.renewed && self.current.is_some()
    }
}

/// A dedicated read transaction, isolated from later commits for as long
/// as it is held.
pub struct Snapshot {
    env: Arc<EnvInner>,
    handle: Arc<ReadTxnHandle>,
}

impl Snapshot {
    pub(crate) fn new(env: Arc<EnvInner>, handle: Arc<ReadTxnHandle>) -> Self {
        Self { env, handle }
    }

    pub fn get<C: Codec, K: Key + ?Sized>(
        &self,
        store: &Store<C>,
        key: &K,
    ) -> StoreResult<Option<C::Value>> {
        Ok(self.get_entry(store, key)?.map(|entry| entry.value))
    }

    pub fn get_entry<C: Codec, K: Key + ?Sized>(
        &self,
        store: &Store<C>,
        key: &K,
    ) -> StoreResult<Option<Entry<C::Value>>> {
        if !Arc::ptr_eq(&self.env, &store.env) {
            return Err(StoreError::Transaction(
                "store belongs to another environment".into(),
            ));
        }
        let key = encode_key(key)?;
        let location = self
            .env
            .engine
            .get(self.handle.txn(), store.db, &key)
            .map_err(|e| self.env.read_error(store.db, e))?;

        let Some(location) = location else {
            return Ok(None);
        };
        let mut windows = self.env.windows.lock();
        let view = windows.view(self.env.engine.as_ref(), &location)?;
        Ok(Some(Entry {
            value: store.codec.decode(view.bytes()?)?,
            version: store.meta.use_versions.then_some(location.version),
        }))
    }
}
