//! Write transactions handed to user callbacks

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::EnvInner;
use super::key_buffer::{Key, encode_key};
use super::store::{Entry, Store};
use crate::batch::VersionCondition;
use crate::batch::recovery::is_retryable;
use crate::codec::Codec;
use crate::engine::{DbId, EngineError, EngineResult, TxnId, TxnKind};
use crate::error::{StoreError, StoreResult};

/// Result of a transaction callback
#[derive(Debug, Clone, PartialEq)]
pub enum TxnOutcome<T> {
    Commit(T),
    /// Roll back the callback's own transaction
    Abort,
}

impl<T> TxnOutcome<T> {
    pub fn is_commit(&self) -> bool {
        matches!(self, TxnOutcome::Commit(_))
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            TxnOutcome::Commit(v) => Some(v),
            TxnOutcome::Abort => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TxnOutcome<U> {
        match self {
            TxnOutcome::Commit(v) => TxnOutcome::Commit(f(v)),
            TxnOutcome::Abort => TxnOutcome::Abort,
        }
    }
}

struct TxnFrame {
    /// Root transaction first, innermost child last
    stack: Vec<TxnId>,
    closed: bool,
    /// Retryable failure seen by any write; the batch must replay
    poisoned: Option<EngineError>,
}

/// Handle on the active write transaction.
///
/// Clones share the same transaction. Once the owning batch or
/// transaction has finished every call fails with
/// [`EngineError::TxnClosed`].
#[derive(Clone)]
pub struct WriteTxn {
    env: Arc<EnvInner>,
    frame: Arc<Mutex<TxnFrame>>,
}

impl WriteTxn {
    pub(crate) fn new(env: Arc<EnvInner>, root: TxnId) -> Self {
        Self {
            env,
            frame: Arc::new(Mutex::new(TxnFrame {
                stack: vec![root],
                closed: false,
                poisoned: None,
            })),
        }
    }

    /// Innermost open transaction
    pub(crate) fn current(&self) -> EngineResult<TxnId> {
        let frame = self.frame.lock();
        if frame.closed {
            return Err(EngineError::TxnClosed);
        }
        frame.stack.last().copied().ok_or(EngineError::TxnClosed)
    }

    pub(crate) fn enter(&self, child: TxnId) {
        self.frame.lock().stack.push(child);
    }

    pub(crate) fn leave(&self) {
        let mut frame = self.frame.lock();
        if frame.stack.len() > 1 {
            frame.stack.pop();
        }
    }

    pub(crate) fn close(&self) {
        self.frame.lock().closed = true;
    }

    pub(crate) fn take_poison(&self) -> Option<EngineError> {
        self.frame.lock().poisoned.take()
    }

    pub fn is_closed(&self) -> bool {
        self.frame.lock().closed
    }

    fn check_store<C: Codec>(&self, store: &Store<C>) -> StoreResult<DbId> {
        if !Arc::ptr_eq(&self.env, &store.env) {
            return Err(StoreError::Transaction(
                "store belongs to another environment".into(),
            ));
        }
        Ok(store.db)
    }

    fn engine_result<T>(&self, result: EngineResult<T>) -> StoreResult<T> {
        result.map_err(|e| {
            if is_retryable(&e) {
                let mut frame = self.frame.lock();
                if frame.poisoned.is_none() {
                    frame.poisoned = Some(e.clone());
                }
            }
            match e {
                EngineError::BadKey(_) => StoreError::InvalidKey,
                e => StoreError::Engine(e),
            }
        })
    }

    fn write(&self, db: DbId, key: &[u8], value: &[u8], version: Option<f64>) -> StoreResult<()> {
        let txn = self.engine_result(self.current())?;
        self.engine_result(self.env.engine.put(txn, db, key, value, version))?;
        self.env.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn lookup(&self, db: DbId, key: &[u8]) -> StoreResult<Option<(Vec<u8>, f64)>> {
        let txn = self.engine_result(self.current())?;
        let Some(location) = self.engine_result(self.env.engine.get(txn, db, key))? else {
            return Ok(None);
        };
        let bytes = self
            .env
            .windows
            .lock()
            .view(self.env.engine.as_ref(), &location)?
            .to_vec()?;
        Ok(Some((bytes, location.version)))
    }

    pub fn put<C: Codec, K: Key + ?Sized>(
        &self,
        store: &Store<C>,
        key: &K,
        value: &C::Value,
    ) -> StoreResult<()> {
        let db = self.check_store(store)?;
        let key = encode_key(key)?;
        let value = store.codec.encode(value)?;
        self.write(db, &key, &value, None)
    }

    pub fn put_versioned<C: Codec, K: Key + ?Sized>(
        &self,
        store: &Store<C>,
        key: &K,
        value: &C::Value,
        version: f64,
    ) -> StoreResult<()> {
        let db = self.check_store(store)?;
        store.require_versions()?;
        let key = encode_key(key)?;
        let value = store.codec.encode(value)?;
        self.write(db, &key, &value, Some(version))
    }

    /// Write only if the stored version satisfies `condition`.
    pub fn put_if_version<C: Codec, K: Key + ?Sized>(
        &self,
        store: &Store<C>,
        key: &K,
        value: &C::Value,
        version: Option<f64>,
        condition: VersionCondition,
    ) -> StoreResult<bool> {
        let db = self.check_store(store)?;
        let key = encode_key(key)?;
        let value = store.codec.encode(value)?;
        let previous = self.lookup(db, &key)?.map(|(_, v)| v);
        if !condition.matches(previous) {
            return Ok(false);
        }
        self.write(db, &key, &value, version)?;
        Ok(true)
    }

    pub fn get<C: Codec, K: Key + ?Sized>(
        &self,
        store: &Store<C>,
        key: &K,
    ) -> StoreResult<Option<C::Value>> {
        Ok(self.get_entry(store, key)?.map(|entry| entry.value))
    }

    /// Read through the transaction, seeing its own uncommitted writes.
    pub fn get_entry<C: Codec, K: Key + ?Sized>(
        &self,
        store: &Store<C>,
        key: &K,
    ) -> StoreResult<Option<Entry<C::Value>>> {
        let db = self.check_store(store)?;
        let key = encode_key(key)?;
        match self.lookup(db, &key)? {
            Some((bytes, version)) => Ok(Some(Entry {
                value: store.codec.decode(&bytes)?,
                version: store.meta.use_versions.then_some(version),
            })),
            None => Ok(None),
        }
    }

    pub fn remove<C: Codec, K: Key + ?Sized>(&self, store: &Store<C>, key: &K) -> StoreResult<bool> {
        let db = self.check_store(store)?;
        let key = encode_key(key)?;
        let txn = self.engine_result(self.current())?;
        let found = self.engine_result(self.env.engine.delete(txn, db, &key, None))?;
        self.env.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(found)
    }

    pub fn remove_if_version<C: Codec, K: Key + ?Sized>(
        &self,
        store: &Store<C>,
        key: &K,
        condition: VersionCondition,
    ) -> StoreResult<bool> {
        let db = self.check_store(store)?;
        let key = encode_key(key)?;
        let previous = self.lookup(db, &key)?.map(|(_, v)| v);
        if !condition.matches(previous) {
            return Ok(false);
        }
        let txn = self.engine_result(self.current())?;
        self.engine_result(self.env.engine.delete(txn, db, &key, None))
    }

    /// Remove every entry of `store`.
    pub fn clear<C: Codec>(&self, store: &Store<C>) -> StoreResult<()> {
        let db = self.check_store(store)?;
        let txn = self.engine_result(self.current())?;
        self.engine_result(self.env.engine.drop_db(txn, db, false))
    }

    /// Run `f` in a nested transaction. An `Abort` outcome or an error rolls
    /// back only what `f` wrote.
    pub fn child<R>(
        &self,
        f: impl FnOnce(&WriteTxn) -> StoreResult<TxnOutcome<R>>,
    ) -> StoreResult<TxnOutcome<R>> {
        let parent = self.engine_result(self.current())?;
        let child = self.engine_result(self.env.engine.begin_txn(TxnKind::Child(parent)))?;

        self.enter(child);
        let result = f(self);
        self.leave();

        match result {
            Ok(TxnOutcome::Commit(value)) => {
                self.engine_result(self.env.engine.commit(child))?;
                Ok(TxnOutcome::Commit(value))
            }
            Ok(TxnOutcome::Abort) => {
                let _ = self.env.engine.abort(child);
                Ok(TxnOutcome::Abort)
            }
            Err(e) => {
                let _ = self.env.engine.abort(child);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for WriteTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let frame = self.frame.lock();
        f.debug_struct("WriteTxn")
            .field("stack", &frame.stack)
            .field("closed", &frame.closed)
            .finish()
    }
}
