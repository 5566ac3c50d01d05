//! Stores: named keyspaces inside an environment

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::EnvInner;
use super::key_buffer::{Key, encode_key};
use super::snapshot::CursorPin;
use super::txn::{TxnOutcome, WriteTxn};
use super::window::ValueView;
use crate::batch::{CommitFuture, OperationQueue, VersionCondition};
use crate::codec::{BinaryCodec, Codec};
use crate::engine::{CursorPosition, DbId, DbStat};
use crate::error::{StoreError, StoreResult};

/// A value together with its version stamp
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<V> {
    pub value: V,
    /// `None` unless the store tracks versions
    pub version: Option<f64>,
}

/// One write in a [`Store::batch`] call
#[derive(Debug, Clone)]
pub enum BatchOp<K, V> {
    Put(K, V),
    Remove(K),
}

pub(crate) struct StoreMeta {
    pub name: Option<String>,
    pub use_versions: bool,
    pub dup_sort: bool,
    pub commit_delay: Duration,
}

/// Handle on one sub-database.
///
/// Writes are queued on the environment and committed in batches; each
/// write returns a [`CommitFuture`] that resolves once its batch commits.
/// Reads go through the shared read snapshot.
pub struct Store<C: Codec = BinaryCodec> {
    pub(crate) env: Arc<EnvInner>,
    pub(crate) db: DbId,
    pub(crate) meta: Arc<StoreMeta>,
    pub(crate) codec: C,
}

impl<C: Codec> Clone for Store<C> {
    fn clone(&self) -> Self {
        Self {
            env: Arc::clone(&self.env),
            db: self.db,
            meta: Arc::clone(&self.meta),
            codec: self.codec.clone(),
        }
    }
}

impl<C: Codec> Store<C> {
    pub(crate) fn new(env: Arc<EnvInner>, db: DbId, meta: StoreMeta, codec: C) -> Self {
        Self {
            env,
            db,
            meta: Arc::new(meta),
            codec,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.meta.name.as_deref()
    }

    pub fn use_versions(&self) -> bool {
        self.meta.use_versions
    }

    pub fn dup_sort(&self) -> bool {
        self.meta.dup_sort
    }

    pub(crate) fn require_versions(&self) -> StoreResult<()> {
        if !self.meta.use_versions {
            return Err(StoreError::Config(format!(
                "versions are not enabled for store {}",
                self.env.store_name(Some(self.db))
            )));
        }
        Ok(())
    }

    fn submit<T>(
        &self,
        build: impl FnOnce(&mut OperationQueue) -> StoreResult<T>,
    ) -> StoreResult<(T, crate::batch::SharedOutcome)> {
        self.env.enqueue(self.meta.commit_delay, build)
    }

    /// Resolve to the flag at result `index` once the batch commits.
    fn flag_at(&self, index: usize, outcome: crate::batch::SharedOutcome) -> CommitFuture<bool> {
        CommitFuture::new(async move {
            let results = outcome.await?;
            results.flag(index)
        })
    }

    pub fn put<K: Key + ?Sized>(&self, key: &K, value: &C::Value) -> StoreResult<CommitFuture<bool>> {
        let key = encode_key(key)?;
        let value = self.codec.encode(value)?;
        let (index, outcome) = self.submit(|queue| Ok(queue.push_put(self.db, key, value, None)))?;
        Ok(self.flag_at(index, outcome))
    }

    /// Put and stamp the entry with `version`.
    pub fn put_versioned<K: Key + ?Sized>(
        &self,
        key: &K,
        value: &C::Value,
        version: f64,
    ) -> StoreResult<CommitFuture<bool>> {
        self.require_versions()?;
        let key = encode_key(key)?;
        let value = self.codec.encode(value)?;
        let (index, outcome) =
            self.submit(|queue| Ok(queue.push_put(self.db, key, value, Some(version))))?;
        Ok(self.flag_at(index, outcome))
    }

    /// Put only if the stored version satisfies `condition` at commit time.
    /// Resolves to `false` when the condition fails.
    pub fn put_if_version<K: Key + ?Sized>(
        &self,
        key: &K,
        value: &C::Value,
        version: Option<f64>,
        condition: VersionCondition,
    ) -> StoreResult<CommitFuture<bool>> {
        if version.is_some() {
            self.require_versions()?;
        }
        let key = encode_key(key)?;
        let value = self.codec.encode(value)?;
        let (index, outcome) = self.submit(|queue| {
            if condition == VersionCondition::Unconditional {
                return Ok(queue.push_put(self.db, key, value, version));
            }
            let guard = queue.push_guard(self.db, key.clone(), condition);
            queue.push_put(self.db, key, value, version);
            queue.push_end_guard();
            Ok(guard)
        })?;
        Ok(self.flag_at(index, outcome))
    }

    /// Resolves to whether the key existed.
    pub fn remove<K: Key + ?Sized>(&self, key: &K) -> StoreResult<CommitFuture<bool>> {
        let key = encode_key(key)?;
        let (index, outcome) = self.submit(|queue| Ok(queue.push_remove(self.db, key, None)))?;
        Ok(self.flag_at(index, outcome))
    }

    /// Remove only if the stored version satisfies `condition`.
    pub fn remove_if_version<K: Key + ?Sized>(
        &self,
        key: &K,
        condition: VersionCondition,
    ) -> StoreResult<CommitFuture<bool>> {
        let key = encode_key(key)?;
        let (index, outcome) = self.submit(|queue| {
            if condition == VersionCondition::Unconditional {
                return Ok(queue.push_remove(self.db, key, None));
            }
            let guard = queue.push_guard(self.db, key.clone(), condition);
            queue.push_remove(self.db, key, None);
            queue.push_end_guard();
            Ok(guard)
        })?;
        Ok(self.flag_at(index, outcome))
    }

    /// Remove the key only while it holds `value`. For dup-sort stores this
    /// removes the single matching value.
    pub fn remove_value<K: Key + ?Sized>(
        &self,
        key: &K,
        value: &C::Value,
    ) -> StoreResult<CommitFuture<bool>> {
        let key = encode_key(key)?;
        let value = self.codec.encode(value)?;
        let (index, outcome) =
            self.submit(|queue| Ok(queue.push_remove(self.db, key, Some(value))))?;
        Ok(self.flag_at(index, outcome))
    }

    /// Queue the writes made by `build` so they only apply if `key`
    /// satisfies `condition` at commit time. Resolves to whether they applied.
    ///
    /// `build` runs while the queue is locked: queue writes through the
    /// [`ConditionalBatch`] rather than through stores.
    pub fn if_version<K: Key + ?Sized>(
        &self,
        key: &K,
        condition: VersionCondition,
        build: impl FnOnce(&mut ConditionalBatch<'_>) -> StoreResult<()>,
    ) -> StoreResult<CommitFuture<bool>> {
        let key = encode_key(key)?;
        let (guard, outcome) = self.submit(|queue| {
            let mark = queue.mark();
            let guard = match condition {
                VersionCondition::Unconditional => None,
                condition => Some(queue.push_guard(self.db, key, condition)),
            };
            let mut batch = ConditionalBatch {
                env: &self.env,
                queue: &mut *queue,
            };
            if let Err(e) = build(&mut batch) {
                queue.rollback_to(mark);
                return Err(e);
            }
            if guard.is_some() {
                queue.push_end_guard();
            }
            Ok(guard)
        })?;

        Ok(match guard {
            Some(index) => self.flag_at(index, outcome),
            None => CommitFuture::new(async move {
                outcome.await?;
                Ok(true)
            }),
        })
    }

    pub fn if_no_exists<K: Key + ?Sized>(
        &self,
        key: &K,
        build: impl FnOnce(&mut ConditionalBatch<'_>) -> StoreResult<()>,
    ) -> StoreResult<CommitFuture<bool>> {
        self.if_version(key, VersionCondition::MustNotExist, build)
    }

    /// Queue several writes at once. Nothing is queued if any of them fails
    /// validation.
    pub fn batch<K: Key>(
        &self,
        ops: impl IntoIterator<Item = BatchOp<K, C::Value>>,
    ) -> StoreResult<CommitFuture<Vec<bool>>> {
        let encoded = ops
            .into_iter()
            .map(|op| -> StoreResult<(Vec<u8>, Option<Vec<u8>>)> {
                match op {
                    BatchOp::Put(key, value) => {
                        Ok((encode_key(&key)?, Some(self.codec.encode(&value)?)))
                    }
                    BatchOp::Remove(key) => Ok((encode_key(&key)?, None)),
                }
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let (indexes, outcome) = self.submit(|queue| {
            Ok(encoded
                .into_iter()
                .map(|(key, value)| match value {
                    Some(value) => queue.push_put(self.db, key, value, None),
                    None => queue.push_remove(self.db, key, None),
                })
                .collect::<Vec<_>>())
        })?;

        Ok(CommitFuture::new(async move {
            let results = outcome.await?;
            indexes.into_iter().map(|i| results.flag(i)).collect()
        }))
    }

    /// Remove every entry, keeping the store open.
    pub fn clear(&self) -> StoreResult<CommitFuture<()>> {
        let (index, outcome) = self.submit(|queue| Ok(queue.push_drop(self.db, false)))?;
        Ok(CommitFuture::new(async move {
            let results = outcome.await?;
            results.flag(index).map(|_| ())
        }))
    }

    /// Delete the store and every entry in it. The handle stays usable:
    /// a later write through it creates the store again.
    pub fn drop_store(&self) -> StoreResult<CommitFuture<()>> {
        let (index, outcome) = self.submit(|queue| Ok(queue.push_drop(self.db, true)))?;
        Ok(CommitFuture::new(async move {
            let results = outcome.await?;
            results.flag(index).map(|_| ())
        }))
    }

    /// Run `f` inside the next batch's write transaction.
    ///
    /// `f` may be called again if the batch is replayed after the map grew.
    /// An error from `f` is reported only through this handle; the rest of
    /// the batch still commits, including what `f` wrote before failing.
    pub fn transaction_async<R, F, Fut>(&self, f: F) -> StoreResult<CommitFuture<TxnOutcome<R>>>
    where
        F: Fn(WriteTxn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StoreResult<TxnOutcome<R>>> + Send + 'static,
        R: Send + 'static,
    {
        self.env.enqueue_txn(self.meta.commit_delay, false, f)
    }

    /// Like [`Store::transaction_async`], but `f` runs in a nested
    /// transaction: an error or `Abort` rolls back everything it wrote.
    pub fn transaction_async_child<R, F, Fut>(&self, f: F) -> StoreResult<CommitFuture<TxnOutcome<R>>>
    where
        F: Fn(WriteTxn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StoreResult<TxnOutcome<R>>> + Send + 'static,
        R: Send + 'static,
    {
        self.env.enqueue_txn(self.meta.commit_delay, true, f)
    }

    pub fn get<K: Key + ?Sized>(&self, key: &K) -> StoreResult<Option<C::Value>> {
        self.env.lookup(self.db, key, |found| match found {
            Some((view, _)) => Ok(Some(self.codec.decode(view.bytes()?)?)),
            None => Ok(None),
        })
    }

    pub fn get_entry<K: Key + ?Sized>(&self, key: &K) -> StoreResult<Option<Entry<C::Value>>> {
        self.env.lookup(self.db, key, |found| match found {
            Some((view, version)) => Ok(Some(Entry {
                value: self.codec.decode(view.bytes()?)?,
                version: self.meta.use_versions.then_some(version),
            })),
            None => Ok(None),
        })
    }

    /// Zero-copy view of the raw value, valid until the next commit.
    pub fn get_view<K: Key + ?Sized>(&self, key: &K) -> StoreResult<Option<ValueView>> {
        self.env.lookup(self.db, key, |found| Ok(found.map(|(view, _)| view)))
    }

    /// Raw value bytes, copied out of the map
    pub fn get_binary<K: Key + ?Sized>(&self, key: &K) -> StoreResult<Option<Vec<u8>>> {
        self.env.lookup(self.db, key, |found| {
            found.map(|(view, _)| view.to_vec()).transpose()
        })
    }

    pub fn does_exist<K: Key + ?Sized>(&self, key: &K) -> StoreResult<bool> {
        self.env.lookup(self.db, key, |found| Ok(found.is_some()))
    }

    /// Whether the key exists with exactly `version`
    pub fn does_exist_version<K: Key + ?Sized>(&self, key: &K, version: f64) -> StoreResult<bool> {
        self.env.lookup(self.db, key, |found| {
            Ok(VersionCondition::MustEqual(version).matches(found.map(|(_, v)| v)))
        })
    }

    /// Iterate over every entry in key order (and value order for dup-sort
    /// stores). The iteration keeps reading the snapshot it started on, even
    /// across later commits.
    pub fn range(&self) -> StoreResult<RangeIter<C>> {
        let pin = self.env.pin_read_txn()?;
        Ok(RangeIter {
            store: self.clone(),
            pin,
            position: None,
            done: false,
        })
    }

    pub fn stats(&self) -> StoreResult<DbStat> {
        self.env.with_read_txn(|txn| {
            self.env
                .engine
                .stat(txn, self.db)
                .map_err(|e| self.env.read_error(self.db, e))
        })
    }
}

impl<C: Codec> std::fmt::Debug for Store<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.meta.name)
            .field("db", &self.db)
            .field("use_versions", &self.meta.use_versions)
            .field("dup_sort", &self.meta.dup_sort)
            .finish()
    }
}

/// Writes queued inside a conditional block
pub struct ConditionalBatch<'a> {
    env: &'a Arc<EnvInner>,
    queue: &'a mut OperationQueue,
}

impl ConditionalBatch<'_> {
    fn check_store<C: Codec>(&self, store: &Store<C>) -> StoreResult<DbId> {
        if !Arc::ptr_eq(self.env, &store.env) {
            return Err(StoreError::Transaction(
                "store belongs to another environment".into(),
            ));
        }
        Ok(store.db)
    }

    pub fn put<C: Codec, K: Key + ?Sized>(
        &mut self,
        store: &Store<C>,
        key: &K,
        value: &C::Value,
    ) -> StoreResult<()> {
        let db = self.check_store(store)?;
        let key = encode_key(key)?;
        let value = store.codec.encode(value)?;
        self.queue.push_put(db, key, value, None);
        Ok(())
    }

    pub fn put_versioned<C: Codec, K: Key + ?Sized>(
        &mut self,
        store: &Store<C>,
        key: &K,
        value: &C::Value,
        version: f64,
    ) -> StoreResult<()> {
        let db = self.check_store(store)?;
        store.require_versions()?;
        let key = encode_key(key)?;
        let value = store.codec.encode(value)?;
        self.queue.push_put(db, key, value, Some(version));
        Ok(())
    }

    pub fn remove<C: Codec, K: Key + ?Sized>(&mut self, store: &Store<C>, key: &K) -> StoreResult<()> {
        let db = self.check_store(store)?;
        let key = encode_key(key)?;
        self.queue.push_remove(db, key, None);
        Ok(())
    }

    /// Nest another condition inside this block.
    pub fn if_version<C: Codec, K: Key + ?Sized>(
        &mut self,
        store: &Store<C>,
        key: &K,
        condition: VersionCondition,
        build: impl FnOnce(&mut ConditionalBatch<'_>) -> StoreResult<()>,
    ) -> StoreResult<()> {
        let db = self.check_store(store)?;
        let key = encode_key(key)?;
        let guarded = condition != VersionCondition::Unconditional;
        if guarded {
            self.queue.push_guard(db, key, condition);
        }
        build(self)?;
        if guarded {
            self.queue.push_end_guard();
        }
        Ok(())
    }
}

/// Cursor over a store, pinned on one read snapshot
pub struct RangeIter<C: Codec> {
    store: Store<C>,
    pin: CursorPin,
    position: Option<CursorPosition>,
    done: bool,
}

impl<C: Codec> RangeIter<C> {
    fn step(&mut self) -> StoreResult<Option<(Vec<u8>, C::Value)>> {
        let env = &self.store.env;
        let next = env
            .engine
            .next_entry(self.pin.txn(), self.store.db, self.position.as_ref())
            .map_err(|e| env.read_error(self.store.db, e))?;

        let Some((position, location)) = next else {
            return Ok(None);
        };
        // decode before a commit can invalidate the window
        let value = {
            let mut windows = env.windows.lock();
            let view = windows.view(env.engine.as_ref(), &location)?;
            self.store.codec.decode(view.bytes()?)?
        };
        let key = position.key.clone();
        self.position = Some(position);
        Ok(Some((key, value)))
    }
}

impl<C: Codec> Iterator for RangeIter<C> {
    type Item = StoreResult<(Vec<u8>, C::Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
