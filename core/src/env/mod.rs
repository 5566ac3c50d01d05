//! Environment: shared access layer over one storage engine
//!
//! An [`Environment`] owns the write scheduler, the shared read snapshot,
//! the zero-copy window table and the key scratch buffer. [`Store`]s are
//! cheap handles onto one sub-database of the environment.

pub mod key_buffer;
pub mod observer;
pub mod snapshot;
pub mod store;
pub mod txn;
pub mod window;

pub use key_buffer::{Key, KeyBuffer};
pub use observer::CommitObserver;
pub use snapshot::Snapshot;
pub use store::{BatchOp, ConditionalBatch, Entry, RangeIter, Store};
pub use txn::{TxnOutcome, WriteTxn};
pub use window::ValueView;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::batch::recovery::{self, Recovery};
use crate::batch::{BatchResults, Operation, Scheduler};
use crate::codec::Codec;
use crate::config::{EnvConfig, StoreOptions};
use crate::engine::{DbFlags, DbId, EngineError, SessionId, StorageEngine, TxnId, TxnKind};
use crate::error::{StoreError, StoreResult};
use snapshot::{CursorPin, ReadTxnHandle, SnapshotManager};
use store::StoreMeta;
use window::WindowTracker;

#[derive(Default)]
pub(crate) struct EnvCounters {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub transactions: AtomicU64,
    pub batches: AtomicU64,
    pub retries: AtomicU64,
    average_txn_ms: Mutex<f64>,
}

impl EnvCounters {
    /// Fold one transaction time into the 3:1 moving average.
    fn record_txn_time(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut avg = self.average_txn_ms.lock();
        *avg = if *avg == 0.0 { ms } else { (*avg * 3.0 + ms) / 4.0 };
    }
}

/// Counters reported by [`Environment::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnvStats {
    pub reads: u64,
    pub writes: u64,
    pub transactions: u64,
    pub batches: u64,
    pub retries: u64,
    pub average_transaction_time_ms: f64,
    pub readers: usize,
    /// Whether the shared read snapshot is live, as opposed to reset
    pub read_snapshot_active: bool,
}

pub(crate) struct EnvInner {
    pub name: String,
    pub engine: Arc<dyn StorageEngine>,
    pub config: EnvConfig,
    pub session: SessionId,
    pub scheduler: Mutex<Scheduler>,
    /// Held by whichever flush or exclusive transaction owns the writer
    pub commit_lock: tokio::sync::Mutex<()>,
    pub snapshots: Mutex<SnapshotManager>,
    pub windows: Mutex<WindowTracker>,
    pub key_buffer: Mutex<KeyBuffer>,
    pub stats: EnvCounters,
    observers: RwLock<Vec<Arc<dyn CommitObserver>>>,
    db_names: RwLock<HashMap<DbId, String>>,
    closed: AtomicBool,
    abort_warned: AtomicBool,
}

impl EnvInner {
    pub fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Name used in error messages for `db`
    pub fn store_name(&self, db: Option<DbId>) -> String {
        db.and_then(|db| self.db_names.read().get(&db).cloned())
            .unwrap_or_else(|| self.name.clone())
    }

    /// Run `f` against the shared read transaction. The snapshot cannot be
    /// reset while `f` runs.
    pub fn with_read_txn<R>(self: &Arc<Self>, f: impl FnOnce(TxnId) -> StoreResult<R>) -> StoreResult<R> {
        self.ensure_open()?;
        let mut snapshots = self.snapshots.lock();
        let (handle, period) = match snapshots.acquire(&self.engine, self.session) {
            Ok(acquired) => acquired,
            Err(e) => {
                snapshots.abort();
                return Err(self.annotate(None, e));
            }
        };
        if let Some(epoch) = period {
            self.schedule_idle_reset(epoch);
        }

        let result = f(handle.txn());
        if let Err(StoreError::EngineFatal { source, .. }) = &result {
            if recovery::poisons_snapshot(source) {
                snapshots.abort();
            }
        }
        result
    }

    /// Pin the shared read transaction for a cursor.
    pub fn pin_read_txn(self: &Arc<Self>) -> StoreResult<CursorPin> {
        self.ensure_open()?;
        let mut snapshots = self.snapshots.lock();
        let (handle, period) = match snapshots.acquire(&self.engine, self.session) {
            Ok(acquired) => acquired,
            Err(e) => {
                snapshots.abort();
                return Err(self.annotate(None, e));
            }
        };
        if let Some(epoch) = period {
            self.schedule_idle_reset(epoch);
        }
        Ok(handle.pin())
    }

    /// Look `key` up in the shared snapshot, recording the outcome in the
    /// key buffer. `f` runs before the snapshot or the window table can
    /// move on, so the view it gets is readable for its whole call.
    pub fn lookup<K: Key + ?Sized, R>(
        self: &Arc<Self>,
        db: DbId,
        key: &K,
        f: impl FnOnce(Option<(ValueView, f64)>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let mut keys = self.key_buffer.lock();
        keys.encode(key)?;

        let result = self.with_read_txn(|txn| {
            let location = self
                .engine
                .get(txn, db, keys.key())
                .map_err(|e| self.read_error(db, e))?;
            keys.record(location.as_ref());

            let Some(location) = keys.last_location() else {
                return f(None);
            };
            let mut windows = self.windows.lock();
            let view = windows.view(self.engine.as_ref(), &location)?;
            f(Some((view, location.version)))
        })?;
        drop(keys);

        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    fn schedule_idle_reset(self: &Arc<Self>, epoch: u64) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let env = Arc::downgrade(self);
        let idle = self.config.read_idle();
        runtime.spawn(async move {
            if idle.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(idle).await;
            }
            if let Some(env) = env.upgrade() {
                env.snapshots.lock().reset_if_idle(env.engine.as_ref(), epoch);
            }
        });
    }

    /// Map an engine failure on the read path. Does not touch the shared
    /// snapshot, so it is safe to call while the snapshot is locked.
    pub fn read_error(&self, db: DbId, error: EngineError) -> StoreError {
        match error {
            EngineError::BadKey(_) => StoreError::InvalidKey,
            e => self.annotate(Some(db), e),
        }
    }

    /// Attach the store name to an unrecoverable engine failure.
    pub fn annotate(&self, db: Option<DbId>, source: EngineError) -> StoreError {
        let store = self.store_name(db);
        error!("In database {}: {}", store, source);
        StoreError::EngineFatal { store, source }
    }

    /// Log an unrecoverable engine failure, dropping the shared snapshot
    /// when the failure leaves it unusable.
    pub fn report_fatal(&self, store: &str, source: &EngineError) {
        if recovery::poisons_snapshot(source) {
            self.snapshots.lock().abort();
        }
        error!("In database {}: {}", store, source);
    }

    /// Report an unrecoverable engine failure as a caller-facing error.
    pub fn fatal(&self, db: Option<DbId>, source: EngineError) -> StoreError {
        let store = self.store_name(db);
        self.report_fatal(&store, &source);
        StoreError::EngineFatal { store, source }
    }

    /// Run one recovery step before a replay.
    pub fn recover(&self, step: Recovery) -> Result<(), EngineError> {
        let mut snapshots = self.snapshots.lock();
        match step {
            Recovery::GrowMapAndRetry => self.engine.grow_map()?,
            Recovery::RemapAndRetry => {
                snapshots.abort();
                self.engine.remap()?;
            }
            _ => return Ok(()),
        }
        self.windows.lock().invalidate();
        Ok(())
    }

    /// Bookkeeping after any successful write commit.
    pub fn finish_commit(&self, elapsed: Duration) {
        let mut snapshots = self.snapshots.lock();
        snapshots.reset(self.engine.as_ref());
        self.windows.lock().invalidate();
        drop(snapshots);
        self.stats.transactions.fetch_add(1, Ordering::Relaxed);
        self.stats.record_txn_time(elapsed);
    }

    pub fn warn_abort_once(&self) {
        if !self.abort_warned.swap(true, Ordering::AcqRel) {
            warn!(
                "An asynchronous transaction returned Abort, but only child transactions can be aborted; its writes were kept"
            );
        }
    }

    fn observers(&self) -> Vec<Arc<dyn CommitObserver>> {
        self.observers.read().clone()
    }

    pub fn notify_before_commit(&self, operations: &[Operation]) {
        for observer in self.observers() {
            observer.before_commit(operations);
        }
    }

    pub fn notify_after_commit(&self, operations: &[Operation], results: &BatchResults) {
        for observer in self.observers() {
            observer.after_commit(operations, results);
        }
    }

    /// One attempt of an exclusive write transaction.
    fn run_exclusive<R>(
        self: &Arc<Self>,
        f: &impl Fn(&WriteTxn) -> StoreResult<TxnOutcome<R>>,
    ) -> StoreResult<TxnOutcome<R>> {
        let root = self.engine.begin_txn(TxnKind::Write)?;
        let txn = WriteTxn::new(Arc::clone(self), root);
        let result = f(&txn);
        txn.close();

        if let Some(poison) = txn.take_poison() {
            let _ = self.engine.abort(root);
            return Err(poison.into());
        }
        match result {
            Ok(TxnOutcome::Commit(value)) => match self.engine.commit(root) {
                Ok(()) => Ok(TxnOutcome::Commit(value)),
                Err(e) if recovery::classify(&e) == Recovery::TreatAsSuccess => {
                    Ok(TxnOutcome::Commit(value))
                }
                Err(e) => Err(e.into()),
            },
            Ok(TxnOutcome::Abort) => {
                let _ = self.engine.abort(root);
                Ok(TxnOutcome::Abort)
            }
            Err(e) => {
                let _ = self.engine.abort(root);
                Err(e)
            }
        }
    }
}

/// Handle on an open environment. Clones share the same environment.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl Environment {
    /// Open an environment over `engine`. Reader slots left behind by dead
    /// sessions are cleared first.
    pub fn open(engine: Arc<dyn StorageEngine>, config: EnvConfig) -> StoreResult<Self> {
        config.validate()?;

        let cleared = engine.reader_check()?;
        if cleared > 0 {
            info!("Cleared {} stale reader(s) from the reader table", cleared);
        }

        let session = engine.open_session();
        let mut db_names = HashMap::new();
        db_names.insert(DbId(0), config.name.clone());

        let inner = Arc::new(EnvInner {
            name: config.name.clone(),
            engine,
            session,
            scheduler: Mutex::new(Scheduler::new()),
            commit_lock: tokio::sync::Mutex::new(()),
            snapshots: Mutex::new(SnapshotManager::new()),
            windows: Mutex::new(WindowTracker::new(config.window_span)),
            key_buffer: Mutex::new(KeyBuffer::new()),
            stats: EnvCounters::default(),
            observers: RwLock::new(Vec::new()),
            db_names: RwLock::new(db_names),
            closed: AtomicBool::new(false),
            abort_warned: AtomicBool::new(false),
            config,
        });

        info!(
            "Opened environment {} (order: {:?}, commit delay: {}ms)",
            inner.name, inner.config.async_txn_order, inner.config.commit_delay_ms
        );
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &EnvConfig {
        &self.inner.config
    }

    /// Open (or create) a store with the given codec.
    pub fn open_store<C: Codec>(&self, options: StoreOptions, codec: C) -> StoreResult<Store<C>> {
        self.inner.ensure_open()?;
        options.validate()?;

        let flags = DbFlags {
            dup_sort: options.dup_sort,
        };
        let db = self
            .inner
            .engine
            .open_db(options.name.as_deref(), flags)
            .map_err(|e| match e {
                EngineError::DbsFull => {
                    StoreError::Config(format!("{} (increase your max_dbs option)", e))
                }
                e => StoreError::Engine(e),
            })?;

        if let Some(name) = &options.name {
            self.inner.db_names.write().insert(db, name.clone());
        }
        debug!("Opened store {:?} as database {}", options.name, db.0);

        let commit_delay = options
            .commit_delay_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.inner.config.commit_delay());
        let meta = StoreMeta {
            name: options.name,
            use_versions: options.use_versions,
            dup_sort: options.dup_sort,
            commit_delay,
        };
        Ok(Store::new(Arc::clone(&self.inner), db, meta, codec))
    }

    /// Commit whatever is queued now and wait for it, after any batch that
    /// is already committing.
    pub async fn flush(&self) -> StoreResult<()> {
        let pending = self.inner.scheduler.lock().take();
        match pending {
            Some(batch) => {
                let outcome = batch.outcome.clone();
                // dropping this future must not abandon the batch
                self.inner.spawn_flush(batch)?;
                outcome.await?;
                Ok(())
            }
            None => {
                let _in_flight = self.inner.commit_lock.lock().await;
                Ok(())
            }
        }
    }

    /// Run `f` in an exclusive write transaction, outside any batch.
    ///
    /// `f` is replayed if the map has to grow. Returning `Abort` rolls the
    /// whole transaction back.
    pub async fn transaction<R, F>(&self, f: F) -> StoreResult<TxnOutcome<R>>
    where
        F: Fn(&WriteTxn) -> StoreResult<TxnOutcome<R>>,
    {
        self.inner.ensure_open()?;
        let _writer = self.inner.commit_lock.lock().await;
        let started = Instant::now();
        let mut retries = 0;

        loop {
            let error = match self.inner.run_exclusive(&f) {
                Ok(outcome) => {
                    if outcome.is_commit() {
                        self.inner.finish_commit(started.elapsed());
                    }
                    return Ok(outcome);
                }
                Err(error) => error,
            };

            let Some(source) = error.engine_error().cloned() else {
                return Err(error);
            };
            match recovery::classify(&source) {
                step @ (Recovery::GrowMapAndRetry | Recovery::RemapAndRetry) => {
                    if retries >= self.inner.config.max_retries {
                        error!("Transaction still failing after {} retries: {}", retries, source);
                        return Err(StoreError::ResourceExhausted { retries, source });
                    }
                    retries += 1;
                    self.inner.stats.retries.fetch_add(1, Ordering::Relaxed);
                    warn!("Transaction hit {}, retrying (attempt {})", source, retries);
                    self.inner
                        .recover(step)
                        .map_err(|e| self.inner.fatal(None, e))?;
                }
                Recovery::Fatal => return Err(self.inner.fatal(None, source)),
                _ => return Err(error),
            }
        }
    }

    /// A dedicated read transaction that keeps seeing the current state
    /// until it is dropped.
    pub fn snapshot(&self) -> StoreResult<Snapshot> {
        self.inner.ensure_open()?;
        let handle = ReadTxnHandle::begin(&self.inner.engine, self.inner.session)?;
        Ok(Snapshot::new(Arc::clone(&self.inner), handle))
    }

    pub fn add_observer(&self, observer: Arc<dyn CommitObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Clear reader slots left behind by closed sessions.
    pub fn reader_check(&self) -> StoreResult<usize> {
        let cleared = self.inner.engine.reader_check()?;
        if cleared > 0 {
            info!("Cleared {} stale reader(s) from the reader table", cleared);
        }
        Ok(cleared)
    }

    /// Operations waiting for the next batch
    pub fn pending_operations(&self) -> usize {
        self.inner.scheduler.lock().pending_len()
    }

    pub fn stats(&self) -> EnvStats {
        let stats = &self.inner.stats;
        EnvStats {
            reads: stats.reads.load(Ordering::Relaxed),
            writes: stats.writes.load(Ordering::Relaxed),
            transactions: stats.transactions.load(Ordering::Relaxed),
            batches: stats.batches.load(Ordering::Relaxed),
            retries: stats.retries.load(Ordering::Relaxed),
            average_transaction_time_ms: *stats.average_txn_ms.lock(),
            readers: self.inner.engine.reader_count(),
            read_snapshot_active: self.inner.snapshots.lock().is_active(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Flush pending writes and release the environment's read snapshot.
    pub async fn close(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.flush().await?;
        self.inner.closed.store(true, Ordering::Release);
        self.inner.snapshots.lock().abort();
        self.inner.engine.close_session(self.inner.session);
        info!("Closed environment {}", self.inner.name);
        Ok(())
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
