//! Storage engine interface
//!
//! The batching layer only talks to the engine through [`StorageEngine`]:
//! transaction begin/commit/abort, point reads and writes, a cursor step,
//! map growth and access to the mapped data region. [`MemEngine`] is the
//! reference implementation backed by an anonymous memory map.

pub mod arena;
pub mod memory;

pub use arena::{MapArena, MappedRegion};
pub use memory::{Fault, MemEngine};

use std::ops::Range;
use thiserror::Error;

/// Maximum encoded key size accepted by the engine.
pub const MAX_KEY_SIZE: usize = 1978;

/// Size reported for a lookup that found nothing.
pub const NOT_FOUND_SIZE: u32 = 0xffff_ffff;

/// Width of the version stamp stored in front of every value.
pub const VERSION_STAMP_SIZE: usize = 8;

/// Transaction handle issued by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(pub u64);

/// Sub-database handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DbId(pub u32);

/// Reader session; read transactions belong to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Kinds of transaction the engine can begin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    Read(SessionId),
    Write,
    Child(TxnId),
}

/// Flags used when opening a sub-database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbFlags {
    pub dup_sort: bool,
}

/// Where a value lives in the mapped region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryLocation {
    pub region: u32,
    pub offset: u64,
    pub length: u32,
    pub version: f64,
}

/// Cursor position inside a sub-database.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CursorPosition {
    pub key: Vec<u8>,
    pub dup: Vec<u8>,
}

/// Sub-database statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStat {
    pub entries: u64,
    pub value_bytes: u64,
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("map full: environment map size limit reached")]
    MapFull,

    #[error("map resized: the map was grown by another handle")]
    MapResized,

    #[error("key exists")]
    KeyExists,

    #[error("not found")]
    NotFound,

    #[error("The transaction is already closed.")]
    TxnClosed,

    #[error("bad key size: {0} bytes")]
    BadKey(usize),

    #[error("value of {0} bytes does not fit in a region")]
    ValueTooLarge(usize),

    #[error("database limit reached")]
    DbsFull,

    #[error("reader table has a stale entry")]
    ReaderStale,

    #[error("a write transaction is already active")]
    Busy,

    #[error("bad transaction: {0}")]
    BadTxn(String),

    #[error("engine problem: {0}")]
    Problem(String),
}

/// Primitives the batching layer needs from the storage engine.
pub trait StorageEngine: Send + Sync {
    fn open_db(&self, name: Option<&str>, flags: DbFlags) -> EngineResult<DbId>;

    fn begin_txn(&self, kind: TxnKind) -> EngineResult<TxnId>;
    fn commit(&self, txn: TxnId) -> EngineResult<()>;
    fn abort(&self, txn: TxnId) -> EngineResult<()>;

    /// Writes `value` under `key`, stamping it with `version` (0 when absent).
    fn put(
        &self,
        txn: TxnId,
        db: DbId,
        key: &[u8],
        value: &[u8],
        version: Option<f64>,
    ) -> EngineResult<()>;

    /// Deletes `key`, or only the matching value when `expected` is given.
    /// Returns whether anything was removed.
    fn delete(&self, txn: TxnId, db: DbId, key: &[u8], expected: Option<&[u8]>)
    -> EngineResult<bool>;

    fn get(&self, txn: TxnId, db: DbId, key: &[u8]) -> EngineResult<Option<EntryLocation>>;

    /// Steps a cursor to the first entry strictly after `after` (or the first
    /// entry when `after` is `None`).
    fn next_entry(
        &self,
        txn: TxnId,
        db: DbId,
        after: Option<&CursorPosition>,
    ) -> EngineResult<Option<(CursorPosition, EntryLocation)>>;

    fn drop_db(&self, txn: TxnId, db: DbId, delete: bool) -> EngineResult<()>;
    fn stat(&self, txn: TxnId, db: DbId) -> EngineResult<DbStat>;

    fn grow_map(&self) -> EngineResult<()>;
    fn remap(&self) -> EngineResult<()>;
    fn map_generation(&self) -> u64;

    fn renew_read_txn(&self, txn: TxnId) -> EngineResult<()>;
    fn reset_read_txn(&self, txn: TxnId) -> EngineResult<()>;

    /// Raw handle over `range` of mapped region `region`. The engine may
    /// clamp the end of the range to the region bounds.
    fn mapped_region(&self, region: u32, range: Range<u64>) -> EngineResult<MappedRegion>;

    fn open_session(&self) -> SessionId;
    fn close_session(&self, session: SessionId);
    /// Clears reader slots left behind by closed sessions.
    fn reader_check(&self) -> EngineResult<usize>;
    fn reader_count(&self) -> usize;
}
