//! mapbatch - write batching and zero-copy reads over a memory-mapped
//! key-value engine

pub mod batch;
pub mod codec;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;

#[cfg(test)]
mod tests;

pub use batch::{BatchResults, CommitFuture, NO_EXIST_VERSION, OpStatus, Operation, VersionCondition};
pub use codec::{BinaryCodec, BincodeCodec, Codec, JsonCodec, StringCodec};
pub use config::{AsyncTxnOrder, EnvConfig, StoreOptions};
pub use engine::{EngineError, MemEngine, StorageEngine};
pub use env::{
    BatchOp, CommitObserver, ConditionalBatch, Entry, EnvStats, Environment, Key, RangeIter, Snapshot,
    Store, TxnOutcome, ValueView, WriteTxn,
};
pub use error::{StoreError, StoreResult};
