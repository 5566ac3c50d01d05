use crate::engine::EngineError;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Key is larger than maximum key size ({max}): {size} bytes")]
    KeyTooLarge { size: usize, max: usize },

    #[error("The key size was 0 or too large")]
    InvalidKey,

    #[error("Invalid value: {0}")]
    ValueTypeInvalid(String),

    /// Reserved for callers that want a failed version condition as an
    /// error; the store itself resolves failed conditions to `false`.
    #[error("Version mismatch")]
    VersionMismatch,

    #[error("Resource exhausted after {retries} retries: {source}")]
    ResourceExhausted {
        retries: usize,
        #[source]
        source: EngineError,
    },

    #[error("Snapshot is stale: the mapped window was invalidated")]
    SnapshotStale,

    #[error("In database {store}: {source}")]
    EngineFatal {
        store: String,
        #[source]
        source: EngineError,
    },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Environment is closed")]
    Closed,

    #[error("No async runtime available to schedule the commit")]
    NoRuntime,

    #[error("Transaction failed: {0}")]
    Transaction(String),
}

impl StoreError {
    /// The engine error behind this failure, if the engine produced it.
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            StoreError::Engine(e) => Some(e),
            StoreError::EngineFatal { source, .. } => Some(source),
            StoreError::ResourceExhausted { source, .. } => Some(source),
            _ => None,
        }
    }
}
