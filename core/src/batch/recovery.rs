//! Engine error classification

use crate::engine::EngineError;

/// What the commit engine does with an engine failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Abort, grow the map and replay the batch
    GrowMapAndRetry,
    /// Abort, drop the read snapshot, adopt the new map size and replay
    RemapAndRetry,
    /// A negative result for the operation, not a failure
    NotAnError,
    /// The transaction was already closed; keep the computed results
    TreatAsSuccess,
    Fatal,
}

pub fn classify(error: &EngineError) -> Recovery {
    match error {
        EngineError::MapFull => Recovery::GrowMapAndRetry,
        EngineError::MapResized => Recovery::RemapAndRetry,
        EngineError::KeyExists | EngineError::NotFound => Recovery::NotAnError,
        EngineError::TxnClosed => Recovery::TreatAsSuccess,
        _ => Recovery::Fatal,
    }
}

/// Whether the whole batch should be replayed after this failure
pub fn is_retryable(error: &EngineError) -> bool {
    matches!(
        classify(error),
        Recovery::GrowMapAndRetry | Recovery::RemapAndRetry
    )
}

/// Whether this failure leaves the shared read snapshot unusable
pub fn poisons_snapshot(error: &EngineError) -> bool {
    !matches!(
        error,
        EngineError::KeyExists | EngineError::NotFound | EngineError::MapFull | EngineError::MapResized
    )
}
