//! Commit hooks for overlays such as a value cache

use crate::batch::{BatchResults, Operation};

/// Called around every batch commit. Both hooks run on the flushing task
/// and must not enqueue writes on the same environment.
pub trait CommitObserver: Send + Sync {
    /// Before the batch is applied, with the operations about to run
    fn before_commit(&self, _operations: &[Operation]) {}

    /// After a successful commit, with the per-operation results
    fn after_commit(&self, _operations: &[Operation], _results: &BatchResults) {}
}
