//! Error taxonomy shared by the identifier layer, schedule, and engine.

/// Errors surfaced by content hashing, scheduling, applying, and merging.
///
/// A log that merely fails to continue the cached frontier is not an error; the
/// applier reports it as [`crate::engine::apply::ApplyOutcome::NotApplicable`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Malformed prompt or log content.
    #[error("invalid content: {0}")]
    InvalidContent(String),
    /// The algorithm selector is not registered.
    #[error("unknown schedule algorithm: {0:?}")]
    UnknownAlgorithm(String),
    /// A referenced parent is missing, or the set has no root.
    #[error("incomplete history: {0}")]
    IncompleteHistory(String),
    /// Task parameters do not fit the task's content shape.
    #[error("invalid outcome for task type: {0}")]
    InvalidOutcomeForTaskType(String),
    /// The storage accessor failed while fetching a task's entries.
    #[error("failed to fetch entries: {0}")]
    Fetch(String),
}

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
