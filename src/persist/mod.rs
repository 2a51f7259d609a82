/// SQLite log table and cache table.
pub mod sqlite;

use std::collections::BTreeSet;

use crate::{
    core::cache::CacheConflict,
    error::EngineError,
    log::StoredActionLog,
    prompt::PromptTaskId,
    schedule::AlgorithmName,
    state::SchedulingStateCache,
    types::LogId,
};

/// Failures of a durable log/cache store.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Payload encoding failure.
    #[error("payload encoding error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Compare-and-swap on a cache document lost.
    #[error(transparent)]
    Conflict(#[from] CacheConflict),
    /// A stored payload failed engine validation.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Anything else.
    #[error("{0}")]
    Message(String),
}

/// Result alias for persistence calls.
pub type PersistResult<T> = Result<T, PersistError>;

/// Durable destination for logs and cache documents.
pub trait LogSink: Send {
    /// Stores logs, ignoring ids already present. Returns how many were new.
    fn append_logs(&mut self, logs: &[StoredActionLog]) -> PersistResult<usize>;
    /// Writes a cache document iff the stored frontier equals `expected_heads`.
    fn write_cache(
        &mut self,
        cache: &SchedulingStateCache,
        expected_heads: Option<&BTreeSet<LogId>>,
    ) -> PersistResult<()>;
    /// Recomputes the task's cache document from the logs this sink holds,
    /// replacing whatever document is stored. Used to re-base after a
    /// compare-and-swap loss.
    fn refresh_cache(&mut self, task_id: &PromptTaskId, algorithm: AlgorithmName) -> PersistResult<()>;
    /// Makes prior writes durable.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
}
