//! Runtime event stream payloads.

use crate::{prompt::PromptTaskId, types::LogId};

/// Events emitted from the single-writer reconcile loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    /// A log extended the cached state on the fast path.
    Applied {
        /// Task whose cache changed.
        task_id: PromptTaskId,
        /// Log that was applied.
        log_id: LogId,
    },
    /// A log forced a full re-merge of the task's history.
    Remerged {
        /// Task whose cache changed.
        task_id: PromptTaskId,
        /// Log that triggered the merge.
        log_id: LogId,
        /// Size of the resulting frontier.
        heads: usize,
    },
    /// A log was already held; nothing changed.
    Duplicate {
        /// Log that was seen again.
        log_id: LogId,
    },
    /// A log was stored but could not be folded; the cache is unchanged.
    Rejected {
        /// Task the log belongs to.
        task_id: PromptTaskId,
        /// Offending log.
        log_id: LogId,
        /// Rendered engine error.
        reason: String,
    },
    /// A persistence batch failed; its unwritten items are retried.
    PersistFailed {
        /// Rendered persistence error.
        reason: String,
    },
    /// Persistence has written at least this many logs.
    DurableUpTo {
        /// Total logs written by the persistence worker.
        logs: u64,
    },
}
