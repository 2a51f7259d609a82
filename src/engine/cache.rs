//! Keeps a task's cached scheduling state current as logs arrive.
//!
//! The common case is a single device reviewing linearly: the new log names
//! the cached frontier as its parents and one schedule step suffices. Anything
//! else (a stale cache, a fork between devices, a first log arriving after a
//! later one) falls back to fetching every log for the task and re-merging.
//! Failures never produce a partial value; the caller keeps its old cache.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    error::EngineResult,
    log::StoredActionLog,
    prompt::PromptTaskId,
    schedule::AlgorithmName,
    state::SchedulingStateCache,
    types::{max_server_timestamp, ServerTimestamp},
};

use super::{
    apply::{apply, ApplyOutcome},
    merge::merge,
};

/// Storage seam used by the slow path.
///
/// Implementations map their own failures to [`crate::error::EngineError::Fetch`]. The
/// returned set must be causally complete or the merge reports
/// [`crate::error::EngineError::IncompleteHistory`].
#[async_trait]
pub trait EntryAccessor: Send + Sync {
    /// Returns every stored log for `task_id`.
    async fn fetch_all_entries(&self, task_id: &PromptTaskId) -> EngineResult<Vec<StoredActionLog>>;
}

/// Which path produced a [`CacheUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePath {
    /// One schedule step on top of the cached state.
    FastPath,
    /// Full re-merge over every fetched log.
    Remerged,
}

/// New cache value plus how it was computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheUpdate {
    /// Value to store in place of the previous cache.
    pub cache: SchedulingStateCache,
    /// Path that produced it.
    pub path: UpdatePath,
}

/// Computes the cache value that results from observing `stored`.
pub async fn apply_log_to_cache<A>(
    stored: &StoredActionLog,
    base: Option<&SchedulingStateCache>,
    accessor: &A,
    algorithm: AlgorithmName,
) -> EngineResult<CacheUpdate>
where
    A: EntryAccessor + ?Sized,
{
    let entry = &stored.entry;
    match apply(base.map(|c| &c.state), entry, algorithm)? {
        ApplyOutcome::Applied(state) => {
            let latest = max_server_timestamp(
                stored.server_timestamp,
                base.map(|c| c.latest_log_server_timestamp),
            )
            .unwrap_or(ServerTimestamp::ZERO);
            debug!(task_id = %entry.task_id, log_id = %entry.id, "applied log on fast path");
            Ok(CacheUpdate {
                cache: SchedulingStateCache {
                    state,
                    latest_log_server_timestamp: latest,
                },
                path: UpdatePath::FastPath,
            })
        }
        ApplyOutcome::NotApplicable {
            expected_heads,
            parent_ids,
        } => {
            info!(
                task_id = %entry.task_id,
                log_id = %entry.id,
                expected = expected_heads.len(),
                parents = parent_ids.len(),
                "log does not continue cached frontier; re-merging"
            );
            let mut all = accessor.fetch_all_entries(&entry.task_id).await?;
            all.push(stored.clone());
            let cache = merge_stored(&all, algorithm)?;
            info!(
                task_id = %entry.task_id,
                entries = all.len(),
                heads = cache.state.head_log_ids.len(),
                "re-merged task history"
            );
            Ok(CacheUpdate {
                cache,
                path: UpdatePath::Remerged,
            })
        }
    }
}

/// Builds a cache document from a task's complete set of stored logs.
pub fn merge_stored(
    logs: &[StoredActionLog],
    algorithm: AlgorithmName,
) -> EngineResult<SchedulingStateCache> {
    let state = merge(logs.iter().map(|s| &s.entry), algorithm)?;
    let latest = logs
        .iter()
        .fold(ServerTimestamp::ZERO, |max, s| {
            max_server_timestamp(Some(max), s.server_timestamp).unwrap_or(max)
        });
    Ok(SchedulingStateCache {
        state,
        latest_log_server_timestamp: latest,
    })
}
