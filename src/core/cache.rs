use std::collections::BTreeSet;

use hashbrown::HashMap;

use crate::{prompt::PromptTaskId, state::SchedulingStateCache, types::LogId};

use super::query::TaskQuery;

/// A cache write whose expected frontier no longer matches the stored one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cache for task {task_id} changed: expected heads {expected:?}, found {found:?}")]
pub struct CacheConflict {
    /// Task whose cache was contended.
    pub task_id: PromptTaskId,
    /// Frontier the writer based its update on.
    pub expected: Option<BTreeSet<LogId>>,
    /// Frontier actually stored.
    pub found: Option<BTreeSet<LogId>>,
}

/// Per-task cached scheduling states.
#[derive(Debug, Default, Clone)]
pub struct StateCacheTable {
    entries: HashMap<PromptTaskId, SchedulingStateCache>,
}

impl StateCacheTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cache for the task.
    pub fn get(&self, task_id: &PromptTaskId) -> Option<&SchedulingStateCache> {
        self.entries.get(task_id)
    }

    /// Replaces the task's cache iff its frontier still equals `expected_heads`
    /// (`None` meaning "no cache yet"). Returns the replaced value.
    pub fn compare_and_swap(
        &mut self,
        expected_heads: Option<&BTreeSet<LogId>>,
        next: SchedulingStateCache,
    ) -> Result<Option<SchedulingStateCache>, CacheConflict> {
        let found = self.entries.get(next.task_id()).map(|c| c.head_log_ids());
        if found != expected_heads {
            return Err(CacheConflict {
                task_id: next.task_id().clone(),
                expected: expected_heads.cloned(),
                found: found.cloned(),
            });
        }
        Ok(self.entries.insert(next.task_id().clone(), next))
    }

    /// Adopts a cache computed by another replica if it has seen newer logs.
    pub fn accept_if_fresher(&mut self, incoming: SchedulingStateCache) -> bool {
        let fresher = self.entries.get(incoming.task_id()).is_none_or(|held| {
            incoming.latest_log_server_timestamp > held.latest_log_server_timestamp
        });
        if fresher {
            self.entries.insert(incoming.task_id().clone(), incoming);
        }
        fresher
    }

    /// Cached states passing `query`, ordered by task id.
    pub fn query(&self, query: &TaskQuery) -> Vec<&SchedulingStateCache> {
        let mut hits: Vec<&SchedulingStateCache> = self
            .entries
            .values()
            .filter(|c| query.matches(c.task_id(), c.state.due_timestamp_millis()))
            .collect();
        hits.sort_by(|a, b| a.task_id().cmp(b.task_id()));
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        hits
    }

    /// Number of cached tasks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All cached states in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &SchedulingStateCache> {
        self.entries.values()
    }
}

impl FromIterator<SchedulingStateCache> for StateCacheTable {
    fn from_iter<I: IntoIterator<Item = SchedulingStateCache>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|c| (c.task_id().clone(), c))
                .collect(),
        }
    }
}
