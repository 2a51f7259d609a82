use std::collections::BTreeSet;

use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    engine::cache::EntryAccessor,
    error::EngineResult,
    log::{ActionLogDraft, ActionLogEntry, StoredActionLog},
    prompt::PromptTaskId,
    types::{LogId, Outcome, ServerTimestamp, TimestampMillis},
};

use super::indices::VecIndex;

/// A review to record locally; parents are filled from the local frontier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    /// Task under review.
    pub task_id: PromptTaskId,
    /// Review result.
    pub outcome: Outcome,
    /// Parameters needed to interpret the outcome.
    pub task_parameters: Option<Value>,
    /// Opaque provenance payload.
    pub context: Option<Value>,
    /// Review time.
    pub timestamp_millis: TimestampMillis,
}

/// Every held log in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshotV1 {
    /// Held logs.
    pub logs: Vec<StoredActionLog>,
}

/// Id-indexed arena of every log this replica has seen.
#[derive(Debug, Default)]
pub struct LogStore {
    logs: HashMap<LogId, StoredActionLog>,
    order: Vec<LogId>,
    by_task: VecIndex<PromptTaskId>,
    heads: HashMap<PromptTaskId, BTreeSet<LogId>>,
    has_child: HashSet<LogId>,
}

impl LogStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store by re-inserting snapshot logs.
    pub fn from_snapshot(snapshot: StoreSnapshotV1) -> EngineResult<Self> {
        let mut store = Self::new();
        for stored in snapshot.logs {
            store.insert(stored)?;
        }
        Ok(store)
    }

    /// Copies every held log out in arrival order.
    pub fn export_snapshot(&self) -> StoreSnapshotV1 {
        StoreSnapshotV1 {
            logs: self
                .order
                .iter()
                .filter_map(|id| self.logs.get(id).cloned())
                .collect(),
        }
    }

    /// Authors a log continuing this store's frontier for the task.
    pub fn record_review(&mut self, request: ReviewRequest) -> EngineResult<ActionLogEntry> {
        request
            .task_id
            .shape
            .check_parameters(request.task_parameters.as_ref())?;

        let draft = ActionLogDraft {
            parent_ids: self.heads(&request.task_id),
            task_id: request.task_id,
            outcome: request.outcome,
            task_parameters: request.task_parameters,
            context: request.context,
            timestamp_millis: request.timestamp_millis,
        };
        let entry = draft.into_entry()?;
        self.insert(StoredActionLog::unsynced(entry.clone()))?;
        Ok(entry)
    }

    /// Adds a log, deduplicating by id. Returns `false` if it was already held.
    ///
    /// A duplicate carrying a server timestamp stamps a held copy that had none.
    pub fn insert(&mut self, stored: StoredActionLog) -> EngineResult<bool> {
        stored.entry.verify()?;

        if let Some(held) = self.logs.get_mut(&stored.entry.id) {
            if held.server_timestamp.is_none() {
                held.server_timestamp = stored.server_timestamp;
            }
            return Ok(false);
        }

        let entry = &stored.entry;
        let heads = self.heads.entry(entry.task_id.clone()).or_default();
        for parent in &entry.parent_ids {
            heads.remove(parent);
            self.has_child.insert(parent.clone());
        }
        if !self.has_child.contains(&entry.id) {
            heads.insert(entry.id.clone());
        }

        self.by_task
            .entry(entry.task_id.clone())
            .or_default()
            .push(entry.id.clone());
        self.order.push(entry.id.clone());
        self.logs.insert(entry.id.clone(), stored);
        Ok(true)
    }

    /// Assigns a server timestamp to a held log that has none.
    pub fn stamp(&mut self, id: &LogId, at: ServerTimestamp) -> Option<&StoredActionLog> {
        let held = self.logs.get_mut(id)?;
        if held.server_timestamp.is_none() {
            held.server_timestamp = Some(at);
        }
        Some(held)
    }

    /// Looks up a held log.
    pub fn get(&self, id: &LogId) -> Option<&StoredActionLog> {
        self.logs.get(id)
    }

    /// True when the log is held.
    pub fn contains(&self, id: &LogId) -> bool {
        self.logs.contains_key(id)
    }

    /// True when some held log names `id` as a parent.
    pub fn has_child(&self, id: &LogId) -> bool {
        self.has_child.contains(id)
    }

    /// Childless logs held for the task.
    pub fn heads(&self, task_id: &PromptTaskId) -> BTreeSet<LogId> {
        self.heads.get(task_id).cloned().unwrap_or_default()
    }

    /// Logs held for the task, in arrival order.
    pub fn entries_for_task(&self, task_id: &PromptTaskId) -> Vec<&StoredActionLog> {
        self.by_task
            .get(task_id)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.logs.get(id))
            .collect()
    }

    /// Owned copy of [`Self::entries_for_task`].
    pub fn entries_for_task_cloned(&self, task_id: &PromptTaskId) -> Vec<StoredActionLog> {
        self.entries_for_task(task_id).into_iter().cloned().collect()
    }

    /// Tasks with at least one held log.
    pub fn task_ids(&self) -> impl Iterator<Item = &PromptTaskId> {
        self.by_task.keys()
    }

    /// Log ids in arrival order.
    pub fn ordered_ids(&self) -> &[LogId] {
        &self.order
    }

    /// Number of held logs.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no log is held.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[async_trait]
impl EntryAccessor for LogStore {
    async fn fetch_all_entries(&self, task_id: &PromptTaskId) -> EngineResult<Vec<StoredActionLog>> {
        Ok(self.entries_for_task_cloned(task_id))
    }
}
