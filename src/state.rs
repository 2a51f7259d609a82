//! Materialized scheduling state and its cached, freshness-stamped form.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    prompt::PromptTaskId,
    schedule::ReviewSchedule,
    types::{LogId, ServerTimestamp, TimestampMillis},
};

/// Deterministic fold of a task's log DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingState {
    /// Task this state belongs to.
    pub task_id: PromptTaskId,
    /// Childless logs of the folded DAG.
    pub head_log_ids: BTreeSet<LogId>,
    /// Interval, due time, and review history.
    #[serde(flatten)]
    pub schedule: ReviewSchedule,
}

impl SchedulingState {
    /// When the task is next due.
    pub fn due_timestamp_millis(&self) -> TimestampMillis {
        self.schedule.due_timestamp_millis
    }
}

/// Cache document: a state plus the newest server write time folded into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingStateCache {
    /// Cached state.
    #[serde(flatten)]
    pub state: SchedulingState,
    /// Maximum server timestamp among folded logs.
    pub latest_log_server_timestamp: ServerTimestamp,
}

impl SchedulingStateCache {
    /// Task this cache belongs to.
    pub fn task_id(&self) -> &PromptTaskId {
        &self.state.task_id
    }

    /// Frontier recorded in the cache.
    pub fn head_log_ids(&self) -> &BTreeSet<LogId> {
        &self.state.head_log_ids
    }
}
