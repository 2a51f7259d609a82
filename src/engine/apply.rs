use std::collections::BTreeSet;

use crate::{
    error::{EngineError, EngineResult},
    log::ActionLogEntry,
    schedule::{schedule, AlgorithmName, Review, ReviewSchedule, ScheduleFn},
    state::SchedulingState,
    types::LogId,
};

/// Result of trying to extend a state by exactly one log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The log continued the frontier; here is the next state.
    Applied(SchedulingState),
    /// The log's parents are not the state's frontier; a full merge is required.
    NotApplicable {
        /// Frontier of the prior state (empty when there is none).
        expected_heads: BTreeSet<LogId>,
        /// Parents the log actually names.
        parent_ids: BTreeSet<LogId>,
    },
}

/// True when `entry` continues directly from `prior`'s frontier.
pub fn can_apply(prior: Option<&SchedulingState>, entry: &ActionLogEntry) -> bool {
    match prior {
        None => entry.parent_ids.is_empty(),
        Some(state) => entry.parent_ids == state.head_log_ids,
    }
}

/// Applies one log to `prior`, or reports that it does not continue it.
///
/// Content and task-parameter errors are reported even when the log would
/// not have been applicable.
pub fn apply(
    prior: Option<&SchedulingState>,
    entry: &ActionLogEntry,
    algorithm: AlgorithmName,
) -> EngineResult<ApplyOutcome> {
    entry.verify()?;
    if let Some(state) = prior {
        if state.task_id != entry.task_id {
            return Err(EngineError::InvalidContent(format!(
                "log {} is for task {}, state is for task {}",
                entry.id, entry.task_id, state.task_id
            )));
        }
    }
    entry
        .task_id
        .shape
        .check_parameters(entry.task_parameters.as_ref())?;

    if !can_apply(prior, entry) {
        return Ok(ApplyOutcome::NotApplicable {
            expected_heads: prior.map(|s| s.head_log_ids.clone()).unwrap_or_default(),
            parent_ids: entry.parent_ids.clone(),
        });
    }

    let schedule = schedule(prior.map(|s| &s.schedule), review_of(entry), algorithm)?;
    Ok(ApplyOutcome::Applied(SchedulingState {
        task_id: entry.task_id.clone(),
        head_log_ids: BTreeSet::from([entry.id.clone()]),
        schedule,
    }))
}

pub(crate) fn review_of(entry: &ActionLogEntry) -> Review {
    Review {
        outcome: entry.outcome,
        timestamp_millis: entry.timestamp_millis,
    }
}

pub(crate) fn fold_entry(
    running: Option<&ReviewSchedule>,
    entry: &ActionLogEntry,
    f: ScheduleFn,
) -> EngineResult<ReviewSchedule> {
    entry
        .task_id
        .shape
        .check_parameters(entry.task_parameters.as_ref())?;
    Ok(f(running, review_of(entry)))
}
