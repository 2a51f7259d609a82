//! Pure schedule functions selected by a registered algorithm name.
//!
//! The schedule never reads a clock: the review time travels in [`Review`], so
//! replaying the same history under the same [`AlgorithmName`] always yields the
//! same [`ReviewSchedule`].

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    error::{EngineError, EngineResult},
    types::{Outcome, TimestampMillis},
};

/// Interval curves backing each registered algorithm.
pub mod curves;

/// Registered schedule algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlgorithmName {
    /// Five-day start, x2.3 growth.
    #[default]
    Default,
    /// One-day start, x3 growth.
    AggressiveStart,
}

impl AlgorithmName {
    /// Every registered algorithm.
    pub const ALL: [AlgorithmName; 2] = [AlgorithmName::Default, AlgorithmName::AggressiveStart];

    /// Stable selector string.
    pub fn as_str(self) -> &'static str {
        match self {
            AlgorithmName::Default => "default",
            AlgorithmName::AggressiveStart => "aggressiveStart",
        }
    }
}

impl fmt::Display for AlgorithmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlgorithmName {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlgorithmName::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| EngineError::UnknownAlgorithm(s.to_string()))
    }
}

/// One review to feed through a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Review {
    /// Review result.
    pub outcome: Outcome,
    /// When the review happened.
    pub timestamp_millis: TimestampMillis,
}

/// Spaced-repetition parameters for one task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSchedule {
    /// Current interval.
    pub interval_millis: u64,
    /// When the task is next eligible for review.
    pub due_timestamp_millis: TimestampMillis,
    /// Time of the last remembered/forgotten review; skips do not count.
    pub last_review_timestamp_millis: Option<TimestampMillis>,
    /// Remembered plus forgotten reviews folded so far.
    pub review_count: u32,
    /// Forgotten reviews folded so far.
    pub lapse_count: u32,
}

/// Signature every registered algorithm implements.
pub type ScheduleFn = fn(Option<&ReviewSchedule>, Review) -> ReviewSchedule;

const REGISTRY: &[(AlgorithmName, ScheduleFn)] = &[
    (AlgorithmName::Default, curves::default_schedule),
    (AlgorithmName::AggressiveStart, curves::aggressive_start_schedule),
];

/// Resolves an algorithm to its schedule function.
pub fn schedule_fn(algorithm: AlgorithmName) -> EngineResult<ScheduleFn> {
    REGISTRY
        .iter()
        .find(|(name, _)| *name == algorithm)
        .map(|(_, f)| *f)
        .ok_or_else(|| EngineError::UnknownAlgorithm(algorithm.as_str().to_string()))
}

/// Computes the schedule that follows `prior` after `review`.
pub fn schedule(
    prior: Option<&ReviewSchedule>,
    review: Review,
    algorithm: AlgorithmName,
) -> EngineResult<ReviewSchedule> {
    Ok(schedule_fn(algorithm)?(prior, review))
}

/// Like [`schedule`], resolving the algorithm from its selector string.
pub fn schedule_by_name(
    prior: Option<&ReviewSchedule>,
    review: Review,
    algorithm: &str,
) -> EngineResult<ReviewSchedule> {
    schedule(prior, review, algorithm.parse()?)
}
