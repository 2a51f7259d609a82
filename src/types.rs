//! Shared primitive identifiers, outcomes, and server timestamps.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Wall-clock milliseconds since the Unix epoch.
pub type TimestampMillis = u64;

/// Latest review time a log may carry (end of year 9999). Keeps every due
/// time the curves produce strictly after the review that produced it.
pub const MAX_TIMESTAMP_MILLIS: TimestampMillis = 253_402_300_799_999;

/// Content-addressed action log identifier (lowercase hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(pub String);

/// Content-addressed prompt identifier (lowercase hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptId(pub String);

impl LogId {
    /// Borrows the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PromptId {
    /// Borrows the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for PromptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a single review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    /// The learner recalled the answer.
    Remembered,
    /// The learner failed to recall the answer.
    Forgotten,
    /// The learner chose not to review the prompt this time.
    Skipped,
}

/// Server-assigned write timestamp, used only for freshness comparisons.
///
/// Ordering is lexicographic on `(seconds, nanoseconds)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ServerTimestamp {
    /// Whole seconds since the Unix epoch.
    pub seconds: i64,
    /// Sub-second nanoseconds.
    pub nanoseconds: u32,
}

impl ServerTimestamp {
    /// The minimum marker, equivalent to "absent".
    pub const ZERO: Self = Self {
        seconds: 0,
        nanoseconds: 0,
    };

    /// Current wall-clock time, as storage stamps a write.
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| Self {
                seconds: d.as_secs() as i64,
                nanoseconds: d.subsec_nanos(),
            })
            .unwrap_or(Self::ZERO)
    }
}

/// Returns the later of two markers, treating `None` as the minimum.
pub fn max_server_timestamp(
    a: Option<ServerTimestamp>,
    b: Option<ServerTimestamp>,
) -> Option<ServerTimestamp> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}
