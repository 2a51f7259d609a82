//! Immutable action log entries and their storage wrappers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{EngineError, EngineResult},
    id::{is_digest, log_id_for},
    prompt::PromptTaskId,
    types::{LogId, Outcome, ServerTimestamp, TimestampMillis, MAX_TIMESTAMP_MILLIS},
};

/// Version number for serialized [`StoredLogEnvelope`] payloads.
pub const LOG_FORMAT_VERSION: u16 = 1;

/// Everything in a log except its identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogDraft {
    /// Task under review.
    pub task_id: PromptTaskId,
    /// Logs this one causally follows; empty for a task's first review.
    pub parent_ids: BTreeSet<LogId>,
    /// Review result.
    pub outcome: Outcome,
    /// Parameters needed to interpret the outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_parameters: Option<Value>,
    /// Opaque provenance payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// Client-reported review time.
    pub timestamp_millis: TimestampMillis,
}

impl ActionLogDraft {
    /// Rejects drafts whose content cannot be addressed.
    pub fn validate(&self) -> EngineResult<()> {
        if let Some(bad) = self.parent_ids.iter().find(|p| !is_digest(p.as_str())) {
            return Err(EngineError::InvalidContent(format!(
                "parent id {bad:?} is not a log digest"
            )));
        }
        if self.timestamp_millis > MAX_TIMESTAMP_MILLIS {
            return Err(EngineError::InvalidContent(format!(
                "timestamp {} is past {MAX_TIMESTAMP_MILLIS}",
                self.timestamp_millis
            )));
        }
        if matches!(self.task_parameters, Some(Value::Null)) || matches!(self.context, Some(Value::Null)) {
            return Err(EngineError::InvalidContent(
                "explicit null payload; use an absent field".to_string(),
            ));
        }
        Ok(())
    }

    /// Seals the draft into an entry with its content-derived id.
    pub fn into_entry(self) -> EngineResult<ActionLogEntry> {
        let id = log_id_for(&self)?;
        Ok(ActionLogEntry {
            id,
            task_id: self.task_id,
            parent_ids: self.parent_ids,
            outcome: self.outcome,
            task_parameters: self.task_parameters,
            context: self.context,
            timestamp_millis: self.timestamp_millis,
        })
    }
}

/// Immutable, content-addressed record of one review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    /// Digest of every other field.
    pub id: LogId,
    /// Task under review.
    pub task_id: PromptTaskId,
    /// Logs this one causally follows.
    pub parent_ids: BTreeSet<LogId>,
    /// Review result.
    pub outcome: Outcome,
    /// Parameters needed to interpret the outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_parameters: Option<Value>,
    /// Opaque provenance payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// Client-reported review time; a tie-break only.
    pub timestamp_millis: TimestampMillis,
}

impl ActionLogEntry {
    /// Copies the addressed content back out.
    pub fn to_draft(&self) -> ActionLogDraft {
        ActionLogDraft {
            task_id: self.task_id.clone(),
            parent_ids: self.parent_ids.clone(),
            outcome: self.outcome,
            task_parameters: self.task_parameters.clone(),
            context: self.context.clone(),
            timestamp_millis: self.timestamp_millis,
        }
    }

    /// Fails unless `id` matches the entry's content.
    pub fn verify(&self) -> EngineResult<()> {
        let expected = log_id_for(&self.to_draft())?;
        if expected != self.id {
            return Err(EngineError::InvalidContent(format!(
                "log {} does not match its content (expected {expected})",
                self.id
            )));
        }
        Ok(())
    }

    /// True for a task's first review.
    pub fn is_root(&self) -> bool {
        self.parent_ids.is_empty()
    }
}

/// An entry as held by storage, with its server write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredActionLog {
    /// The entry itself.
    #[serde(flatten)]
    pub entry: ActionLogEntry,
    /// Assigned by storage at write time; absent until synced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<ServerTimestamp>,
}

impl StoredActionLog {
    /// Wraps an entry that has not been written yet.
    pub fn unsynced(entry: ActionLogEntry) -> Self {
        Self {
            entry,
            server_timestamp: None,
        }
    }

    /// Wraps an entry with a known server write time.
    pub fn synced(entry: ActionLogEntry, server_timestamp: ServerTimestamp) -> Self {
        Self {
            entry,
            server_timestamp: Some(server_timestamp),
        }
    }
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLogEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped log.
    pub stored: StoredActionLog,
}

impl StoredLogEnvelope {
    /// Constructs an envelope using [`LOG_FORMAT_VERSION`].
    pub fn new(stored: StoredActionLog) -> Self {
        Self {
            format_version: LOG_FORMAT_VERSION,
            stored,
        }
    }
}
