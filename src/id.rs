//! Content-addressed identifiers for prompts and action logs.
//!
//! An identifier is the SHA-256 of a domain tag followed by the canonical JSON
//! encoding of the content. `serde_json` objects are key-sorted, so two values
//! that are equal field-for-field always encode to the same bytes.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{
    error::{EngineError, EngineResult},
    log::ActionLogDraft,
    prompt::Prompt,
    types::{LogId, PromptId},
};

const LOG_TAG: &[u8] = b"log:";
const PROMPT_TAG: &[u8] = b"prompt:";

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Derives the identifier of an action log from its content.
pub fn log_id_for(draft: &ActionLogDraft) -> EngineResult<LogId> {
    draft.validate()?;
    content_digest(LOG_TAG, draft).map(LogId)
}

/// Derives the identifier of a prompt from its content.
pub fn prompt_id_for(prompt: &Prompt) -> EngineResult<PromptId> {
    prompt.validate()?;
    content_digest(PROMPT_TAG, prompt).map(PromptId)
}

/// True when `s` has the shape of an identifier produced by this module.
pub fn is_digest(s: &str) -> bool {
    s.len() == DIGEST_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn content_digest<T: Serialize>(tag: &[u8], value: &T) -> EngineResult<String> {
    // Round-trip through `Value` so nested maps come out key-sorted.
    let canonical = serde_json::to_value(value)
        .and_then(|v| serde_json::to_vec(&v))
        .map_err(|e| EngineError::InvalidContent(format!("unencodable content: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(tag);
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}
