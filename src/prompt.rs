//! Prompt content, task shapes, and task-parameter validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{EngineError, EngineResult},
    id::prompt_id_for,
    types::PromptId,
};

/// Key carried in `taskParameters` by cloze reviews.
pub const CLOZE_INDEX_KEY: &str = "clozeIndex";
/// Key carried in `taskParameters` by application-prompt reviews.
pub const VARIANT_INDEX_KEY: &str = "variantIndex";

/// A question/answer pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaPair {
    /// Question text.
    pub question: String,
    /// Answer text.
    pub answer: String,
}

/// Learning prompt content. Identity is derived from this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Prompt {
    /// A single question and answer.
    Basic(QaPair),
    /// Text with `{...}` deletions, each reviewed in turn.
    Cloze {
        /// Body containing one or more `{...}` deletions.
        body: String,
    },
    /// Several interchangeable question/answer variants.
    Application {
        /// Variants shown one at a time.
        variants: Vec<QaPair>,
    },
}

impl Prompt {
    /// Rejects prompts that could never be reviewed.
    pub fn validate(&self) -> EngineResult<()> {
        match self {
            Prompt::Basic(qa) => validate_qa(qa),
            Prompt::Cloze { body } => {
                if cloze_deletion_count(body) == 0 {
                    return Err(EngineError::InvalidContent(
                        "cloze body has no {...} deletion".to_string(),
                    ));
                }
                Ok(())
            }
            Prompt::Application { variants } => {
                if variants.is_empty() {
                    return Err(EngineError::InvalidContent(
                        "application prompt has no variants".to_string(),
                    ));
                }
                variants.iter().try_for_each(validate_qa)
            }
        }
    }

    /// Shape of the task reviewing this prompt.
    pub fn shape(&self) -> TaskShape {
        match self {
            Prompt::Basic(_) => TaskShape::Basic,
            Prompt::Cloze { body } => TaskShape::Cloze {
                deletions: cloze_deletion_count(body) as u32,
            },
            Prompt::Application { variants } => TaskShape::Application {
                variants: variants.len() as u32,
            },
        }
    }
}

fn validate_qa(qa: &QaPair) -> EngineResult<()> {
    if qa.question.trim().is_empty() || qa.answer.trim().is_empty() {
        return Err(EngineError::InvalidContent(
            "question and answer must be non-empty".to_string(),
        ));
    }
    Ok(())
}

/// Counts non-empty, non-nested `{...}` deletions in a cloze body.
pub fn cloze_deletion_count(body: &str) -> usize {
    let mut count = 0;
    let mut open: Option<usize> = None;
    for (idx, ch) in body.char_indices() {
        match ch {
            '{' => open = Some(idx),
            '}' => {
                if let Some(start) = open.take() {
                    if !body[start + 1..idx].trim().is_empty() {
                        count += 1;
                    }
                }
            }
            _ => {}
        }
    }
    count
}

/// How a task's reviews must be parameterized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskShape {
    /// No parameters.
    Basic,
    /// `{"clozeIndex": n}` with `n < deletions`.
    Cloze {
        /// Number of deletions in the body.
        deletions: u32,
    },
    /// `{"variantIndex": n}` with `n < variants`.
    Application {
        /// Number of variants.
        variants: u32,
    },
}

impl TaskShape {
    /// Checks that a review's `taskParameters` fit this shape.
    pub fn check_parameters(&self, params: Option<&Value>) -> EngineResult<()> {
        match (self, params) {
            (TaskShape::Basic, None) => Ok(()),
            (TaskShape::Basic, Some(_)) => Err(EngineError::InvalidOutcomeForTaskType(
                "basic tasks take no parameters".to_string(),
            )),
            (TaskShape::Cloze { deletions }, params) => {
                check_index(params, CLOZE_INDEX_KEY, *deletions)
            }
            (TaskShape::Application { variants }, params) => {
                check_index(params, VARIANT_INDEX_KEY, *variants)
            }
        }
    }
}

fn check_index(params: Option<&Value>, key: &str, bound: u32) -> EngineResult<()> {
    let index = params
        .and_then(|p| p.get(key))
        .and_then(Value::as_u64)
        .ok_or_else(|| EngineError::InvalidOutcomeForTaskType(format!("missing {key}")))?;
    if index >= u64::from(bound) {
        return Err(EngineError::InvalidOutcomeForTaskType(format!(
            "{key} {index} out of range (< {bound})"
        )));
    }
    Ok(())
}

/// Identifies the task reviewing one prompt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTaskId {
    /// Prompt under review.
    pub prompt_id: PromptId,
    /// Parameter shape derived from the prompt content.
    pub shape: TaskShape,
}

impl PromptTaskId {
    /// Derives the task identifier for `prompt`.
    pub fn for_prompt(prompt: &Prompt) -> EngineResult<Self> {
        Ok(Self {
            prompt_id: prompt_id_for(prompt)?,
            shape: prompt.shape(),
        })
    }
}

impl fmt::Display for PromptTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prompt_id)
    }
}
