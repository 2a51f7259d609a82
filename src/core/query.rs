use serde::{Deserialize, Serialize};

use crate::{prompt::PromptTaskId, types::TimestampMillis};

/// Comparison applied to a task's due time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    /// `=`
    #[serde(rename = "=")]
    Eq,
    /// `<`
    #[serde(rename = "<")]
    Lt,
    /// `<=`
    #[serde(rename = "<=")]
    Le,
    /// `>`
    #[serde(rename = ">")]
    Gt,
    /// `>=`
    #[serde(rename = ">=")]
    Ge,
}

impl Relation {
    /// Evaluates `lhs <relation> rhs`.
    pub fn holds(self, lhs: TimestampMillis, rhs: TimestampMillis) -> bool {
        match self {
            Relation::Eq => lhs == rhs,
            Relation::Lt => lhs < rhs,
            Relation::Le => lhs <= rhs,
            Relation::Gt => lhs > rhs,
            Relation::Ge => lhs >= rhs,
        }
    }

    /// SQL operator text.
    pub fn as_sql(self) -> &'static str {
        match self {
            Relation::Eq => "=",
            Relation::Lt => "<",
            Relation::Le => "<=",
            Relation::Gt => ">",
            Relation::Ge => ">=",
        }
    }
}

/// Predicate over `dueTimestampMillis`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuePredicate {
    /// Comparison.
    pub relation: Relation,
    /// Right-hand side.
    pub value: TimestampMillis,
}

/// Page of cached task states, ordered by task id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQuery {
    /// Optional due-time filter.
    pub predicate: Option<DuePredicate>,
    /// Return only tasks ordered strictly after this one.
    pub after_id: Option<PromptTaskId>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl TaskQuery {
    /// Tasks due at or before `at`.
    pub fn due_by(at: TimestampMillis) -> Self {
        Self {
            predicate: Some(DuePredicate {
                relation: Relation::Le,
                value: at,
            }),
            ..Self::default()
        }
    }

    /// Same query with a page size.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Same query resumed after `task_id`.
    pub fn after(mut self, task_id: PromptTaskId) -> Self {
        self.after_id = Some(task_id);
        self
    }

    /// True when a task with this id and due time passes the filters.
    pub fn matches(&self, task_id: &PromptTaskId, due: TimestampMillis) -> bool {
        let after_ok = self.after_id.as_ref().is_none_or(|after| task_id > after);
        let pred_ok = self.predicate.is_none_or(|p| p.relation.holds(due, p.value));
        after_ok && pred_ok
    }
}
