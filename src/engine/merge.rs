use std::{
    cmp::Reverse,
    collections::{BTreeSet, BinaryHeap},
};

use hashbrown::HashMap;

use crate::{
    error::{EngineError, EngineResult},
    log::ActionLogEntry,
    prompt::PromptTaskId,
    schedule::{schedule_fn, AlgorithmName, ReviewSchedule},
    state::SchedulingState,
    types::{LogId, TimestampMillis},
};

use super::apply::fold_entry;

/// Arena of one task's logs, indexed by id, with parent links kept as ids.
///
/// Duplicate ids collapse to a single node; ids are content digests, so
/// duplicates are identical.
#[derive(Debug)]
pub struct LogGraph<'a> {
    task_id: &'a PromptTaskId,
    nodes: Vec<&'a ActionLogEntry>,
    index: HashMap<&'a LogId, usize>,
    children: Vec<Vec<usize>>,
    indegree: Vec<usize>,
}

impl<'a> LogGraph<'a> {
    /// Builds the arena, rejecting dangling parents and mixed tasks.
    pub fn build<I>(entries: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = &'a ActionLogEntry>,
    {
        let mut nodes: Vec<&'a ActionLogEntry> = Vec::new();
        let mut index: HashMap<&'a LogId, usize> = HashMap::new();
        for entry in entries {
            if index.contains_key(&entry.id) {
                continue;
            }
            if let Some(first) = nodes.first() {
                if first.task_id != entry.task_id {
                    return Err(EngineError::InvalidContent(format!(
                        "log {} is for task {}, expected {}",
                        entry.id, entry.task_id, first.task_id
                    )));
                }
            }
            index.insert(&entry.id, nodes.len());
            nodes.push(entry);
        }

        let Some(&first) = nodes.first() else {
            return Err(EngineError::IncompleteHistory("no logs to merge".to_string()));
        };
        let task_id: &'a PromptTaskId = &first.task_id;

        let mut children = vec![Vec::new(); nodes.len()];
        let mut indegree = vec![0usize; nodes.len()];
        for (idx, entry) in nodes.iter().enumerate() {
            for parent in &entry.parent_ids {
                let Some(&parent_idx) = index.get(parent) else {
                    return Err(EngineError::IncompleteHistory(format!(
                        "log {} references missing parent {parent}",
                        entry.id
                    )));
                };
                children[parent_idx].push(idx);
                indegree[idx] += 1;
            }
        }

        if !nodes.iter().any(|e| e.is_root()) {
            return Err(EngineError::IncompleteHistory(format!(
                "task {task_id} has no root log"
            )));
        }

        Ok(Self {
            task_id,
            nodes,
            index,
            children,
            indegree,
        })
    }

    /// Number of distinct logs.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the graph holds no logs; never the case for a built graph.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Task every log in the graph belongs to.
    pub fn task_id(&self) -> &PromptTaskId {
        self.task_id
    }

    /// True when the graph holds a log with this id.
    pub fn contains(&self, id: &LogId) -> bool {
        self.index.contains_key(id)
    }

    /// Ids of logs with no child.
    pub fn heads(&self) -> BTreeSet<LogId> {
        self.children
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_empty())
            .map(|(idx, _)| self.nodes[idx].id.clone())
            .collect()
    }

    /// Causal order, breaking ties by `(timestamp_millis, id)` ascending.
    pub fn fold_order(&self) -> EngineResult<Vec<&'a ActionLogEntry>> {
        let mut indegree = self.indegree.clone();
        let mut ready: BinaryHeap<Reverse<(TimestampMillis, &'a LogId, usize)>> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(idx, _)| indegree[*idx] == 0)
            .map(|(idx, &e)| Reverse((e.timestamp_millis, &e.id, idx)))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse((_, _, idx))) = ready.pop() {
            order.push(self.nodes[idx]);
            for &child in &self.children[idx] {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    let e = self.nodes[child];
                    ready.push(Reverse((e.timestamp_millis, &e.id, child)));
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(EngineError::IncompleteHistory(format!(
                "task {} has a parent cycle",
                self.task_id
            )));
        }
        Ok(order)
    }
}

/// Folds every log of one task into a single canonical state.
///
/// The result depends only on the set of logs, never on their order in
/// `entries`.
pub fn merge<'a, I>(entries: I, algorithm: AlgorithmName) -> EngineResult<SchedulingState>
where
    I: IntoIterator<Item = &'a ActionLogEntry>,
{
    let f = schedule_fn(algorithm)?;
    let graph = LogGraph::build(entries)?;

    let mut running: Option<ReviewSchedule> = None;
    for entry in graph.fold_order()? {
        entry.verify()?;
        running = Some(fold_entry(running.as_ref(), entry, f)?);
    }

    let schedule = running.ok_or_else(|| EngineError::IncompleteHistory("no logs to merge".to_string()))?;
    Ok(SchedulingState {
        task_id: graph.task_id().clone(),
        head_log_ids: graph.heads(),
        schedule,
    })
}
