use std::collections::BTreeSet;

use proptest::prelude::*;
use serde_json::json;

use reviewlog::{
    engine::{
        apply::{apply, can_apply, ApplyOutcome},
        merge::{merge, LogGraph},
    },
    error::EngineError,
    log::{ActionLogDraft, ActionLogEntry},
    prompt::{Prompt, PromptTaskId, QaPair},
    schedule::AlgorithmName,
    state::SchedulingState,
    types::{LogId, Outcome},
};

fn task(question: &str) -> PromptTaskId {
    PromptTaskId::for_prompt(&Prompt::Basic(QaPair {
        question: question.to_string(),
        answer: "a".to_string(),
    }))
    .expect("task")
}

fn entry(task_id: &PromptTaskId, parents: &[&ActionLogEntry], outcome: Outcome, ts: u64) -> ActionLogEntry {
    ActionLogDraft {
        task_id: task_id.clone(),
        parent_ids: parents.iter().map(|p| p.id.clone()).collect(),
        outcome,
        task_parameters: None,
        context: None,
        timestamp_millis: ts,
    }
    .into_entry()
    .expect("entry")
}

fn applied(outcome: ApplyOutcome) -> SchedulingState {
    match outcome {
        ApplyOutcome::Applied(state) => state,
        ApplyOutcome::NotApplicable { .. } => panic!("expected log to apply"),
    }
}

fn ids(entries: &[&ActionLogEntry]) -> BTreeSet<LogId> {
    entries.iter().map(|e| e.id.clone()).collect()
}

#[test]
fn linear_history_fast_path_matches_merge() {
    let t = task("linear?");
    let r = entry(&t, &[], Outcome::Remembered, 1_000);
    let a = entry(&t, &[&r], Outcome::Forgotten, 2_000);
    let b = entry(&t, &[&a], Outcome::Remembered, 3_000);

    let mut state: Option<SchedulingState> = None;
    for e in [&r, &a, &b] {
        assert!(can_apply(state.as_ref(), e));
        state = Some(applied(apply(state.as_ref(), e, AlgorithmName::Default).expect("apply")));
    }
    let fast = state.expect("state");

    let merged = merge([&b, &r, &a], AlgorithmName::Default).expect("merge");
    assert_eq!(fast, merged);
    assert_eq!(merged.head_log_ids, ids(&[&b]));
}

#[test]
fn fork_keeps_both_branches_in_the_frontier() {
    let t = task("fork?");
    let r = entry(&t, &[], Outcome::Remembered, 1_000);
    let phone = entry(&t, &[&r], Outcome::Remembered, 5_000);
    let laptop = entry(&t, &[&r], Outcome::Forgotten, 6_000);

    let merged = merge([&laptop, &phone, &r], AlgorithmName::Default).expect("merge");
    assert_eq!(merged.head_log_ids, ids(&[&phone, &laptop]));
    assert_eq!(merged.schedule.review_count, 3);
    assert_eq!(merged.schedule.lapse_count, 1);

    // A log naming both branches collapses the frontier and applies directly.
    let join = entry(&t, &[&phone, &laptop], Outcome::Remembered, 7_000);
    let next = applied(apply(Some(&merged), &join, AlgorithmName::Default).expect("apply"));
    assert_eq!(next.head_log_ids, ids(&[&join]));
    assert_eq!(
        next,
        merge([&r, &phone, &laptop, &join], AlgorithmName::Default).expect("merge all")
    );
}

#[test]
fn concurrent_logs_fold_in_timestamp_order() {
    let t = task("tiebreak?");
    let r = entry(&t, &[], Outcome::Remembered, 0);
    let early = entry(&t, &[&r], Outcome::Forgotten, 100);
    let late = entry(&t, &[&r], Outcome::Remembered, 200);

    let merged = merge([&late, &early, &r], AlgorithmName::Default).expect("merge");

    let mut state = None;
    for e in [&r, &early, &late] {
        let next = reviewlog::schedule::schedule(
            state.as_ref(),
            reviewlog::schedule::Review {
                outcome: e.outcome,
                timestamp_millis: e.timestamp_millis,
            },
            AlgorithmName::Default,
        )
        .expect("schedule");
        state = Some(next);
    }
    assert_eq!(Some(merged.schedule), state);
}

#[test]
fn off_frontier_log_is_not_applicable() {
    let t = task("stale?");
    let r = entry(&t, &[], Outcome::Remembered, 0);
    let a = entry(&t, &[&r], Outcome::Remembered, 10);
    let b = entry(&t, &[&r], Outcome::Remembered, 20);

    let after_a = merge([&r, &a], AlgorithmName::Default).expect("merge");
    let outcome = apply(Some(&after_a), &b, AlgorithmName::Default).expect("apply");
    assert_eq!(
        outcome,
        ApplyOutcome::NotApplicable {
            expected_heads: ids(&[&a]),
            parent_ids: ids(&[&r]),
        }
    );

    let outcome = apply(None, &a, AlgorithmName::Default).expect("apply to empty");
    assert!(matches!(outcome, ApplyOutcome::NotApplicable { .. }));
}

#[test]
fn independent_roots_form_a_fork() {
    let t = task("roots?");
    let phone = entry(&t, &[], Outcome::Remembered, 100);
    let laptop = entry(&t, &[], Outcome::Skipped, 50);

    let merged = merge([&phone, &laptop], AlgorithmName::Default).expect("merge");
    assert_eq!(merged.head_log_ids, ids(&[&phone, &laptop]));
    assert_eq!(merged.schedule.review_count, 1);
}

#[test]
fn missing_parent_or_empty_set_is_incomplete_history() {
    let t = task("gap?");
    let r = entry(&t, &[], Outcome::Remembered, 0);
    let a = entry(&t, &[&r], Outcome::Remembered, 1);
    let b = entry(&t, &[&a], Outcome::Remembered, 2);

    assert!(matches!(
        merge([&r, &b], AlgorithmName::Default),
        Err(EngineError::IncompleteHistory(_))
    ));
    assert!(matches!(
        merge(std::iter::empty::<&ActionLogEntry>(), AlgorithmName::Default),
        Err(EngineError::IncompleteHistory(_))
    ));
    assert!(matches!(
        LogGraph::build([&a, &b]),
        Err(EngineError::IncompleteHistory(_))
    ));
}

#[test]
fn mixed_tasks_and_bad_parameters_are_rejected() {
    let t1 = task("one?");
    let t2 = task("two?");
    let r1 = entry(&t1, &[], Outcome::Remembered, 0);
    let r2 = entry(&t2, &[], Outcome::Remembered, 0);

    assert!(matches!(
        merge([&r1, &r2], AlgorithmName::Default),
        Err(EngineError::InvalidContent(_))
    ));

    let state = merge([&r1], AlgorithmName::Default).expect("merge");
    let foreign = entry(&t2, &[&r1], Outcome::Remembered, 5);
    assert!(matches!(
        apply(Some(&state), &foreign, AlgorithmName::Default),
        Err(EngineError::InvalidContent(_))
    ));

    let with_params = ActionLogDraft {
        task_id: t1.clone(),
        parent_ids: BTreeSet::new(),
        outcome: Outcome::Remembered,
        task_parameters: Some(json!({ "clozeIndex": 0 })),
        context: None,
        timestamp_millis: 9,
    }
    .into_entry()
    .expect("entry");
    assert!(matches!(
        apply(None, &with_params, AlgorithmName::Default),
        Err(EngineError::InvalidOutcomeForTaskType(_))
    ));
    assert!(matches!(
        merge([&with_params], AlgorithmName::Default),
        Err(EngineError::InvalidOutcomeForTaskType(_))
    ));
}

#[test]
fn duplicates_collapse_to_one_node() {
    let t = task("dupe?");
    let r = entry(&t, &[], Outcome::Remembered, 0);
    let a = entry(&t, &[&r], Outcome::Remembered, 10);

    let graph = LogGraph::build([&r, &a, &a, &r]).expect("graph");
    assert_eq!(graph.len(), 2);
    assert_eq!(
        merge([&r, &a, &a], AlgorithmName::Default).expect("dupes"),
        merge([&r, &a], AlgorithmName::Default).expect("unique")
    );
}

#[derive(Debug, Clone)]
struct NodeSpec {
    outcome: u8,
    ts: u16,
    parent_mask: u8,
}

fn node_strategy() -> impl Strategy<Value = NodeSpec> {
    (0u8..3, 0u16..500, any::<u8>()).prop_map(|(outcome, ts, parent_mask)| NodeSpec {
        outcome,
        ts,
        parent_mask,
    })
}

fn build_dag(t: &PromptTaskId, specs: &[NodeSpec]) -> Vec<ActionLogEntry> {
    let mut out: Vec<ActionLogEntry> = Vec::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        let window = i.min(8);
        let parents: Vec<&ActionLogEntry> = (0..window)
            .filter(|bit| (spec.parent_mask & (1u8 << *bit)) != 0)
            .map(|bit| &out[i - 1 - bit])
            .collect();
        let outcome = match spec.outcome {
            0 => Outcome::Remembered,
            1 => Outcome::Forgotten,
            _ => Outcome::Skipped,
        };
        let e = entry(t, &parents, outcome, u64::from(spec.ts));
        out.push(e);
    }
    out
}

proptest! {
    #[test]
    fn merge_is_independent_of_delivery_order(
        specs in prop::collection::vec(node_strategy(), 1..24),
        keys in prop::collection::vec(any::<u32>(), 24),
    ) {
        let t = task("permutation?");
        let dag = build_dag(&t, &specs);

        let baseline = merge(dag.iter(), AlgorithmName::Default).expect("baseline");

        let mut shuffled: Vec<(u32, &ActionLogEntry)> =
            dag.iter().enumerate().map(|(i, e)| (keys[i], e)).collect();
        shuffled.sort_by_key(|(k, e)| (*k, e.id.clone()));
        let permuted = merge(shuffled.into_iter().map(|(_, e)| e), AlgorithmName::Default)
            .expect("permuted");
        prop_assert_eq!(&baseline, &permuted);

        let reversed = merge(dag.iter().rev(), AlgorithmName::Default).expect("reversed");
        prop_assert_eq!(&baseline, &reversed);

        let has_child: BTreeSet<&LogId> = dag.iter().flat_map(|e| e.parent_ids.iter()).collect();
        let expected_heads: BTreeSet<LogId> = dag
            .iter()
            .filter(|e| !has_child.contains(&e.id))
            .map(|e| e.id.clone())
            .collect();
        prop_assert_eq!(&baseline.head_log_ids, &expected_heads);
    }

    #[test]
    fn extending_the_frontier_matches_full_merge(
        specs in prop::collection::vec(node_strategy(), 1..16),
        outcome in 0u8..3,
        ts in 0u64..1_000,
    ) {
        let t = task("extend?");
        let dag = build_dag(&t, &specs);
        let state = merge(dag.iter(), AlgorithmName::AggressiveStart).expect("merge");

        let heads: Vec<&ActionLogEntry> = dag
            .iter()
            .filter(|e| state.head_log_ids.contains(&e.id))
            .collect();
        let outcome = match outcome {
            0 => Outcome::Remembered,
            1 => Outcome::Forgotten,
            _ => Outcome::Skipped,
        };
        let next = entry(&t, &heads, outcome, ts);

        let fast = match apply(Some(&state), &next, AlgorithmName::AggressiveStart).expect("apply") {
            ApplyOutcome::Applied(s) => s,
            ApplyOutcome::NotApplicable { .. } => panic!("frontier child must apply"),
        };
        let full = merge(dag.iter().chain([&next]), AlgorithmName::AggressiveStart).expect("full");
        prop_assert_eq!(fast, full);
    }
}
