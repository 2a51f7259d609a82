use std::collections::BTreeSet;

use tempfile::TempDir;

use reviewlog::{
    core::{
        query::TaskQuery,
        store::{LogStore, ReviewRequest},
    },
    engine::cache::{apply_log_to_cache, merge_stored, EntryAccessor, UpdatePath},
    log::{ActionLogDraft, ActionLogEntry, StoredActionLog},
    persist::{sqlite::SqliteLogStore, LogSink, PersistError},
    prompt::{Prompt, PromptTaskId, QaPair},
    schedule::{curves::DAY_MS, AlgorithmName},
    types::{Outcome, ServerTimestamp},
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

fn review(task_id: &PromptTaskId, outcome: Outcome, ts: u64) -> ReviewRequest {
    ReviewRequest {
        task_id: task_id.clone(),
        outcome,
        task_parameters: None,
        context: None,
        timestamp_millis: ts,
    }
}

#[test]
fn sqlite_replay_round_trips_logs_and_order() {
    let tmp = TempDir::new().expect("tmp");
    let db_path = tmp.path().join("reviews.db");

    let t1 = task("one?");
    let t2 = task("two?");
    let mut store = LogStore::new();
    store.record_review(review(&t1, Outcome::Remembered, 1)).expect("r1");
    store.record_review(review(&t2, Outcome::Forgotten, 2)).expect("r2");
    store.record_review(review(&t1, Outcome::Remembered, 3)).expect("r3");

    let sink = SqliteLogStore::open(&db_path).expect("open sqlite");
    let logs = store.export_snapshot().logs;
    assert_eq!(logs.len(), 3);
    assert_eq!(sink.append_logs(&logs).expect("append"), 3);
    drop(sink);

    let reopened = SqliteLogStore::open(&db_path).expect("reopen");
    let replayed = reopened.load_store().expect("replay");

    assert_eq!(store.ordered_ids(), replayed.ordered_ids());
    assert_eq!(store.heads(&t1), replayed.heads(&t1));
    assert_eq!(store.heads(&t2), replayed.heads(&t2));

    // Storage stamps a server time on first write.
    assert!(reopened
        .load_all_logs()
        .expect("logs")
        .iter()
        .all(|s| s.server_timestamp.is_some()));
}

#[test]
fn duplicate_appends_are_ignored_and_keep_first_timestamp() {
    let sink = SqliteLogStore::open_in_memory().expect("open");
    let t = task("dupe?");
    let r = entry(&t, &[], Outcome::Remembered, 0);
    let first = StoredActionLog::synced(r.clone(), ServerTimestamp { seconds: 10, nanoseconds: 0 });
    let second = StoredActionLog::synced(r.clone(), ServerTimestamp { seconds: 99, nanoseconds: 0 });

    assert_eq!(sink.append_logs(&[first.clone()]).expect("first"), 1);
    assert_eq!(sink.append_logs(&[second]).expect("second"), 0);
    assert_eq!(sink.log_count().expect("count"), 1);
    assert_eq!(sink.load_logs_for_task(&t).expect("load"), vec![first]);
}

#[test]
fn cache_writes_are_compare_and_swap() {
    let mut sink = SqliteLogStore::open_in_memory().expect("open");
    let t = task("cas?");
    let r = entry(&t, &[], Outcome::Remembered, 0);
    let a = entry(&t, &[&r], Outcome::Remembered, 10);
    let b = entry(&t, &[&r], Outcome::Skipped, 20);
    let at = |s: i64| ServerTimestamp { seconds: s, nanoseconds: 0 };

    let base = merge_stored(&[StoredActionLog::synced(r.clone(), at(1))], AlgorithmName::Default)
        .expect("base");
    sink.write_cache(&base, None).expect("first write");
    assert_eq!(sink.load_cache(&t).expect("load"), Some(base.clone()));

    let after_a = merge_stored(
        &[StoredActionLog::synced(r.clone(), at(1)), StoredActionLog::synced(a.clone(), at(2))],
        AlgorithmName::Default,
    )
    .expect("a");
    let after_b = merge_stored(
        &[StoredActionLog::synced(r.clone(), at(1)), StoredActionLog::synced(b.clone(), at(3))],
        AlgorithmName::Default,
    )
    .expect("b");

    sink.write_cache(&after_a, Some(base.head_log_ids())).expect("a wins");
    let err = sink
        .write_cache(&after_b, Some(base.head_log_ids()))
        .expect_err("b loses");
    assert!(matches!(err, PersistError::Conflict(_)));
    assert_eq!(sink.load_cache(&t).expect("load"), Some(after_a));
}

#[tokio::test]
async fn sqlite_accessor_drives_the_slow_path() {
    let sink = SqliteLogStore::open_in_memory().expect("open");
    let t = task("slow?");
    let r = entry(&t, &[], Outcome::Remembered, 0);
    let phone = entry(&t, &[&r], Outcome::Remembered, 100);
    let laptop = entry(&t, &[&r], Outcome::Forgotten, 200);

    sink.append_logs(&[StoredActionLog::unsynced(r.clone()), StoredActionLog::unsynced(phone.clone())])
        .expect("append");
    let fetched = sink.fetch_all_entries(&t).await.expect("fetch");
    assert_eq!(fetched.len(), 2);

    let base = merge_stored(&fetched, AlgorithmName::Default).expect("base");
    let update = apply_log_to_cache(
        &StoredActionLog::unsynced(laptop.clone()),
        Some(&base),
        &sink,
        AlgorithmName::Default,
    )
    .await
    .expect("update");

    assert_eq!(update.path, UpdatePath::Remerged);
    let heads: BTreeSet<_> = [phone.id.clone(), laptop.id.clone()].into_iter().collect();
    assert_eq!(update.cache.state.head_log_ids, heads);
}

#[test]
fn rebuild_and_query_caches() {
    let sink = SqliteLogStore::open_in_memory().expect("open");

    let mut logs = Vec::new();
    let mut tasks = Vec::new();
    for i in 0..5u64 {
        let t = task(&format!("task {i}?"));
        let r = entry(&t, &[], Outcome::Remembered, i * DAY_MS);
        logs.push(StoredActionLog::unsynced(r));
        tasks.push(t);
    }
    // A log whose parent never arrived; its task cannot be rebuilt.
    let orphan_task = task("orphan?");
    let missing = entry(&orphan_task, &[], Outcome::Remembered, 0);
    logs.push(StoredActionLog::unsynced(entry(
        &orphan_task,
        &[&missing],
        Outcome::Remembered,
        1,
    )));
    sink.append_logs(&logs).expect("append");

    assert_eq!(sink.rebuild_caches(AlgorithmName::AggressiveStart).expect("rebuild"), 5);
    assert!(sink.load_cache(&orphan_task).expect("orphan").is_none());

    let due = sink.query_tasks(&TaskQuery::due_by(2 * DAY_MS)).expect("query");
    assert_eq!(due.len(), 2);
    assert!(due.iter().all(|c| c.state.due_timestamp_millis() <= 2 * DAY_MS));

    let page = sink.query_tasks(&TaskQuery::default().with_limit(3)).expect("page");
    assert_eq!(page.len(), 3);
    assert!(page.windows(2).all(|w| w[0].task_id() < w[1].task_id()));
    let rest = sink
        .query_tasks(&TaskQuery::default().after(page[2].task_id().clone()))
        .expect("rest");
    assert_eq!(rest.len(), 2);

    let table = sink.load_cache_table().expect("table");
    assert_eq!(table.len(), 5);
    for t in &tasks {
        assert!(table.get(t).is_some());
    }
}

#[test]
fn store_snapshot_restores_frontiers() {
    let t = task("snapshot?");
    let mut store = LogStore::new();
    store.record_review(review(&t, Outcome::Remembered, 1)).expect("r1");
    store.record_review(review(&t, Outcome::Skipped, 2)).expect("r2");

    let json = serde_json::to_string(&store.export_snapshot()).expect("encode");
    let restored = LogStore::from_snapshot(serde_json::from_str(&json).expect("decode")).expect("restore");

    assert_eq!(restored.ordered_ids(), store.ordered_ids());
    assert_eq!(restored.heads(&t), store.heads(&t));
    assert_eq!(restored.len(), 2);
}
