use std::{collections::BTreeSet, sync::Arc};

use serde::Deserialize;
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    core::{
        cache::{CacheConflict, StateCacheTable},
        query::TaskQuery,
        store::{LogStore, ReviewRequest},
    },
    engine::cache::{apply_log_to_cache, merge_stored, CacheUpdate, UpdatePath},
    error::EngineError,
    log::{ActionLogEntry, StoredActionLog},
    persist::{LogSink, PersistError},
    prompt::PromptTaskId,
    schedule::AlgorithmName,
    state::SchedulingStateCache,
    types::{LogId, ServerTimestamp},
};

use super::events::ReconcileEvent;

/// Failures surfaced through [`ReconcilerHandle`].
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The log could not be folded.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The cache moved under the writer.
    #[error(transparent)]
    Conflict(#[from] CacheConflict),
    /// Persistence failed, or its queue had no room for the command's writes.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The runtime task is gone.
    #[error("runtime channel closed")]
    ChannelClosed,
}

/// Tuning for [`spawn_reconciler`]. Every field has a default, so a partial
/// JSON object is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Schedule algorithm used for every task's history.
    pub algorithm: AlgorithmName,
    /// Persist once this many items are buffered.
    pub batch_max_ops: usize,
    /// Persist buffered items after this long regardless of count.
    pub batch_max_latency_ms: u64,
    /// Bound of the persistence queue. A command that cannot queue its writes
    /// fails without changing any state.
    pub persist_queue_bound: usize,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmName::Default,
            batch_max_ops: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 256,
            event_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Parses a JSON configuration object.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// What happened to an ingested log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The log was already held.
    Duplicate,
    /// The task's cache was updated by the given path.
    Updated(UpdatePath),
}

/// Cloneable handle to the reconcile loop.
#[derive(Clone)]
pub struct ReconcilerHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<ReconcileEvent>,
}

enum Command {
    Record {
        request: ReviewRequest,
        resp: oneshot::Sender<Result<ActionLogEntry, RuntimeError>>,
    },
    Ingest {
        stored: StoredActionLog,
        resp: oneshot::Sender<Result<IngestOutcome, RuntimeError>>,
    },
    State {
        task_id: PromptTaskId,
        resp: oneshot::Sender<Option<SchedulingStateCache>>,
    },
    Heads {
        task_id: PromptTaskId,
        resp: oneshot::Sender<BTreeSet<LogId>>,
    },
    Due {
        query: TaskQuery,
        resp: oneshot::Sender<Vec<SchedulingStateCache>>,
    },
    Flush {
        resp: oneshot::Sender<Result<u64, RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

enum PersistItem {
    Log(StoredActionLog),
    Cache {
        cache: SchedulingStateCache,
        expected: Option<BTreeSet<LogId>>,
    },
}

enum PersistMsg {
    Item(PersistItem),
    Flush {
        resp: oneshot::Sender<Result<u64, PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<u64, PersistError>>,
    },
}

/// Queue room for one log and the cache write that follows it.
struct PersistSlots<'a> {
    log: mpsc::Permit<'a, PersistMsg>,
    cache: mpsc::Permit<'a, PersistMsg>,
}

enum Wake {
    Command(Option<Command>),
    Durable(Option<Result<u64, PersistError>>),
}

struct LoopState {
    store: LogStore,
    caches: StateCacheTable,
    algorithm: AlgorithmName,
    logs_accepted: u64,
}

/// Spawns the single-writer loop owning `store` and `caches`.
///
/// All cache writes for every task go through this one task, so updates for
/// the same task are serialized. When a sink is given, `store` and `caches`
/// must reflect what the sink already holds, since the sink's cache writes are
/// compare-and-swap against the same frontiers.
pub fn spawn_reconciler(
    store: LogStore,
    caches: StateCacheTable,
    sink: Option<Box<dyn LogSink>>,
    config: RuntimeConfig,
) -> ReconcilerHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(256);
    let (events_tx, _) = broadcast::channel::<ReconcileEvent>(config.event_capacity.max(1));

    let (persist_tx_opt, mut durable_rx) = if let Some(sink) = sink {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound.max(1));
        let (durable_tx, durable_rx) = mpsc::unbounded_channel::<Result<u64, PersistError>>();
        spawn_persistence_worker(sink, persist_rx, durable_tx, &config);
        (Some(persist_tx), Some(durable_rx))
    } else {
        (None, None)
    };

    let events_tx_loop = events_tx.clone();

    tokio::spawn(async move {
        let mut state = LoopState {
            store,
            caches,
            algorithm: config.algorithm,
            logs_accepted: 0,
        };

        loop {
            let wake = match durable_rx.as_mut() {
                Some(rx) => tokio::select! {
                    cmd = cmd_rx.recv() => Wake::Command(cmd),
                    durable = rx.recv() => Wake::Durable(durable),
                },
                None => Wake::Command(cmd_rx.recv().await),
            };

            match wake {
                Wake::Command(Some(cmd)) => {
                    let done = handle_command(
                        cmd,
                        &mut state,
                        &events_tx_loop,
                        persist_tx_opt.as_ref(),
                    )
                    .await;
                    if done {
                        break;
                    }
                }
                Wake::Command(None) => break,
                Wake::Durable(Some(Ok(logs))) => {
                    let _ = events_tx_loop.send(ReconcileEvent::DurableUpTo { logs });
                }
                Wake::Durable(Some(Err(err))) => {
                    let _ = events_tx_loop.send(ReconcileEvent::PersistFailed {
                        reason: err.to_string(),
                    });
                }
                Wake::Durable(None) => durable_rx = None,
            }
        }
    });

    ReconcilerHandle { cmd_tx, events_tx }
}

impl ReconcilerHandle {
    /// Subscribes to reconcile events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.events_tx.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Records a local review continuing this replica's frontier for the task.
    pub async fn record_review(&self, request: ReviewRequest) -> Result<ActionLogEntry, RuntimeError> {
        self.request(|resp| Command::Record { request, resp }).await?
    }

    /// Ingests a log synced from another replica.
    pub async fn ingest(&self, stored: StoredActionLog) -> Result<IngestOutcome, RuntimeError> {
        self.request(|resp| Command::Ingest { stored, resp }).await?
    }

    /// Current cached state of a task.
    pub async fn state(&self, task_id: PromptTaskId) -> Result<Option<SchedulingStateCache>, RuntimeError> {
        self.request(|resp| Command::State { task_id, resp }).await
    }

    /// Childless logs held for a task.
    pub async fn heads(&self, task_id: PromptTaskId) -> Result<BTreeSet<LogId>, RuntimeError> {
        self.request(|resp| Command::Heads { task_id, resp }).await
    }

    /// Cached states passing `query`.
    pub async fn due(&self, query: TaskQuery) -> Result<Vec<SchedulingStateCache>, RuntimeError> {
        self.request(|resp| Command::Due { query, resp }).await
    }

    /// Waits until buffered writes reach the sink. Returns logs written so far.
    pub async fn flush(&self) -> Result<u64, RuntimeError> {
        self.request(|resp| Command::Flush { resp }).await?
    }

    /// Flushes and stops the loop. Fails if buffered writes could not be
    /// persisted; those writes are lost.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Shutdown { resp }).await?
    }
}

async fn handle_command(
    cmd: Command,
    state: &mut LoopState,
    events_tx: &broadcast::Sender<ReconcileEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
) -> bool {
    match cmd {
        Command::Record { request, resp } => {
            let _ = resp.send(record(request, state, events_tx, persist_tx).await);
        }
        Command::Ingest { stored, resp } => {
            let _ = resp.send(ingest(stored, state, events_tx, persist_tx).await);
        }
        Command::State { task_id, resp } => {
            let _ = resp.send(state.caches.get(&task_id).cloned());
        }
        Command::Heads { task_id, resp } => {
            let _ = resp.send(state.store.heads(&task_id));
        }
        Command::Due { query, resp } => {
            let _ = resp.send(state.caches.query(&query).into_iter().cloned().collect());
        }
        Command::Flush { resp } => {
            let out = if let Some(tx) = persist_tx {
                let (flush_tx, flush_rx) = oneshot::channel();
                if tx
                    .send(PersistMsg::Flush { resp: flush_tx })
                    .await
                    .is_err()
                {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    flush_rx
                        .await
                        .map_err(|_| RuntimeError::ChannelClosed)
                        .and_then(|r| r.map_err(RuntimeError::from))
                }
            } else {
                Ok(state.logs_accepted)
            };
            let _ = resp.send(out);
        }
        Command::Shutdown { resp } => {
            let out = if let Some(tx) = persist_tx {
                let (done_tx, done_rx) = oneshot::channel();
                let send_res = tx.send(PersistMsg::Shutdown { resp: done_tx }).await;
                if send_res.is_err() {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    match done_rx.await {
                        Ok(Ok(_)) => Ok(()),
                        Ok(Err(err)) => Err(err.into()),
                        Err(_) => Err(RuntimeError::ChannelClosed),
                    }
                }
            } else {
                Ok(())
            };
            let _ = resp.send(out);
            return true;
        }
    }

    false
}

async fn record(
    request: ReviewRequest,
    state: &mut LoopState,
    events_tx: &broadcast::Sender<ReconcileEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
) -> Result<ActionLogEntry, RuntimeError> {
    let slots = reserve_slots(persist_tx)?;
    let entry = state.store.record_review(request)?;
    let stored = state
        .store
        .stamp(&entry.id, ServerTimestamp::now())
        .cloned()
        .unwrap_or_else(|| StoredActionLog::unsynced(entry.clone()));
    reconcile_new(stored, state, events_tx, slots).await?;
    Ok(entry)
}

async fn ingest(
    mut stored: StoredActionLog,
    state: &mut LoopState,
    events_tx: &broadcast::Sender<ReconcileEvent>,
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
) -> Result<IngestOutcome, RuntimeError> {
    let log_id = stored.entry.id.clone();
    if let Err(err) = stored.entry.verify() {
        warn!(log_id = %log_id, error = %err, "rejected malformed log");
        return Err(err.into());
    }
    if stored.server_timestamp.is_none() {
        stored.server_timestamp = Some(ServerTimestamp::now());
    }

    if state.store.contains(&log_id) {
        state.store.insert(stored)?;
        debug!(log_id = %log_id, "duplicate log ignored");
        let _ = events_tx.send(ReconcileEvent::Duplicate { log_id });
        return Ok(IngestOutcome::Duplicate);
    }

    let slots = reserve_slots(persist_tx)?;
    state.store.insert(stored.clone())?;
    reconcile_new(stored, state, events_tx, slots)
        .await
        .map(IngestOutcome::Updated)
}

/// Claims queue room for a command's writes before the store or the cache
/// table change, so a full queue leaves both untouched.
fn reserve_slots(
    persist_tx: Option<&mpsc::Sender<PersistMsg>>,
) -> Result<Option<PersistSlots<'_>>, RuntimeError> {
    let Some(tx) = persist_tx else {
        return Ok(None);
    };
    let log = tx.try_reserve().map_err(queue_error)?;
    let cache = tx.try_reserve().map_err(queue_error)?;
    Ok(Some(PersistSlots { log, cache }))
}

fn queue_error(err: mpsc::error::TrySendError<()>) -> RuntimeError {
    RuntimeError::Persist(PersistError::Message(format!("persist queue error: {err}")))
}

/// Folds a log that was just added to the store into its task's cache.
///
/// The log itself stays stored, and is queued for persistence, even when
/// folding fails, so a parent that arrives later can still pull it into a
/// re-merge.
async fn reconcile_new(
    stored: StoredActionLog,
    state: &mut LoopState,
    events_tx: &broadcast::Sender<ReconcileEvent>,
    slots: Option<PersistSlots<'_>>,
) -> Result<UpdatePath, RuntimeError> {
    state.logs_accepted += 1;
    let cache_slot = slots.map(|slots| {
        slots.log.send(PersistMsg::Item(PersistItem::Log(stored.clone())));
        slots.cache
    });

    let task_id = stored.entry.task_id.clone();
    let log_id = stored.entry.id.clone();
    let base = state.caches.get(&task_id).cloned();

    let update = if state.store.has_child(&log_id) {
        // Children of this log were stored earlier but could not be folded.
        merge_stored(&state.store.entries_for_task_cloned(&task_id), state.algorithm).map(|cache| {
            CacheUpdate {
                cache,
                path: UpdatePath::Remerged,
            }
        })
    } else {
        apply_log_to_cache(&stored, base.as_ref(), &state.store, state.algorithm).await
    };

    let update = match update {
        Ok(update) => update,
        Err(err) => {
            warn!(task_id = %task_id, log_id = %log_id, error = %err, "log stored but not folded");
            let _ = events_tx.send(ReconcileEvent::Rejected {
                task_id,
                log_id,
                reason: err.to_string(),
            });
            return Err(err.into());
        }
    };

    let expected = base.map(|b| b.state.head_log_ids);
    state
        .caches
        .compare_and_swap(expected.as_ref(), update.cache.clone())
        .inspect_err(|err| warn!(error = %err, "cache compare-and-swap lost"))?;

    let heads = update.cache.state.head_log_ids.len();
    let event = match update.path {
        UpdatePath::FastPath => ReconcileEvent::Applied {
            task_id,
            log_id,
        },
        UpdatePath::Remerged => ReconcileEvent::Remerged {
            task_id,
            log_id,
            heads,
        },
    };
    if let Some(slot) = cache_slot {
        slot.send(PersistMsg::Item(PersistItem::Cache {
            cache: update.cache,
            expected,
        }));
    }

    let _ = events_tx.send(event);
    Ok(update.path)
}

fn spawn_persistence_worker(
    sink: Box<dyn LogSink>,
    rx: mpsc::Receiver<PersistMsg>,
    durable_tx: mpsc::UnboundedSender<Result<u64, PersistError>>,
    config: &RuntimeConfig,
) {
    let worker = PersistWorker {
        sink: Arc::new(Mutex::new(sink)),
        pending: Vec::new(),
        logs_written: 0,
        durable_tx,
        algorithm: config.algorithm,
        max_items: config.batch_max_ops.max(1),
        max_latency: Duration::from_millis(config.batch_max_latency_ms),
    };
    tokio::spawn(worker.run(rx));
}

/// Batches log and cache writes and hands them to the sink off the runtime.
///
/// Items a failed batch did not write stay buffered, in order, and are
/// retried with the next batch or when the latency deadline passes.
struct PersistWorker {
    sink: Arc<Mutex<Box<dyn LogSink>>>,
    pending: Vec<PersistItem>,
    logs_written: u64,
    durable_tx: mpsc::UnboundedSender<Result<u64, PersistError>>,
    algorithm: AlgorithmName,
    max_items: usize,
    max_latency: Duration,
}

impl PersistWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<PersistMsg>) {
        let mut deadline = Instant::now() + self.max_latency;
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(PersistMsg::Item(item)) => {
                        self.pending.push(item);
                        if self.pending.len() >= self.max_items {
                            let _ = self.write_pending(true).await;
                            deadline = Instant::now() + self.max_latency;
                        }
                    }
                    Some(PersistMsg::Flush { resp }) => {
                        let result = self.write_pending(true).await;
                        let _ = resp.send(result.map(|_| self.logs_written));
                        deadline = Instant::now() + self.max_latency;
                    }
                    Some(PersistMsg::Shutdown { resp }) => {
                        let result = self.write_pending(true).await;
                        let _ = resp.send(result.map(|_| self.logs_written));
                        break;
                    }
                    None => {
                        let _ = self.write_pending(true).await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if !self.pending.is_empty() => {
                    let _ = self.write_pending(false).await;
                    deadline = Instant::now() + self.max_latency;
                }
            }
        }
    }

    /// Writes everything buffered, in arrival order, then optionally flushes.
    /// Failures are also reported on the durable channel.
    async fn write_pending(&mut self, call_flush: bool) -> Result<(), PersistError> {
        if self.pending.is_empty() && !call_flush {
            return Ok(());
        }

        let items = std::mem::take(&mut self.pending);
        let sink = Arc::clone(&self.sink);
        let algorithm = self.algorithm;
        let batch = tokio::task::spawn_blocking(move || {
            let mut sink = sink.blocking_lock();
            let mut batch = write_items(sink.as_mut(), items, algorithm);
            if call_flush && batch.failure.is_none() {
                batch.failure = sink.flush().err();
            }
            batch
        })
        .await
        .map_err(|e| PersistError::Message(format!("join error: {e}")))?;

        self.pending = batch.retry;
        if batch.logs > 0 {
            self.logs_written += batch.logs;
            let _ = self.durable_tx.send(Ok(self.logs_written));
        }
        match batch.failure {
            None => Ok(()),
            Some(err) => {
                error!(error = %err, retained = self.pending.len(), "persisting reconcile batch failed");
                let _ = self
                    .durable_tx
                    .send(Err(PersistError::Message(format!("write failed: {err}"))));
                Err(err)
            }
        }
    }
}

/// Result of handing one batch to the sink.
struct BatchOutcome {
    /// Logs the sink accepted.
    logs: u64,
    /// Items from the first failed write onward, in order.
    retry: Vec<PersistItem>,
    failure: Option<PersistError>,
}

/// Writes items in order. Each run of consecutive logs goes to the sink in
/// one append, together with the cache write closing the run. The first
/// failing run stops the batch and it and everything after it is returned
/// for retry. Log appends ignore ids already stored, so a retried run is safe.
fn write_items(sink: &mut dyn LogSink, mut items: Vec<PersistItem>, algorithm: AlgorithmName) -> BatchOutcome {
    let mut logs = 0u64;
    let mut start = 0;
    while start < items.len() {
        let end = items[start..]
            .iter()
            .position(|item| matches!(item, PersistItem::Cache { .. }))
            .map_or(items.len(), |at| start + at + 1);
        match write_run(sink, &items[start..end], algorithm) {
            Ok(n) => logs += n,
            Err(err) => {
                return BatchOutcome {
                    logs,
                    retry: items.split_off(start),
                    failure: Some(err),
                };
            }
        }
        start = end;
    }
    BatchOutcome {
        logs,
        retry: Vec::new(),
        failure: None,
    }
}

/// Appends a run's logs, then writes the cache that closes it. When the
/// sink's cache has moved away from the frontier this runtime expects, the
/// sink's document is rebuilt from the sink's own logs instead.
fn write_run(sink: &mut dyn LogSink, run: &[PersistItem], algorithm: AlgorithmName) -> Result<u64, PersistError> {
    let logs: Vec<StoredActionLog> = run
        .iter()
        .filter_map(|item| match item {
            PersistItem::Log(stored) => Some(stored.clone()),
            PersistItem::Cache { .. } => None,
        })
        .collect();
    if !logs.is_empty() {
        sink.append_logs(&logs)?;
    }

    if let Some(PersistItem::Cache { cache, expected }) = run.last() {
        match sink.write_cache(cache, expected.as_ref()) {
            Ok(()) => {}
            Err(PersistError::Conflict(conflict)) => {
                info!(task_id = %cache.task_id(), error = %conflict, "sink cache moved; rebuilding from sink logs");
                match sink.refresh_cache(cache.task_id(), algorithm) {
                    Ok(()) => {}
                    // Retrying cannot make this history merge.
                    Err(PersistError::Engine(err)) => {
                        warn!(task_id = %cache.task_id(), error = %err, "sink history does not merge; cache left as is");
                    }
                    Err(err) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        }
    }
    Ok(logs.len() as u64)
}
