//! SQLite-backed log and cache store.

use std::{
    collections::BTreeSet,
    path::Path,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    core::{cache::{CacheConflict, StateCacheTable}, query::TaskQuery, store::LogStore},
    engine::cache::{merge_stored, EntryAccessor},
    error::{EngineError, EngineResult},
    log::{StoredActionLog, StoredLogEnvelope, LOG_FORMAT_VERSION},
    prompt::PromptTaskId,
    schedule::AlgorithmName,
    state::SchedulingStateCache,
    types::{LogId, ServerTimestamp},
};

use super::{LogSink, PersistError, PersistResult};

const CACHE_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEnvelope {
    format_version: u16,
    cache: SchedulingStateCache,
}

/// SQLite implementation of [`crate::persist::LogSink`] and
/// [`crate::engine::cache::EntryAccessor`].
///
/// Logs are deduplicated by id. The server timestamp of a log is assigned
/// here, at first write, when the caller did not supply one.
pub struct SqliteLogStore {
    conn: Mutex<Connection>,
}

impl SqliteLogStore {
    /// Opens or creates a SQLite-backed store at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite store.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> PersistResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PersistError::Message("sqlite connection lock poisoned".to_string()))
    }

    /// Stores logs, ignoring ids already present. Returns how many were new.
    pub fn append_logs(&self, logs: &[StoredActionLog]) -> PersistResult<usize> {
        if logs.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO action_logs(id, task_key, ts_ms, server_seconds, server_nanos, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for stored in logs {
                let server_ts = stored.server_timestamp.unwrap_or_else(ServerTimestamp::now);
                let stamped = StoredActionLog::synced(stored.entry.clone(), server_ts);
                let payload = serde_json::to_vec(&StoredLogEnvelope::new(stamped))?;
                inserted += stmt.execute(params![
                    stored.entry.id.as_str(),
                    stored.entry.task_id.to_string(),
                    to_sql_int(stored.entry.timestamp_millis),
                    server_ts.seconds,
                    server_ts.nanoseconds,
                    payload,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Loads every log for `task_id` in write order.
    pub fn load_logs_for_task(&self, task_id: &PromptTaskId) -> PersistResult<Vec<StoredActionLog>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT payload FROM action_logs WHERE task_key = ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![task_id.to_string()], decode_log_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Loads every log in write order.
    pub fn load_all_logs(&self) -> PersistResult<Vec<StoredActionLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT payload FROM action_logs ORDER BY seq ASC")?;
        let rows = stmt.query_map([], decode_log_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Rebuilds an in-memory [`LogStore`] from every stored log.
    pub fn load_store(&self) -> PersistResult<LogStore> {
        let mut store = LogStore::new();
        for stored in self.load_all_logs()? {
            store.insert(stored)?;
        }
        Ok(store)
    }

    /// Number of stored logs.
    pub fn log_count(&self) -> PersistResult<u64> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM action_logs", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Loads the cache document for `task_id`.
    pub fn load_cache(&self, task_id: &PromptTaskId) -> PersistResult<Option<SchedulingStateCache>> {
        let payload: Option<Vec<u8>> = self
            .conn()?
            .query_row(
                "SELECT payload FROM state_cache WHERE task_key = ?1",
                params![task_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        payload.map(|p| decode_cache_payload(&p)).transpose()
    }

    /// Loads every cache document into a table.
    pub fn load_cache_table(&self) -> PersistResult<StateCacheTable> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT payload FROM state_cache")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut caches = Vec::new();
        for row in rows {
            caches.push(decode_cache_payload(&row?)?);
        }
        Ok(caches.into_iter().collect())
    }

    /// Writes `cache` iff the stored frontier equals `expected_heads`.
    pub fn compare_and_swap_cache(
        &self,
        cache: &SchedulingStateCache,
        expected_heads: Option<&BTreeSet<LogId>>,
    ) -> PersistResult<()> {
        let key = cache.task_id().to_string();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let found: Option<String> = tx
            .query_row(
                "SELECT heads FROM state_cache WHERE task_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        let found: Option<BTreeSet<LogId>> = found.map(|h| serde_json::from_str(&h)).transpose()?;
        if found.as_ref() != expected_heads {
            return Err(CacheConflict {
                task_id: cache.task_id().clone(),
                expected: expected_heads.cloned(),
                found,
            }
            .into());
        }

        upsert_cache(&tx, &key, cache)?;
        tx.commit()?;
        Ok(())
    }

    /// Cache documents passing `query`, ordered by task id.
    pub fn query_tasks(&self, query: &TaskQuery) -> PersistResult<Vec<SchedulingStateCache>> {
        let mut sql = String::from("SELECT payload FROM state_cache WHERE 1 = 1");
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(pred) = query.predicate {
            sql.push_str(&format!(" AND due_ms {} ?", pred.relation.as_sql()));
            args.push(to_sql_int(pred.value).into());
        }
        if let Some(after) = &query.after_id {
            sql.push_str(" AND task_key > ?");
            args.push(after.to_string().into());
        }
        sql.push_str(" ORDER BY task_key ASC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push((limit as i64).into());
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, Vec<u8>>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode_cache_payload(&row?)?);
        }
        Ok(out)
    }

    /// Recomputes every task's cache from its stored logs, overwriting what is
    /// there. Tasks whose history does not merge are skipped and logged.
    pub fn rebuild_caches(&self, algorithm: AlgorithmName) -> PersistResult<usize> {
        let store = self.load_store()?;
        let mut rebuilt = 0;
        for task_id in store.task_ids() {
            let logs = store.entries_for_task_cloned(task_id);
            match merge_stored(&logs, algorithm) {
                Ok(cache) => {
                    self.overwrite_cache(&cache)?;
                    rebuilt += 1;
                }
                Err(err) => {
                    warn!(task_id = %task_id, error = %err, "skipping cache rebuild");
                }
            }
        }
        Ok(rebuilt)
    }

    /// Recomputes one task's cache from its stored logs and overwrites the
    /// stored document.
    pub fn rebuild_task_cache(
        &self,
        task_id: &PromptTaskId,
        algorithm: AlgorithmName,
    ) -> PersistResult<SchedulingStateCache> {
        let logs = self.load_logs_for_task(task_id)?;
        let cache = merge_stored(&logs, algorithm)?;
        self.overwrite_cache(&cache)?;
        Ok(cache)
    }

    fn overwrite_cache(&self, cache: &SchedulingStateCache) -> PersistResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        upsert_cache(&tx, &cache.task_id().to_string(), cache)?;
        tx.commit()?;
        Ok(())
    }
}

impl LogSink for SqliteLogStore {
    fn append_logs(&mut self, logs: &[StoredActionLog]) -> PersistResult<usize> {
        SqliteLogStore::append_logs(self, logs)
    }

    fn write_cache(
        &mut self,
        cache: &SchedulingStateCache,
        expected_heads: Option<&BTreeSet<LogId>>,
    ) -> PersistResult<()> {
        self.compare_and_swap_cache(cache, expected_heads)
    }

    fn refresh_cache(&mut self, task_id: &PromptTaskId, algorithm: AlgorithmName) -> PersistResult<()> {
        self.rebuild_task_cache(task_id, algorithm).map(|_| ())
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn()?.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }
}

#[async_trait]
impl EntryAccessor for SqliteLogStore {
    async fn fetch_all_entries(&self, task_id: &PromptTaskId) -> EngineResult<Vec<StoredActionLog>> {
        self.load_logs_for_task(task_id)
            .map_err(|e| EngineError::Fetch(e.to_string()))
    }
}

fn upsert_cache(
    tx: &rusqlite::Transaction<'_>,
    key: &str,
    cache: &SchedulingStateCache,
) -> PersistResult<()> {
    let heads = serde_json::to_string(cache.head_log_ids())?;
    let payload = serde_json::to_vec(&CacheEnvelope {
        format_version: CACHE_FORMAT_VERSION,
        cache: cache.clone(),
    })?;
    tx.execute(
        "INSERT INTO state_cache(task_key, heads, due_ms, server_seconds, server_nanos, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(task_key) DO UPDATE SET
             heads = excluded.heads,
             due_ms = excluded.due_ms,
             server_seconds = excluded.server_seconds,
             server_nanos = excluded.server_nanos,
             payload = excluded.payload",
        params![
            key,
            heads,
            to_sql_int(cache.state.due_timestamp_millis()),
            cache.latest_log_server_timestamp.seconds,
            cache.latest_log_server_timestamp.nanoseconds,
            payload,
        ],
    )?;
    Ok(())
}

fn decode_log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredActionLog> {
    let payload: Vec<u8> = row.get(0)?;
    decode_log_payload(&payload).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            payload.len(),
            rusqlite::types::Type::Blob,
            Box::new(std::io::Error::other(err)),
        )
    })
}

fn decode_log_payload(payload: &[u8]) -> Result<StoredActionLog, String> {
    if let Ok(envelope) = serde_json::from_slice::<StoredLogEnvelope>(payload) {
        if envelope.format_version != LOG_FORMAT_VERSION {
            return Err(format!(
                "unsupported log format version: {}",
                envelope.format_version
            ));
        }
        return Ok(envelope.stored);
    }

    // Payloads written by plain document sync carry no envelope.
    serde_json::from_slice::<StoredActionLog>(payload)
        .map_err(|e| format!("log payload decode failed: {e}"))
}

fn decode_cache_payload(payload: &[u8]) -> PersistResult<SchedulingStateCache> {
    let env: CacheEnvelope = serde_json::from_slice(payload)?;
    if env.format_version != CACHE_FORMAT_VERSION {
        return Err(PersistError::Message(
            "unsupported cache format".to_string(),
        ));
    }
    Ok(env.cache)
}

fn to_sql_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}
