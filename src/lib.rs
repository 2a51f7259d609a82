//! Conflict-free reconciliation of spaced-repetition review logs.
//!
//! Every review is an immutable, content-addressed action log naming the logs
//! it causally follows. Replicas exchange logs in any order; each task's
//! scheduling state is the deterministic fold of its log DAG.
//!
//! # Examples
//!
//! Folding a linear history in memory:
//! ```
//! use std::collections::BTreeSet;
//!
//! use reviewlog::{
//!     engine::{apply::{apply, ApplyOutcome}, merge::merge},
//!     log::ActionLogDraft,
//!     prompt::{Prompt, PromptTaskId, QaPair},
//!     schedule::AlgorithmName,
//!     types::Outcome,
//! };
//!
//! let prompt = Prompt::Basic(QaPair {
//!     question: "Capital of France?".to_string(),
//!     answer: "Paris".to_string(),
//! });
//! let task_id = PromptTaskId::for_prompt(&prompt).expect("task id");
//!
//! let first = ActionLogDraft {
//!     task_id: task_id.clone(),
//!     parent_ids: BTreeSet::new(),
//!     outcome: Outcome::Remembered,
//!     task_parameters: None,
//!     context: None,
//!     timestamp_millis: 1_000,
//! }
//! .into_entry()
//! .expect("first");
//!
//! let ApplyOutcome::Applied(state) =
//!     apply(None, &first, AlgorithmName::Default).expect("apply")
//! else {
//!     panic!("first review continues an empty history");
//! };
//! assert_eq!(state, merge([&first], AlgorithmName::Default).expect("merge"));
//! ```
//!
//! Runtime usage with the SQLite sink:
//! ```no_run
//! use reviewlog::{
//!     core::store::ReviewRequest,
//!     persist::sqlite::SqliteLogStore,
//!     prompt::{Prompt, PromptTaskId, QaPair},
//!     runtime::handle::{spawn_reconciler, RuntimeConfig},
//!     types::Outcome,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let db = SqliteLogStore::open("reviews.db").expect("open sqlite");
//! let store = db.load_store().expect("load logs");
//! let caches = db.load_cache_table().expect("load caches");
//! let handle = spawn_reconciler(store, caches, Some(Box::new(db)), RuntimeConfig::default());
//!
//! let prompt = Prompt::Basic(QaPair {
//!     question: "2 + 2?".to_string(),
//!     answer: "4".to_string(),
//! });
//! let task_id = PromptTaskId::for_prompt(&prompt).expect("task id");
//! handle
//!     .record_review(ReviewRequest {
//!         task_id,
//!         outcome: Outcome::Remembered,
//!         task_parameters: None,
//!         context: None,
//!         timestamp_millis: 1_700_000_000_000,
//!     })
//!     .await
//!     .expect("record");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Log arena, cache table, and query helpers.
pub mod core;
/// Single-log application, full merge, and the cache update protocol.
pub mod engine;
/// Engine error type.
pub mod error;
/// Content digests for logs and prompts.
pub mod id;
/// Action log records and storage wrappers.
pub mod log;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Prompt content and task identity.
pub mod prompt;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Registered schedule algorithms.
pub mod schedule;
/// Scheduling state documents.
pub mod state;
/// Shared primitive types and enums.
pub mod types;
