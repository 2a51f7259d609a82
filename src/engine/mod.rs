//! Reconciliation of a task's action logs into one scheduling state.

/// Single-entry fast-path applier.
pub mod apply;
/// Cache maintenance protocol and storage accessor seam.
pub mod cache;
/// Deterministic merge over a task's full log DAG.
pub mod merge;
