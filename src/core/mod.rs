//! In-memory log store, state cache table, and query helpers.

/// In-memory state cache with compare-and-swap writes.
pub mod cache;
/// Helper index aliases.
pub mod indices;
/// Due-time query model.
pub mod query;
/// Content-addressed log arena and local authoring.
pub mod store;
