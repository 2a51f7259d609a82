use hashbrown::HashMap;

use crate::types::LogId;

/// Per-key list of log ids in arrival order.
pub type VecIndex<K> = HashMap<K, Vec<LogId>>;
