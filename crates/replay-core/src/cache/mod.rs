//! Sort-key indexed state cache
//!
//! Checkpoints are keyed by `(contract id, sort key)`. Writes are idempotent
//! upserts: the same key always maps to the same deterministic result, so
//! racing evaluators may both write without coordination.

mod file;
mod memory;

pub use file::FileStateCache;
pub use memory::MemoryStateCache;

use serde::{Deserialize, Serialize};

use crate::{EvaluationResult, Result, SortKey};

/// Cache address of a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub contract_id: String,
    pub sort_key: SortKey,
}

impl CacheKey {
    pub fn new(contract_id: impl Into<String>, sort_key: SortKey) -> Self {
        Self {
            contract_id: contract_id.into(),
            sort_key,
        }
    }
}

/// A checkpoint and the position it was taken at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub sort_key: SortKey,
    pub value: EvaluationResult,
}

/// Entry counts reported by `prune`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub entries_before: usize,
    pub entries_after: usize,
}

/// Storage backend for evaluation checkpoints
pub trait StateCache: Send + Sync {
    /// Exact-key lookup.
    fn get(&self, contract_id: &str, sort_key: &SortKey) -> Result<Option<CacheEntry>>;

    /// Greatest entry whose key is `<= sort_key`.
    fn get_less_or_equal(&self, contract_id: &str, sort_key: &SortKey)
        -> Result<Option<CacheEntry>>;

    /// Greatest entry for the contract.
    fn get_last(&self, contract_id: &str) -> Result<Option<CacheEntry>>;

    /// Idempotent upsert.
    fn put(&self, key: CacheKey, value: EvaluationResult) -> Result<()>;

    fn contains(&self, contract_id: &str, sort_key: &SortKey) -> Result<bool> {
        Ok(self.get(contract_id, sort_key)?.is_some())
    }

    /// Greatest key across all contracts.
    fn last_sort_key(&self) -> Result<Option<SortKey>>;

    fn all_contracts(&self) -> Result<Vec<String>>;

    /// Keep only the newest `entries_to_keep` checkpoints per contract.
    fn prune(&self, entries_to_keep: usize) -> Result<PruneStats>;
}
