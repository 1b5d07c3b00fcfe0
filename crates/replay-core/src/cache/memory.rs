//! In-process checkpoint store

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{CacheEntry, CacheKey, PruneStats, StateCache};
use crate::{EvaluationResult, Result, SortKey};

type Checkpoints = BTreeMap<String, BTreeMap<SortKey, EvaluationResult>>;

/// Memory-backed cache. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateCache {
    entries: Arc<RwLock<Checkpoints>>,
}

impl MemoryStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of checkpoints held.
    pub fn len(&self) -> usize {
        self.entries.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys stored for one contract, ascending.
    pub fn keys(&self, contract_id: &str) -> Vec<SortKey> {
        self.entries
            .read()
            .get(contract_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn entry(sort_key: &SortKey, value: &EvaluationResult) -> CacheEntry {
    CacheEntry {
        sort_key: sort_key.clone(),
        value: value.clone(),
    }
}

impl StateCache for MemoryStateCache {
    fn get(&self, contract_id: &str, sort_key: &SortKey) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read();
        Ok(entries
            .get(contract_id)
            .and_then(|m| m.get(sort_key))
            .map(|v| entry(sort_key, v)))
    }

    fn get_less_or_equal(
        &self,
        contract_id: &str,
        sort_key: &SortKey,
    ) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read();
        Ok(entries.get(contract_id).and_then(|m| {
            m.range((Bound::Unbounded, Bound::Included(sort_key)))
                .next_back()
                .map(|(k, v)| entry(k, v))
        }))
    }

    fn get_last(&self, contract_id: &str) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read();
        Ok(entries
            .get(contract_id)
            .and_then(|m| m.last_key_value())
            .map(|(k, v)| entry(k, v)))
    }

    fn put(&self, key: CacheKey, value: EvaluationResult) -> Result<()> {
        self.entries
            .write()
            .entry(key.contract_id)
            .or_default()
            .insert(key.sort_key, value);
        Ok(())
    }

    fn last_sort_key(&self) -> Result<Option<SortKey>> {
        let entries = self.entries.read();
        Ok(entries
            .values()
            .filter_map(|m| m.keys().next_back())
            .max()
            .cloned())
    }

    fn all_contracts(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    fn prune(&self, entries_to_keep: usize) -> Result<PruneStats> {
        let mut entries = self.entries.write();
        let mut stats = PruneStats::default();
        for checkpoints in entries.values_mut() {
            stats.entries_before += checkpoints.len();
            while checkpoints.len() > entries_to_keep {
                checkpoints.pop_first();
            }
            stats.entries_after += checkpoints.len();
        }
        entries.retain(|_, m| !m.is_empty());
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(height: u64) -> SortKey {
        SortKey::block_upper_bound(height)
    }

    fn result(n: i64) -> EvaluationResult {
        EvaluationResult::genesis(json!({ "n": n }))
    }

    #[test]
    fn test_less_or_equal_lookup() {
        let cache = MemoryStateCache::new();
        cache.put(CacheKey::new("c", key(2)), result(2)).unwrap();
        cache.put(CacheKey::new("c", key(5)), result(5)).unwrap();

        assert!(cache.get_less_or_equal("c", &key(1)).unwrap().is_none());
        let hit = cache.get_less_or_equal("c", &key(4)).unwrap().unwrap();
        assert_eq!(hit.sort_key, key(2));
        let hit = cache.get_less_or_equal("c", &key(5)).unwrap().unwrap();
        assert_eq!(hit.value, result(5));
        assert!(cache.get_less_or_equal("other", &key(9)).unwrap().is_none());
    }

    #[test]
    fn test_put_is_idempotent() {
        let cache = MemoryStateCache::new();
        cache.put(CacheKey::new("c", key(1)), result(1)).unwrap();
        cache.put(CacheKey::new("c", key(1)), result(1)).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("c", &key(1)).unwrap());
    }

    #[test]
    fn test_last_and_contracts() {
        let cache = MemoryStateCache::new();
        assert!(cache.last_sort_key().unwrap().is_none());
        cache.put(CacheKey::new("a", key(3)), result(3)).unwrap();
        cache.put(CacheKey::new("b", key(7)), result(7)).unwrap();
        assert_eq!(cache.last_sort_key().unwrap(), Some(key(7)));
        assert_eq!(cache.get_last("a").unwrap().unwrap().sort_key, key(3));
        assert_eq!(cache.all_contracts().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let cache = MemoryStateCache::new();
        for h in 1..=5 {
            cache.put(CacheKey::new("c", key(h)), result(h as i64)).unwrap();
        }
        let stats = cache.prune(2).unwrap();
        assert_eq!(stats, PruneStats { entries_before: 5, entries_after: 2 });
        assert_eq!(cache.keys("c"), vec![key(4), key(5)]);
    }

    #[test]
    fn test_clones_share_storage() {
        let cache = MemoryStateCache::new();
        let other = cache.clone();
        other.put(CacheKey::new("c", key(1)), result(1)).unwrap();
        assert_eq!(cache.len(), 1);
    }
}
