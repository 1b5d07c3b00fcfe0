//! Definition and interaction loaders
//!
//! Loaders are the engine's only window onto the ledger. The in-memory
//! ledger below backs tests and embedders that already hold the data.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    ContractDefinition, ContractSource, Error, Interaction, InteractionsSorter,
    LexicographicalSorter, Result, SortKey,
};

/// Resolves contract definitions, optionally with a forced source
pub trait DefinitionLoader: Send + Sync {
    /// Load `contract_id`. With `forced_source_id`, the returned definition
    /// carries that source instead of the one attached at deployment.
    fn load(&self, contract_id: &str, forced_source_id: Option<&str>) -> Result<ContractDefinition>;
}

/// Fetches the interactions addressed to a contract
pub trait InteractionLoader: Send + Sync {
    /// Interactions with `from < key <= to`. Bounds are optional and the
    /// result need not be sorted.
    fn load(
        &self,
        contract_id: &str,
        from: Option<&SortKey>,
        to: Option<&SortKey>,
    ) -> Result<Vec<Interaction>>;

    /// Stream the same interactions in sorted, block-aligned chunks.
    fn load_chunked(
        &self,
        contract_id: &str,
        from: Option<&SortKey>,
        to: Option<&SortKey>,
        max_chunk: usize,
        sink: &mut dyn FnMut(Vec<Interaction>) -> Result<()>,
    ) -> Result<()> {
        let sorted = LexicographicalSorter.sort(self.load(contract_id, from, to)?)?;
        for chunk in block_chunks(sorted, max_chunk) {
            sink(chunk)?;
        }
        Ok(())
    }
}

/// Split sorted interactions into chunks of at most `max_len`, never
/// splitting a block. A single block larger than `max_len` stays whole.
pub fn block_chunks(interactions: Vec<Interaction>, max_len: usize) -> Vec<Vec<Interaction>> {
    let mut chunks = Vec::new();
    let mut current: Vec<Interaction> = Vec::new();
    let mut block: Vec<Interaction> = Vec::new();

    let flush_block = |block: &mut Vec<Interaction>,
                       current: &mut Vec<Interaction>,
                       chunks: &mut Vec<Vec<Interaction>>| {
        if !current.is_empty() && current.len() + block.len() > max_len {
            chunks.push(std::mem::take(current));
        }
        current.append(block);
    };

    for tx in interactions {
        if block.last().is_some_and(|last| last.block.height != tx.block.height) {
            flush_block(&mut block, &mut current, &mut chunks);
        }
        block.push(tx);
    }
    flush_block(&mut block, &mut current, &mut chunks);
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// ── In-Memory Ledger ──────────────────────────────────────

#[derive(Debug, Default)]
struct LedgerData {
    contracts: BTreeMap<String, ContractDefinition>,
    sources: BTreeMap<String, ContractSource>,
    interactions: BTreeMap<String, Vec<Interaction>>,
}

/// Ledger snapshot held in memory. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    data: Arc<RwLock<LedgerData>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contract; its current source is also published under its
    /// source id.
    pub fn deploy(&self, definition: ContractDefinition) {
        let mut data = self.data.write();
        data.sources
            .insert(definition.source_id.clone(), definition.source.clone());
        data.contracts
            .insert(definition.contract_id.clone(), definition);
    }

    /// Publish a source that contracts may later evolve to.
    pub fn publish_source(&self, source_id: impl Into<String>, source: ContractSource) {
        self.data.write().sources.insert(source_id.into(), source);
    }

    pub fn push_interaction(&self, contract_id: &str, interaction: Interaction) {
        self.data
            .write()
            .interactions
            .entry(contract_id.to_string())
            .or_default()
            .push(interaction);
    }

    pub fn interaction_count(&self, contract_id: &str) -> usize {
        self.data
            .read()
            .interactions
            .get(contract_id)
            .map_or(0, Vec::len)
    }
}

impl DefinitionLoader for InMemoryLedger {
    fn load(&self, contract_id: &str, forced_source_id: Option<&str>) -> Result<ContractDefinition> {
        let data = self.data.read();
        let mut definition = data
            .contracts
            .get(contract_id)
            .cloned()
            .ok_or_else(|| Error::ContractNotFound(contract_id.to_string()))?;
        if let Some(source_id) = forced_source_id {
            definition.source = data.sources.get(source_id).cloned().ok_or_else(|| {
                Error::ContractNotFound(format!("source {source_id} for contract {contract_id}"))
            })?;
            definition.source_id = source_id.to_string();
        }
        Ok(definition)
    }
}

impl InteractionLoader for InMemoryLedger {
    fn load(
        &self,
        contract_id: &str,
        from: Option<&SortKey>,
        to: Option<&SortKey>,
    ) -> Result<Vec<Interaction>> {
        let data = self.data.read();
        let Some(all) = data.interactions.get(contract_id) else {
            return Ok(Vec::new());
        };
        if from.is_none() && to.is_none() {
            return Ok(all.clone());
        }
        let mut selected = Vec::new();
        for tx in all {
            let key = match &tx.sort_key {
                Some(key) => key.clone(),
                None => SortKey::derive(tx.block.height, &tx.block.hash, &tx.id)?,
            };
            let after_from = from.map_or(true, |f| &key > f);
            let before_to = to.map_or(true, |t| &key <= t);
            if after_from && before_to {
                selected.push(tx.clone());
            }
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockInfo;

    const BLOCK: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    fn tx(n: u32, height: u64) -> Interaction {
        let id = format!("{:A>42}A", n);
        Interaction::new(id, "caller", BlockInfo::new(height, BLOCK, 0), "{}")
    }

    fn heights(chunks: &[Vec<Interaction>]) -> Vec<Vec<u64>> {
        chunks
            .iter()
            .map(|c| c.iter().map(|t| t.block.height).collect())
            .collect()
    }

    #[test]
    fn test_chunks_respect_blocks() {
        let batch = vec![tx(1, 1), tx(2, 1), tx(3, 2), tx(4, 3), tx(5, 3), tx(6, 3)];
        let chunks = block_chunks(batch, 3);
        assert_eq!(heights(&chunks), vec![vec![1, 1, 2], vec![3, 3, 3]]);
    }

    #[test]
    fn test_oversized_block_stays_whole() {
        let batch = vec![tx(1, 1), tx(2, 2), tx(3, 2), tx(4, 2)];
        let chunks = block_chunks(batch, 2);
        assert_eq!(heights(&chunks), vec![vec![1], vec![2, 2, 2]]);
        assert!(block_chunks(Vec::new(), 2).is_empty());
    }

    #[test]
    fn test_forced_source() {
        let ledger = InMemoryLedger::new();
        ledger.deploy(ContractDefinition {
            contract_id: "c".into(),
            source_id: "s1".into(),
            source: ContractSource::native("v1"),
            initial_state: serde_json::json!({}),
            owner: "o".into(),
        });
        ledger.publish_source("s2", ContractSource::native("v2"));

        let def = DefinitionLoader::load(&ledger, "c", Some("s2")).unwrap();
        assert_eq!(def.source_id, "s2");
        assert_eq!(def.source.code, "v2");
        assert!(matches!(
            DefinitionLoader::load(&ledger, "c", Some("missing")),
            Err(Error::ContractNotFound(_))
        ));
        assert!(DefinitionLoader::load(&ledger, "nope", None).is_err());
    }

    #[test]
    fn test_range_filter_and_chunked_load() {
        let ledger = InMemoryLedger::new();
        for (n, h) in [(1, 1), (2, 2), (3, 3), (4, 3)] {
            ledger.push_interaction("c", tx(n, h));
        }
        let upper = SortKey::block_upper_bound(2);
        let loaded = InteractionLoader::load(&ledger, "c", None, Some(&upper)).unwrap();
        assert_eq!(loaded.len(), 2);

        let lower = SortKey::block_upper_bound(1);
        let mut seen = Vec::new();
        ledger
            .load_chunked("c", Some(&lower), None, 1, &mut |chunk| {
                seen.push(chunk.len());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2]);
    }
}
