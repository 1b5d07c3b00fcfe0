//! Filesystem checkpoint store
//!
//! Layout: one directory per contract under the cache root, one
//! `<sort key>.json` record per checkpoint. Each record carries a sha256
//! digest of its canonical JSON body; a record whose digest does not match
//! is never trusted and reads as a miss.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fs, io};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{CacheEntry, CacheKey, PruneStats, StateCache};
use crate::{Error, EvaluationResult, Result, SortKey};

/// Marks directory names that hold hex-encoded contract ids.
const HEX_DIR_PREFIX: char = '~';

#[derive(Serialize, Deserialize)]
struct Record {
    digest: String,
    result: serde_json::Value,
}

/// Persistent cache rooted at a directory. Survives process restarts.
#[derive(Debug)]
pub struct FileStateCache {
    root: PathBuf,
    index: RwLock<BTreeMap<String, BTreeSet<SortKey>>>,
    tmp_counter: AtomicU64,
}

impl FileStateCache {
    const RECORD_EXT: &'static str = "json";

    /// Open (creating if needed) a cache rooted at `root` and index what is
    /// already on disk.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let mut index = BTreeMap::new();
        for dir in fs::read_dir(&root)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            let Some(contract_id) = dir.file_name().to_str().and_then(decode_dir_name) else {
                tracing::warn!(path = %dir.path().display(), "skipping unrecognized cache directory");
                continue;
            };
            let keys = Self::scan_contract_dir(&dir.path())?;
            if !keys.is_empty() {
                index.insert(contract_id, keys);
            }
        }
        tracing::debug!(root = %root.display(), contracts = index.len(), "opened file state cache");
        Ok(Self {
            root,
            index: RwLock::new(index),
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scan_contract_dir(dir: &Path) -> Result<BTreeSet<SortKey>> {
        let mut keys = BTreeSet::new();
        for file in fs::read_dir(dir)? {
            let path = file?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(Self::RECORD_EXT) {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).map(SortKey::parse) {
                Some(Ok(key)) => {
                    keys.insert(key);
                }
                _ => tracing::warn!(path = %path.display(), "skipping unrecognized cache record"),
            }
        }
        Ok(keys)
    }

    fn contract_dir(&self, contract_id: &str) -> PathBuf {
        self.root.join(encode_dir_name(contract_id))
    }

    fn record_path(&self, contract_id: &str, sort_key: &SortKey) -> PathBuf {
        self.contract_dir(contract_id)
            .join(format!("{}.{}", sort_key, Self::RECORD_EXT))
    }

    /// Read and verify one record. Corrupt or tampered records are misses.
    fn read_record(&self, contract_id: &str, sort_key: &SortKey) -> Result<Option<CacheEntry>> {
        let path = self.record_path(contract_id, sort_key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match decode_record(&bytes) {
            Ok(value) => Ok(Some(CacheEntry {
                sort_key: sort_key.clone(),
                value,
            })),
            Err(e) => {
                tracing::warn!(
                    contract = contract_id,
                    sort_key = %sort_key,
                    error = %e,
                    "discarding untrusted cache record"
                );
                Ok(None)
            }
        }
    }

    fn candidates(&self, contract_id: &str, upper: Option<&SortKey>) -> Vec<SortKey> {
        let index = self.index.read();
        let Some(keys) = index.get(contract_id) else {
            return Vec::new();
        };
        match upper {
            Some(upper) => keys
                .range((Bound::Unbounded, Bound::Included(upper)))
                .rev()
                .cloned()
                .collect(),
            None => keys.iter().rev().cloned().collect(),
        }
    }

    fn newest_valid(&self, contract_id: &str, upper: Option<&SortKey>) -> Result<Option<CacheEntry>> {
        for key in self.candidates(contract_id, upper) {
            if let Some(entry) = self.read_record(contract_id, &key)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

impl StateCache for FileStateCache {
    fn get(&self, contract_id: &str, sort_key: &SortKey) -> Result<Option<CacheEntry>> {
        self.read_record(contract_id, sort_key)
    }

    fn get_less_or_equal(
        &self,
        contract_id: &str,
        sort_key: &SortKey,
    ) -> Result<Option<CacheEntry>> {
        self.newest_valid(contract_id, Some(sort_key))
    }

    fn get_last(&self, contract_id: &str) -> Result<Option<CacheEntry>> {
        self.newest_valid(contract_id, None)
    }

    fn put(&self, key: CacheKey, value: EvaluationResult) -> Result<()> {
        let dir = self.contract_dir(&key.contract_id);
        fs::create_dir_all(&dir)?;
        let body = encode_record(&value)?;

        // Write-then-rename keeps readers from ever seeing a partial record.
        let tmp = dir.join(format!(
            ".{}.{}.{}.tmp",
            key.sort_key,
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, body)?;
        fs::rename(&tmp, self.record_path(&key.contract_id, &key.sort_key))?;

        self.index
            .write()
            .entry(key.contract_id)
            .or_default()
            .insert(key.sort_key);
        Ok(())
    }

    fn last_sort_key(&self) -> Result<Option<SortKey>> {
        let index = self.index.read();
        Ok(index
            .values()
            .filter_map(|keys| keys.iter().next_back())
            .max()
            .cloned())
    }

    fn all_contracts(&self) -> Result<Vec<String>> {
        Ok(self.index.read().keys().cloned().collect())
    }

    fn prune(&self, entries_to_keep: usize) -> Result<PruneStats> {
        let mut index = self.index.write();
        let mut stats = PruneStats::default();
        for (contract_id, keys) in index.iter_mut() {
            stats.entries_before += keys.len();
            while keys.len() > entries_to_keep {
                let Some(oldest) = keys.pop_first() else { break };
                match fs::remove_file(self.record_path(contract_id, &oldest)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            stats.entries_after += keys.len();
        }
        index.retain(|_, keys| !keys.is_empty());
        tracing::info!(
            before = stats.entries_before,
            after = stats.entries_after,
            "pruned file state cache"
        );
        Ok(stats)
    }
}

// ── Encoding ──────────────────────────────────────────────

fn digest(canonical: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(canonical)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn encode_record(value: &EvaluationResult) -> Result<Vec<u8>> {
    let result = serde_json::to_value(value)?;
    let record = Record {
        digest: digest(&result)?,
        result,
    };
    Ok(serde_json::to_vec(&record)?)
}

fn decode_record(bytes: &[u8]) -> Result<EvaluationResult> {
    let record: Record = serde_json::from_slice(bytes)?;
    let actual = digest(&record.result)?;
    if actual != record.digest {
        return Err(Error::CacheInconsistency(format!(
            "digest mismatch: recorded {}, computed {}",
            record.digest, actual
        )));
    }
    Ok(serde_json::from_value(record.result)?)
}

fn encode_dir_name(contract_id: &str) -> String {
    let plain = !contract_id.is_empty()
        && !contract_id.starts_with('.')
        && contract_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if plain {
        contract_id.to_string()
    } else {
        format!("{}{}", HEX_DIR_PREFIX, hex::encode(contract_id))
    }
}

fn decode_dir_name(name: &str) -> Option<String> {
    match name.strip_prefix(HEX_DIR_PREFIX) {
        Some(encoded) => hex::decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok()),
        None if name.starts_with('.') => None,
        None => Some(name.to_string()),
    }
}
