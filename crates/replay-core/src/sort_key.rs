//! Sort keys and interaction ordering
//!
//! A sort key is `{height:012},{hex(sha256(block_hash ‖ tx_id))}` where both
//! identifiers are base64url-decoded before hashing. Plain byte-wise string
//! comparison of two keys orders interactions by block height first and by
//! the hash tiebreak within a block, identically on every machine.

use std::fmt;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Interaction, Result};

/// Width of the zero-padded block height prefix.
pub const HEIGHT_WIDTH: usize = 12;

/// Length of the hex-encoded sha256 tiebreak.
const TIEBREAK_LEN: usize = 64;

/// Ledger identifiers are unpadded base64url; trailing bits are tolerated.
const LEDGER_B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

// ── Sort Key ──────────────────────────────────────────────

/// Totally ordered position of an interaction in a contract's history
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortKey(String);

impl SortKey {
    /// Derive the key for an interaction in block `height` with the given
    /// base64url block hash and transaction id.
    pub fn derive(height: u64, block_hash: &str, tx_id: &str) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(decode_ledger_id("block hash", block_hash)?);
        hasher.update(decode_ledger_id("transaction id", tx_id)?);
        let tiebreak = hex::encode(hasher.finalize());
        Ok(SortKey(format!("{},{}", pad_height(height), tiebreak)))
    }

    /// Greatest possible key within block `height`.
    pub fn block_upper_bound(height: u64) -> Self {
        SortKey(format!("{},{}", pad_height(height), "f".repeat(TIEBREAK_LEN)))
    }

    /// Validate a key read back from storage or supplied by a gateway.
    pub fn parse(raw: &str) -> Result<Self> {
        let (height, tiebreak) = raw
            .split_once(',')
            .ok_or_else(|| Error::DataIntegrity(format!("sort key without separator: {raw}")))?;
        let height_ok = height.len() >= HEIGHT_WIDTH && height.bytes().all(|b| b.is_ascii_digit());
        let tiebreak_ok = tiebreak.len() == TIEBREAK_LEN
            && tiebreak.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !height_ok || !tiebreak_ok {
            return Err(Error::DataIntegrity(format!("malformed sort key: {raw}")));
        }
        Ok(SortKey(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Block height encoded in the key prefix.
    pub fn block_height(&self) -> Option<u64> {
        self.0.split_once(',').and_then(|(h, _)| h.parse().ok())
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Always exactly HEIGHT_WIDTH digits, low heights included, so string order
// is height order.
fn pad_height(height: u64) -> String {
    format!("{:0width$}", height, width = HEIGHT_WIDTH)
}

fn decode_ledger_id(what: &str, raw: &str) -> Result<Vec<u8>> {
    if raw.is_empty() {
        return Err(Error::DataIntegrity(format!("empty {what}")));
    }
    LEDGER_B64
        .decode(raw)
        .map_err(|e| Error::DataIntegrity(format!("{what} '{raw}' is not base64url: {e}")))
}

// ── Position ──────────────────────────────────────────────

/// Upper bound of an evaluation: an exact sort key or a whole block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    SortKey(SortKey),
    BlockHeight(u64),
}

impl Position {
    /// Inclusive sort-key bound covered by this position.
    pub fn upper_bound(&self) -> SortKey {
        match self {
            Position::SortKey(key) => key.clone(),
            Position::BlockHeight(height) => SortKey::block_upper_bound(*height),
        }
    }
}

impl From<SortKey> for Position {
    fn from(key: SortKey) -> Self {
        Position::SortKey(key)
    }
}

impl From<u64> for Position {
    fn from(height: u64) -> Self {
        Position::BlockHeight(height)
    }
}

// ── Sorters ───────────────────────────────────────────────

/// Orders raw interactions and guarantees each carries a sort key
pub trait InteractionsSorter: Send + Sync {
    fn sort(&self, interactions: Vec<Interaction>) -> Result<Vec<Interaction>>;
}

/// Derives keys from block data and sorts by them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicographicalSorter;

impl InteractionsSorter for LexicographicalSorter {
    fn sort(&self, interactions: Vec<Interaction>) -> Result<Vec<Interaction>> {
        let mut keyed = interactions
            .into_iter()
            .map(|mut tx| {
                let key = SortKey::derive(tx.block.height, &tx.block.hash, &tx.id)?;
                tx.sort_key = Some(key);
                Ok(tx)
            })
            .collect::<Result<Vec<_>>>()?;
        // Stable sort: identical keys only arise from duplicated transactions.
        keyed.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
        Ok(keyed)
    }
}

/// Trusts keys assigned upstream; rejects missing or misordered keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentitySorter;

impl InteractionsSorter for IdentitySorter {
    fn sort(&self, interactions: Vec<Interaction>) -> Result<Vec<Interaction>> {
        let mut previous: Option<&SortKey> = None;
        for tx in &interactions {
            let key = tx.sort_key.as_ref().ok_or_else(|| {
                Error::DataIntegrity(format!("interaction {} has no sort key", tx.id))
            })?;
            if previous.is_some_and(|p| p > key) {
                return Err(Error::DataIntegrity(format!(
                    "interaction {} is out of order at {}",
                    tx.id, key
                )));
            }
            previous = Some(key);
        }
        Ok(interactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlockInfo;

    const ZERO_BLOCK: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
    const TX_1_TO_32: &str = "AQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHyA";

    fn tx(id: &str, height: u64) -> Interaction {
        Interaction::new(
            id,
            "caller",
            BlockInfo::new(height, ZERO_BLOCK, 0),
            "{}",
        )
    }

    #[test]
    fn test_known_vector() {
        let key = SortKey::derive(1_000_000, ZERO_BLOCK, TX_1_TO_32).unwrap();
        assert_eq!(
            key.as_str(),
            "000001000000,0b8f4c5b6adc4c087ab9f43aaeb6007084c264adcaa3cb07176b792342850412"
        );
        assert_eq!(key.block_height(), Some(1_000_000));
    }

    #[test]
    fn test_height_dominates_tiebreak() {
        let low = SortKey::derive(9, ZERO_BLOCK, TX_1_TO_32).unwrap();
        let high = SortKey::derive(10, ZERO_BLOCK, "_____________________________________w").unwrap();
        assert!(low < high);
        assert!(high < SortKey::block_upper_bound(10));
        assert!(SortKey::block_upper_bound(9) < high);
    }

    #[test]
    fn test_low_heights_keep_full_width() {
        let key = SortKey::derive(7, ZERO_BLOCK, TX_1_TO_32).unwrap();
        assert!(key.as_str().starts_with("000000000007,"));
        let wide = SortKey::derive(99_999, ZERO_BLOCK, TX_1_TO_32).unwrap();
        assert!(wide.as_str().starts_with("000000099999,"));
        assert!(key < wide);
        assert_eq!(key.block_height(), Some(7));
    }

    #[test]
    fn test_malformed_identifiers() {
        assert!(matches!(
            SortKey::derive(1, "not*base64", TX_1_TO_32),
            Err(Error::DataIntegrity(_))
        ));
        assert!(matches!(
            SortKey::derive(1, ZERO_BLOCK, ""),
            Err(Error::DataIntegrity(_))
        ));
        assert!(matches!(
            SortKey::derive(1, ZERO_BLOCK, "A"),
            Err(Error::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_parse_round_trip() {
        let key = SortKey::derive(42, ZERO_BLOCK, TX_1_TO_32).unwrap();
        assert_eq!(SortKey::parse(key.as_str()).unwrap(), key);
        assert!(SortKey::parse("42,abc").is_err());
        assert!(SortKey::parse("no-separator").is_err());
    }

    #[test]
    fn test_sort_is_permutation_invariant() {
        let ids = [TX_1_TO_32, "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBA", "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCA"];
        let forward: Vec<Interaction> = ids.iter().map(|id| tx(id, 5)).collect();
        let mut backward = forward.clone();
        backward.reverse();

        let a = LexicographicalSorter.sort(forward).unwrap();
        let b = LexicographicalSorter.sort(backward).unwrap();
        let ids_a: Vec<_> = a.iter().map(|t| t.id.clone()).collect();
        let ids_b: Vec<_> = b.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
        assert!(a.windows(2).all(|w| w[0].sort_key < w[1].sort_key));
    }

    #[test]
    fn test_sort_determinism() {
        let batch: Vec<Interaction> = (0..20u64)
            .map(|h| tx(TX_1_TO_32, h % 4))
            .collect();
        let first = LexicographicalSorter.sort(batch.clone()).unwrap();
        for _ in 0..100 {
            let again = LexicographicalSorter.sort(batch.clone()).unwrap();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_identity_sorter_requires_keys() {
        let missing = vec![tx(TX_1_TO_32, 1)];
        assert!(matches!(
            IdentitySorter.sort(missing),
            Err(Error::DataIntegrity(_))
        ));

        let keyed = LexicographicalSorter.sort(vec![tx(TX_1_TO_32, 1), tx(TX_1_TO_32, 2)]).unwrap();
        let mut reversed = keyed.clone();
        assert_eq!(IdentitySorter.sort(keyed.clone()).unwrap(), keyed);
        reversed.reverse();
        assert!(IdentitySorter.sort(reversed).is_err());
    }

    #[test]
    fn test_position_bounds() {
        let key = SortKey::derive(3, ZERO_BLOCK, TX_1_TO_32).unwrap();
        assert_eq!(Position::from(key.clone()).upper_bound(), key);
        assert_eq!(
            Position::from(3u64).upper_bound().as_str(),
            format!("000000000003,{}", "f".repeat(64))
        );
    }
}
