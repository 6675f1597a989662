//! Shared registry of candidate blocks.
//!
//! Candidates are indexed by block hash as they are generated or received,
//! looked up when a round's agreement resolves a winning hash, and evicted a
//! few rounds after insertion. The registry outlives individual rounds and
//! is the only consensus state shared across them, so access goes through a
//! reader-writer lock.

use std::collections::HashMap;

use parking_lot::RwLock;
use sba_crypto::Hash;
use sba_types::Block;
use tracing::trace;

/// Thread-safe candidate block store with round-based eviction.
#[derive(Debug)]
pub struct CandidateRegistry {
    inner: RwLock<HashMap<Hash, StoredCandidate>>,
    eviction_depth: u64,
}

#[derive(Debug, Clone)]
struct StoredCandidate {
    block: Block,
    inserted_round: u64,
}

impl CandidateRegistry {
    /// Create a registry that keeps candidates for `eviction_depth` rounds.
    pub fn new(eviction_depth: u64) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            eviction_depth,
        }
    }

    /// Store a candidate block observed at the given round.
    ///
    /// Re-inserting the same hash refreshes its eviction round.
    pub fn insert(&self, block: Block, round: u64) {
        let hash = block.hash();
        trace!(round, block_hash = %hex::encode(&hash[..8]), "candidate stored");
        self.inner.write().insert(
            hash,
            StoredCandidate {
                block,
                inserted_round: round,
            },
        );
    }

    /// Look up a candidate by hash.
    pub fn get(&self, hash: &Hash) -> Option<Block> {
        self.inner.read().get(hash).map(|c| c.block.clone())
    }

    /// Whether a candidate is present.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.read().contains_key(hash)
    }

    /// Drop candidates inserted more than the eviction depth before `round`.
    pub fn evict_before(&self, round: u64) {
        let depth = self.eviction_depth;
        self.inner
            .write()
            .retain(|_, c| c.inserted_round.saturating_add(depth) >= round);
    }

    /// Number of stored candidates.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether the registry holds nothing.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sba_types::{BlockHeader, Transaction};

    fn candidate(height: u64) -> Block {
        let header = BlockHeader {
            height,
            ..Default::default()
        };
        Block::new(header, vec![Transaction::new(vec![height as u8])])
    }

    #[test]
    fn test_insert_and_get() {
        let registry = CandidateRegistry::new(3);
        let block = candidate(10);
        let hash = block.hash();

        registry.insert(block.clone(), 10);
        assert_eq!(registry.get(&hash), Some(block));
        assert!(registry.get(&[0xab; 32]).is_none());
    }

    #[test]
    fn test_eviction_by_depth() {
        let registry = CandidateRegistry::new(2);
        let old = candidate(1);
        let fresh = candidate(5);
        let old_hash = old.hash();
        let fresh_hash = fresh.hash();

        registry.insert(old, 1);
        registry.insert(fresh, 5);

        registry.evict_before(5);
        assert!(!registry.contains(&old_hash));
        assert!(registry.contains(&fresh_hash));
    }

    #[test]
    fn test_reinsert_refreshes_eviction() {
        let registry = CandidateRegistry::new(1);
        let block = candidate(1);
        let hash = block.hash();

        registry.insert(block.clone(), 1);
        registry.insert(block, 4);
        registry.evict_before(4);
        assert!(registry.contains(&hash));
    }
}
