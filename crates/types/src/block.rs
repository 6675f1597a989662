//! Block and BlockHeader types.
//!
//! This module provides the block-related types:
//! - [`BlockHeader`] - Metadata identifying a candidate block
//! - [`Block`] - A complete block with header, transactions and certificate
//! - [`Certificate`] - The aggregated two-step vote proof attached on acceptance
//! - [`Transaction`] - An opaque transaction payload
//!
//! Transaction semantics are outside the consensus core; candidates carry
//! their transactions as opaque byte payloads that are hashed into the
//! header's transaction root.

use crate::{Hash, EMPTY_HASH};
use sba_crypto::bls::{PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
use sba_crypto::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A block header containing all metadata about a candidate block.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Protocol version of the block
    pub version: u8,
    /// Block height (equals the round that produces it)
    pub height: u64,
    /// Unix timestamp in seconds
    pub timestamp: i64,
    /// Hash of the previous block
    pub prev_block_hash: Hash,
    /// Sortition seed carried forward from the generator
    pub seed: Vec<u8>,
    /// BLS public key of the block generator
    #[serde(with = "serde_bytes_hex")]
    pub generator_bls_pubkey: Vec<u8>,
    /// Merkle root of the transactions in this block
    pub tx_root: Hash,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            version: 0,
            height: 0,
            timestamp: 0,
            prev_block_hash: EMPTY_HASH,
            seed: Vec::new(),
            generator_bls_pubkey: vec![0u8; PUBLIC_KEY_SIZE],
            tx_root: EMPTY_HASH,
        }
    }
}

impl BlockHeader {
    /// Computes the hash of this header.
    ///
    /// The hash is the SHA-3-256 of the canonical field encoding and doubles
    /// as the block hash that reduction and agreement vote over.
    pub fn hash(&self) -> Hash {
        let mut hasher = Hasher::new();
        hasher.update(&[self.version]);
        hasher.update(&self.height.to_le_bytes());
        hasher.update(&self.timestamp.to_le_bytes());
        hasher.update(&self.prev_block_hash);
        hasher.update(&self.seed);
        hasher.update(&self.generator_bls_pubkey);
        hasher.update(&self.tx_root);
        hasher.finalize()
    }
}

impl fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHeader")
            .field("height", &self.height)
            .field("hash", &hex::encode(&self.hash()[..8]))
            .field("prev", &hex::encode(&self.prev_block_hash[..8]))
            .finish()
    }
}

/// An opaque transaction payload.
///
/// The core never interprets transaction contents; verification is delegated
/// to the external block verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Raw serialized transaction bytes
    pub payload: Vec<u8>,
}

impl Transaction {
    /// Create a transaction from raw bytes.
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Hash of the raw payload.
    pub fn hash(&self) -> Hash {
        sba_crypto::sha3_256(&self.payload)
    }
}

/// Aggregated two-step vote proof for an accepted block.
///
/// Produced from the winning agreement of a round and stored alongside the
/// block so that any party can re-verify the round outcome: each signature is
/// the aggregate of the reduction votes whose committee positions are set in
/// the matching bitset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Aggregated signature of the first reduction step
    #[serde(with = "serde_bytes_hex")]
    pub step_one_sig: Vec<u8>,
    /// Aggregated signature of the second reduction step
    #[serde(with = "serde_bytes_hex")]
    pub step_two_sig: Vec<u8>,
    /// The second reduction step of the round iteration that converged
    pub step: u8,
    /// Committee bitset of the first step's voters
    pub step_one_committee: u64,
    /// Committee bitset of the second step's voters
    pub step_two_committee: u64,
}

impl Default for Certificate {
    fn default() -> Self {
        Self {
            step_one_sig: vec![0u8; SIGNATURE_SIZE],
            step_two_sig: vec![0u8; SIGNATURE_SIZE],
            step: 0,
            step_one_committee: 0,
            step_two_committee: 0,
        }
    }
}

impl Certificate {
    /// Whether this certificate still carries placeholder values.
    ///
    /// Candidate blocks circulate with a pending (empty) certificate; the
    /// real one is attached when the round produces a winner.
    pub fn is_pending(&self) -> bool {
        self.step_one_committee == 0 && self.step_two_committee == 0
    }
}

/// A complete block: header, transactions, and certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// Transactions included in the block
    pub txs: Vec<Transaction>,
    /// Certificate of the round that accepted this block; pending on candidates
    pub cert: Certificate,
}

impl Block {
    /// Create a candidate block with a pending certificate.
    pub fn new(header: BlockHeader, txs: Vec<Transaction>) -> Self {
        Self {
            header,
            txs,
            cert: Certificate::default(),
        }
    }

    /// The block hash, derived from the header.
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Compute the transaction root over the current transaction list.
    pub fn compute_tx_root(&self) -> Hash {
        let mut hasher = Hasher::new();
        for tx in &self.txs {
            hasher.update(&tx.hash());
        }
        hasher.finalize()
    }
}

mod serde_bytes_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            serializer.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            hex::decode(s).map_err(serde::de::Error::custom)
        } else {
            <Vec<u8>>::deserialize(deserializer)
        }
    }
}
