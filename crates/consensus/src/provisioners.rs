//! Provisioner registry: the stake-holding candidate voters.
//!
//! This module handles:
//! - Stakes with activation windows (`start_height ..= end_height`)
//! - The ordered provisioner set backing committee sortition
//! - Stake maintenance (insert, subtract, expiry removal)
//! - The provisioner snapshot wire codec
//!
//! Keys are ordered by their compressed bytes interpreted as big integers;
//! for fixed-length big-endian bytes that is exactly lexicographic order, so
//! a `BTreeMap` keyed on the raw bytes gives the canonical ordering and keeps
//! the key set and the member map over the same domain by construction.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};
use sba_crypto::bls::{BlsPublicKey, PUBLIC_KEY_SIZE};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::sortition::{self, VotingCommittee};
use crate::wire::{self, WireError};

/// Errors for provisioner set operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionerError {
    /// Key bytes are not the fixed public key length
    #[error("public key is {actual} bytes long instead of {expected}")]
    MalformedKey {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Key bytes do not decode to a valid BLS public key
    #[error("invalid BLS public key encoding: {0}")]
    InvalidKeyEncoding(String),

    /// Key is not a registered provisioner
    #[error("public key {0} not found among provisioner set")]
    UnknownKey(String),
}

/// A provisioner's BLS public key in compressed wire form.
///
/// This is the identity used throughout the consensus core: committee seats,
/// vote clusters, and bitset positions are all keyed on it. Ordering is the
/// big-integer order of the key bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProvisionerKey(pub [u8; PUBLIC_KEY_SIZE]);

impl ProvisionerKey {
    /// Build a key from a slice, checking only the length.
    ///
    /// Curve validity is checked separately on registry insertion so that
    /// message senders can be looked up without re-validating the point.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProvisionerError> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(ProvisionerError::MalformedKey {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; PUBLIC_KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// The raw compressed key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Decode into a verifiable public key.
    pub fn to_public_key(&self) -> Result<BlsPublicKey, ProvisionerError> {
        BlsPublicKey::from_bytes(&self.0)
            .map_err(|e| ProvisionerError::InvalidKeyEncoding(e.to_string()))
    }

    /// Short hex form for logging.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for ProvisionerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ProvisionerKey({}..)", self.short_hex())
    }
}

impl std::fmt::Display for ProvisionerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..", self.short_hex())
    }
}

/// A single stake with its activation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stake {
    /// Staked amount
    pub amount: u64,
    /// First round at which the stake is active
    pub start_height: u64,
    /// Last round at which the stake is active
    pub end_height: u64,
}

impl Stake {
    /// Create a stake active over `start_height ..= end_height`.
    pub fn new(amount: u64, start_height: u64, end_height: u64) -> Self {
        Self {
            amount,
            start_height,
            end_height,
        }
    }

    /// A stake is active at round R iff `start <= R <= end`.
    pub fn is_active(&self, round: u64) -> bool {
        self.start_height <= round && round <= self.end_height
    }
}

/// A provisioner: a BLS public key and its stakes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    key: ProvisionerKey,
    stakes: Vec<Stake>,
}

impl Member {
    /// Create a member with no stakes.
    pub fn new(key: ProvisionerKey) -> Self {
        Self {
            key,
            stakes: Vec::new(),
        }
    }

    /// The member's key.
    pub fn key(&self) -> &ProvisionerKey {
        &self.key
    }

    /// The member's stakes in insertion order.
    pub fn stakes(&self) -> &[Stake] {
        &self.stakes
    }

    /// Append a stake.
    pub fn add_stake(&mut self, stake: Stake) {
        self.stakes.push(stake);
    }

    /// Remove the stake at `idx`, most likely because it expired.
    pub fn remove_stake(&mut self, idx: usize) {
        self.stakes.swap_remove(idx);
    }

    /// Subtract an amount from the member's stake.
    ///
    /// The first non-zero stake in insertion order is decremented. Returns
    /// the amount actually subtracted, which may be less than requested when
    /// that stake is smaller.
    pub fn subtract_from_stake(&mut self, amount: u64) -> u64 {
        for stake in &mut self.stakes {
            if stake.amount > 0 {
                if stake.amount < amount {
                    let subtracted = stake.amount;
                    stake.amount = 0;
                    return subtracted;
                }
                stake.amount -= amount;
                return amount;
            }
        }
        0
    }

    /// Sum of all stake amounts, regardless of activation.
    pub fn total_stake(&self) -> u64 {
        self.stakes.iter().map(|s| s.amount).sum()
    }

    /// Sum of the stake amounts active at the given round.
    pub fn active_stake(&self, round: u64) -> u64 {
        self.stakes
            .iter()
            .filter(|s| s.is_active(round))
            .map(|s| s.amount)
            .sum()
    }
}

/// The current set of provisioners.
///
/// Snapshotted per round by the round state machine; a snapshot is never
/// mutated mid-round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provisioners {
    members: BTreeMap<ProvisionerKey, Member>,
}

impl Provisioners {
    /// Create an empty provisioner set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stake for a public key, creating the member if needed.
    ///
    /// Fails if the key bytes have the wrong length or do not decode to a
    /// valid curve point.
    pub fn insert(&mut self, pubkey: &[u8], stake: Stake) -> Result<(), ProvisionerError> {
        let key = ProvisionerKey::from_slice(pubkey)?;
        key.to_public_key()?;

        self.members
            .entry(key)
            .or_insert_with(|| Member::new(key))
            .add_stake(stake);

        trace!(key = %key, amount = stake.amount, "provisioner stake added");
        Ok(())
    }

    /// Look up a member by key.
    pub fn get_member(&self, key: &ProvisionerKey) -> Option<&Member> {
        self.members.get(key)
    }

    /// Total stake of a provisioner, looked up by raw key bytes.
    ///
    /// Fails with `MalformedKey` on a wrong-length key and `UnknownKey` when
    /// the key is not a provisioner.
    pub fn get_stake(&self, pubkey: &[u8]) -> Result<u64, ProvisionerError> {
        let key = ProvisionerKey::from_slice(pubkey)?;
        let member = self
            .members
            .get(&key)
            .ok_or_else(|| ProvisionerError::UnknownKey(key.short_hex()))?;
        Ok(member.total_stake())
    }

    /// Subtract an amount from a provisioner's stake, returning the amount
    /// actually subtracted.
    pub fn subtract_from_stake(
        &mut self,
        pubkey: &[u8],
        amount: u64,
    ) -> Result<u64, ProvisionerError> {
        let key = ProvisionerKey::from_slice(pubkey)?;
        let member = self
            .members
            .get_mut(&key)
            .ok_or_else(|| ProvisionerError::UnknownKey(key.short_hex()))?;
        Ok(member.subtract_from_stake(amount))
    }

    /// Remove stakes whose `end_height` is below the given round, dropping
    /// members left with no stakes.
    pub fn remove_expired(&mut self, round: u64) {
        for member in self.members.values_mut() {
            member.stakes.retain(|s| s.end_height >= round);
        }
        self.members.retain(|_, m| !m.stakes.is_empty());
    }

    /// How many provisioners have at least one active stake at the round.
    ///
    /// This determines the effective committee size when fewer provisioners
    /// are active than the sortition target.
    pub fn subset_size(&self, round: u64) -> usize {
        self.members
            .values()
            .filter(|m| m.active_stake(round) > 0)
            .count()
    }

    /// Sum of all stake amounts active at the round.
    pub fn total_weight(&self, round: u64) -> u64 {
        self.members.values().map(|m| m.active_stake(round)).sum()
    }

    /// Members with active stake at the round, in canonical key order,
    /// paired with their active weight.
    pub fn active_members(&self, round: u64) -> Vec<(ProvisionerKey, u64)> {
        self.members
            .values()
            .filter_map(|m| {
                let w = m.active_stake(round);
                (w > 0).then_some((*m.key(), w))
            })
            .collect()
    }

    /// Number of committee seats necessary to reach quorum at a round:
    /// 75 % of the effective committee size, rounded up. The effective size
    /// is the agreement committee cap or the active subset, whichever is
    /// smaller.
    pub fn quorum(&self, round: u64) -> usize {
        let committee_size = crate::config::MAX_COMMITTEE_SIZE.min(self.subset_size(round));
        (committee_size * 3).div_ceil(4)
    }

    /// Deterministically extract the voting committee for `(round, step)`.
    pub fn create_voting_committee(
        &self,
        round: u64,
        step: u8,
        target_size: usize,
        allow_repetition: bool,
    ) -> VotingCommittee {
        sortition::create_committee(self, round, step, target_size, allow_repetition)
    }

    /// Number of registered provisioners.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterate members in canonical key order.
    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Marshal the provisioner set.
    pub fn marshal(&self, buf: &mut impl BufMut) {
        wire::write_varint(buf, self.members.len() as u64);
        for member in self.members.values() {
            wire::write_varbytes(buf, member.key().as_bytes());
            wire::write_varint(buf, member.stakes().len() as u64);
            for stake in member.stakes() {
                wire::write_u64_le(buf, stake.amount);
                wire::write_u64_le(buf, stake.start_height);
                wire::write_u64_le(buf, stake.end_height);
            }
        }
    }

    /// Unmarshal a provisioner set.
    ///
    /// Key validity is re-checked on the way in, as snapshots may arrive from
    /// peers.
    pub fn unmarshal(buf: &mut impl Buf) -> Result<Self, WireError> {
        let n_members = wire::read_varint(buf)?;
        let mut set = Self::new();
        for _ in 0..n_members {
            let key_bytes = wire::read_varbytes(buf)?;
            let key = ProvisionerKey::from_slice(&key_bytes).map_err(|_| {
                WireError::InvalidLength {
                    expected: PUBLIC_KEY_SIZE,
                    actual: key_bytes.len(),
                }
            })?;
            key.to_public_key().map_err(|_| WireError::InvalidKey)?;

            let member = set
                .members
                .entry(key)
                .or_insert_with(|| Member::new(key));

            let n_stakes = wire::read_varint(buf)?;
            for _ in 0..n_stakes {
                let amount = wire::read_u64_le(buf)?;
                let start_height = wire::read_u64_le(buf)?;
                let end_height = wire::read_u64_le(buf)?;
                member.add_stake(Stake::new(amount, start_height, end_height));
            }
        }
        Ok(set)
    }
}
