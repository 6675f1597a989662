//! Agreement verification and accumulation.
//!
//! An agreement message carries the aggregated votes of both reduction
//! steps. Verification rebuilds each step's aggregated public key from the
//! committee positions set in the bitset and checks the aggregated
//! signature against it, so a forged bitset or an aggregate missing a voter
//! cannot pass. Verified agreements are then counted per block hash by
//! distinct sender; the first hash to reach quorum wins the round.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use sba_crypto::bls::BlsPublicKey;
use sba_crypto::Hash;
use tracing::{debug, trace};

use crate::config::{ConsensusConfig, MAX_COMMITTEE_SIZE};
use crate::header::{self, SignatureError};
use crate::messages::Agreement;
use crate::provisioners::{ProvisionerKey, Provisioners};
use crate::sortition::{Cluster, VotingCommittee};

/// Errors from agreement verification
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgreementError {
    /// Outer or aggregated signature failed
    #[error("failed to verify agreement: {0}")]
    InvalidSignature(#[from] SignatureError),

    /// The header step cannot anchor two reduction steps
    #[error("step {0} out of range for an agreement")]
    StepOutOfRange(u8),

    /// A bitset selected no committee members
    #[error("bitset selects an empty subcommittee")]
    EmptySubcommittee,

    /// A step vote set was empty where votes are required
    #[error("agreement carries an empty step vote set")]
    EmptyStepVotes,

    /// Aggregated public key reconstruction failed
    #[error("failed to reconstruct aggregated key: {0}")]
    Reconstruction(String),

    /// Combined voters across both steps fall short of quorum
    #[error("vote set too small: {got}/{needed}")]
    VoteSetTooSmall {
        /// Voters counted across both steps
        got: usize,
        /// Quorum requirement
        needed: usize,
    },

    /// Sender holds no seat in the agreement committee
    #[error("sender {0} is not a committee member")]
    NotInCommittee(String),
}

/// Reconstruct an aggregated public key from a subcommittee.
pub fn reconstruct_apk(subcommittee: &Cluster) -> Result<BlsPublicKey, AgreementError> {
    let keys = subcommittee.unique_keys();
    if keys.is_empty() {
        return Err(AgreementError::EmptySubcommittee);
    }

    let mut parsed = Vec::with_capacity(keys.len());
    for key in &keys {
        parsed.push(
            key.to_public_key()
                .map_err(|e| AgreementError::Reconstruction(e.to_string()))?,
        );
    }
    let refs: Vec<&BlsPublicKey> = parsed.iter().collect();
    BlsPublicKey::aggregate(&refs).map_err(|e| AgreementError::Reconstruction(e.to_string()))
}

/// Verifies agreement messages for one round.
///
/// Committees are deterministic per `(round, step)`, so the handler memoizes
/// them for the lifetime of the round.
pub struct AgreementHandler {
    round: u64,
    provisioners: Arc<Provisioners>,
    allow_repetition: bool,
    committees: HashMap<u8, VotingCommittee>,
}

impl AgreementHandler {
    /// Create a handler over the round's provisioner snapshot.
    pub fn new(round: u64, provisioners: Arc<Provisioners>, config: &ConsensusConfig) -> Self {
        Self {
            round,
            provisioners,
            allow_repetition: config.allow_repetition,
            committees: HashMap::new(),
        }
    }

    /// The agreement committee for a step of this round (size 64), memoized.
    pub fn committee(&mut self, step: u8) -> &VotingCommittee {
        let round = self.round;
        let provisioners = &self.provisioners;
        let allow_repetition = self.allow_repetition;
        self.committees.entry(step).or_insert_with(|| {
            provisioners.create_voting_committee(round, step, MAX_COMMITTEE_SIZE, allow_repetition)
        })
    }

    /// Whether a key holds a seat in the committee for a step.
    pub fn is_member(&mut self, key: &ProvisionerKey, step: u8) -> bool {
        self.committee(step).is_member(key)
    }

    /// Number of committee members necessary to reach quorum.
    pub fn quorum(&self) -> usize {
        self.provisioners.quorum(self.round)
    }

    /// Verify an agreement message.
    ///
    /// Checks the sender's outer signature, then for each of the two step
    /// vote sets rebuilds the subcommittee its bitset selects, reconstructs
    /// the aggregated public key, and verifies the aggregated signature over
    /// the signable vote bytes of `(round, step, block_hash)`. Finally the
    /// voters counted across both steps (once per committee seat) must reach
    /// quorum.
    pub fn verify(&mut self, ev: &Agreement) -> Result<(), AgreementError> {
        let hdr = &ev.header;

        hdr.verify_vote_signature(ev.signed_votes())?;

        let mut all_voters = 0usize;

        for (i, votes) in ev.votes_per_step.iter().enumerate() {
            // The agreement header carries the second reduction step; the
            // first step is one less.
            if hdr.step == 0 {
                return Err(AgreementError::StepOutOfRange(hdr.step));
            }
            let step = hdr.step - 1 + i as u8;
            if step == u8::MAX {
                return Err(AgreementError::StepOutOfRange(step));
            }

            let signature = votes.signature().ok_or(AgreementError::EmptyStepVotes)?.clone();
            let bitset = votes.bitset;

            let subcommittee = self.committee(step).intersect(bitset);
            all_voters += subcommittee.total_occurrences();

            let apk = reconstruct_apk(&subcommittee)?;
            header::verify_aggregate_signature(
                hdr.round,
                step,
                &hdr.block_hash,
                &apk,
                &signature,
            )?;
        }

        let needed = self.quorum();
        if all_voters < needed {
            return Err(AgreementError::VoteSetTooSmall {
                got: all_voters,
                needed,
            });
        }

        Ok(())
    }
}

/// Counts verified agreements per block hash and decides the round winner.
///
/// Agreements are keyed by distinct sender, so a peer re-sending its
/// agreement cannot inflate the count. Once a hash reaches quorum the
/// accumulator latches: no second hash can win the same round.
#[derive(Debug, Default)]
pub struct AgreementAccumulator {
    quorum: usize,
    collected: HashMap<Hash, BTreeMap<ProvisionerKey, Agreement>>,
    winner: Option<Hash>,
}

impl AgreementAccumulator {
    /// Create an accumulator with the round's quorum requirement.
    pub fn new(quorum: usize) -> Self {
        Self {
            quorum,
            collected: HashMap::new(),
            winner: None,
        }
    }

    /// The winning hash, once decided.
    pub fn winner(&self) -> Option<&Hash> {
        self.winner.as_ref()
    }

    /// Number of distinct senders collected for a hash.
    pub fn count_for(&self, hash: &Hash) -> usize {
        self.collected.get(hash).map(BTreeMap::len).unwrap_or(0)
    }

    /// Store a verified agreement.
    ///
    /// Returns the winning `(hash, agreement)` when this message completes
    /// quorum for its hash. The returned agreement is the one with the
    /// smallest big-integer signature representation among those collected,
    /// which makes the choice deterministic regardless of arrival order.
    pub fn collect(&mut self, ev: Agreement) -> Option<(Hash, Agreement)> {
        if self.winner.is_some() {
            return None;
        }

        let hash = ev.header.block_hash;
        let per_sender = self.collected.entry(hash).or_default();
        let sender = *ev.sender();

        if per_sender.contains_key(&sender) {
            trace!(sender = %sender, "duplicate agreement dropped");
            return None;
        }
        per_sender.insert(sender, ev);

        let count = per_sender.len();
        if count < self.quorum {
            trace!(
                count,
                quorum = self.quorum,
                block_hash = %hex::encode(&hash[..8]),
                "agreement quorum not reached"
            );
            return None;
        }

        debug!(
            count,
            quorum = self.quorum,
            block_hash = %hex::encode(&hash[..8]),
            "agreement quorum reached"
        );

        self.winner = Some(hash);
        let winning = per_sender
            .values()
            .min_by(|a, b| a.cmp_repr(b))
            .cloned()
            .expect("per-sender map is non-empty at quorum");

        Some((hash, winning))
    }
}
