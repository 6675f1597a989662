//! Per-step storage and aggregation of reduction votes.
//!
//! The aggregator acts as a de facto storage unit for reduction messages:
//! every accepted vote is aggregated into the [`StepVotes`] kept under the
//! voted block hash, and the sender is counted once per committee seat they
//! hold. Once the votes for some hash reach quorum the aggregator latches
//! `finished` and reports the outcome; an aggregator is instantiated per
//! step and is no longer usable afterwards.
//!
//! Accumulation is commutative (any delivery order of the same votes ends in
//! the same state) and idempotent under duplicate senders: a second vote
//! from the same sender at this step is dropped without error.

use std::collections::{BTreeSet, HashMap};

use sba_crypto::Hash;
use sba_types::EMPTY_HASH;
use tracing::{debug, trace, warn};

use crate::header::SignatureError;
use crate::messages::{Reduction, StepVotes, StepVotesError};
use crate::provisioners::ProvisionerKey;
use crate::sortition::{Cluster, VotingCommittee};

/// Errors for vote collection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregatorError {
    /// Vote is for a different round or step than this aggregator's
    #[error("vote for round {round} step {step} fed to aggregator at round {expected_round} step {expected_step}")]
    WrongStep {
        /// Round carried by the vote
        round: u64,
        /// Step carried by the vote
        step: u8,
        /// Round this aggregator collects
        expected_round: u64,
        /// Step this aggregator collects
        expected_step: u8,
    },

    /// Sender holds no seat in the step committee
    #[error("sender {0} is not a committee member")]
    NotInCommittee(String),

    /// The vote signature failed verification
    #[error("invalid vote signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    /// Aggregation failed; the step is poisoned
    #[error(transparent)]
    Aggregation(#[from] StepVotesError),
}

/// The outcome reported when a block hash reaches quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumReached {
    /// The hash that converged; all zeros when the step agreed on no block
    pub block_hash: Hash,
    /// The aggregated votes, absent when the step converged on the empty hash
    pub step_votes: Option<StepVotes>,
}

/// Collects and aggregates the reduction votes of one `(round, step)`.
#[derive(Debug)]
pub struct Aggregator {
    round: u64,
    step: u8,
    committee: VotingCommittee,
    quorum: usize,
    voted: BTreeSet<ProvisionerKey>,
    vote_sets: HashMap<Hash, (StepVotes, Cluster)>,
    finished: bool,
}

impl Aggregator {
    /// Create an aggregator for one step.
    pub fn new(round: u64, step: u8, committee: VotingCommittee, quorum: usize) -> Self {
        Self {
            round,
            step,
            committee,
            quorum,
            voted: BTreeSet::new(),
            vote_sets: HashMap::new(),
            finished: false,
        }
    }

    /// Whether quorum was already reached (or the step was poisoned).
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The committee this aggregator collects votes for.
    pub fn committee(&self) -> &VotingCommittee {
        &self.committee
    }

    /// Collect a reduction vote.
    ///
    /// Returns `Ok(Some(_))` when this vote completes a quorum,
    /// `Ok(None)` when the vote was absorbed (or dropped as a duplicate or
    /// after finishing), and an error when the vote is rejected.
    pub fn collect_vote(
        &mut self,
        ev: &Reduction,
    ) -> Result<Option<QuorumReached>, AggregatorError> {
        if self.finished {
            return Ok(None);
        }

        let hdr = &ev.header;
        if hdr.round != self.round || hdr.step != self.step {
            return Err(AggregatorError::WrongStep {
                round: hdr.round,
                step: hdr.step,
                expected_round: self.round,
                expected_step: self.step,
            });
        }

        let votes = self.committee.votes_for(&hdr.sender);
        if votes == 0 {
            return Err(AggregatorError::NotInCommittee(hdr.sender.short_hex()));
        }

        // Idempotence: one vote per sender per step, across all hashes.
        if self.voted.contains(&hdr.sender) {
            trace!(
                round = self.round,
                step = self.step,
                sender = %hdr.sender,
                "duplicate vote dropped"
            );
            return Ok(None);
        }

        hdr.verify_vote_signature(&ev.signed_hash)?;

        let (step_votes, cluster) = self.vote_sets.entry(hdr.block_hash).or_default();

        if let Err(e) = step_votes.add(&ev.signed_hash, &hdr.sender, hdr.step) {
            // A step mismatch inside the vote set indicates a routing bug;
            // the step is poisoned and will only ever halt empty.
            warn!(
                round = self.round,
                step = self.step,
                error = %e,
                "vote aggregation failed"
            );
            self.finished = true;
            return Err(e.into());
        }

        self.voted.insert(hdr.sender);
        cluster.insert_n(hdr.sender, votes);

        let total = cluster.total_occurrences();
        if total < self.quorum {
            trace!(
                round = self.round,
                step = self.step,
                votes = total,
                quorum = self.quorum,
                block_hash = %hex::encode(&hdr.block_hash[..8]),
                "quorum not reached"
            );
            return Ok(None);
        }

        debug!(
            round = self.round,
            step = self.step,
            votes = total,
            quorum = self.quorum,
            block_hash = %hex::encode(&hdr.block_hash[..8]),
            "quorum reached"
        );

        self.finished = true;

        let (step_votes, cluster) = self
            .vote_sets
            .get_mut(&hdr.block_hash)
            .expect("vote set exists after insertion");
        step_votes.bitset = self.committee.bits(&cluster.key_set());

        // Convergence on the empty hash carries no vote set: the step failed
        // to settle on a real block.
        let step_votes = if hdr.block_hash == EMPTY_HASH {
            None
        } else {
            Some(step_votes.clone())
        };

        Ok(Some(QuorumReached {
            block_hash: hdr.block_hash,
            step_votes,
        }))
    }
}
