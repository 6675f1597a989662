//! The two-step reduction driver.
//!
//! A round's reduction ratifies the selection winner in two chained voting
//! steps. The reducer owns one [`Aggregator`] at a time, signs and emits
//! this node's own vote when it holds a committee seat, and hands each
//! step's outcome to the next:
//!
//! - the first step votes on the selection's `start_hash`; its converged
//!   hash (possibly empty) becomes the second step's start hash
//! - when both steps converge on the same real block, the reducer builds an
//!   [`Agreement`] carrying both aggregated vote sets
//!
//! Step timers and candidate verification belong to the round loop: on
//! quorum the reducer reports [`QuorumReached`] and the loop calls back with
//! the verified outcome. A step timeout completes the step with an empty
//! outcome; a failed step is still a step, and the counter only moves
//! forward.

use std::sync::Arc;

use sba_crypto::Hash;
use sba_types::EMPTY_HASH;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::aggregator::{Aggregator, AggregatorError, QuorumReached};
use crate::config::ConsensusConfig;
use crate::header::Header;
use crate::keys::ConsensusKeys;
use crate::messages::{Agreement, Message, Reduction, StepVotes};
use crate::provisioners::Provisioners;

/// Where the reducer currently is within a round iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionPhase {
    /// Waiting for a selection outcome
    Idle,
    /// Collecting votes for the first reduction step
    FirstStep,
    /// Collecting votes for the second reduction step
    SecondStep,
    /// Both steps completed for this iteration
    Done,
}

/// What a completed step led to.
#[derive(Debug)]
pub enum StepCompletion {
    /// The reducer moved to the second step; entering it may already have
    /// produced a quorum (own vote in a tiny committee)
    Continued(Option<QuorumReached>),
    /// The iteration finished; an agreement is present only when both steps
    /// converged on the same real block
    Finished(Option<Agreement>),
}

/// Drives the two reduction steps of a round iteration.
pub struct Reducer {
    keys: ConsensusKeys,
    config: ConsensusConfig,
    provisioners: Arc<Provisioners>,
    round: u64,
    phase: ReductionPhase,
    first_step: u8,
    start_hash: Hash,
    aggregator: Option<Aggregator>,
    first_votes: Option<StepVotes>,
    deadline: Option<Instant>,
    outbound: mpsc::Sender<Message>,
}

impl Reducer {
    /// Create an idle reducer for a round.
    pub fn new(
        keys: ConsensusKeys,
        config: ConsensusConfig,
        provisioners: Arc<Provisioners>,
        round: u64,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            keys,
            config,
            provisioners,
            round,
            phase: ReductionPhase::Idle,
            first_step: 1,
            start_hash: EMPTY_HASH,
            aggregator: None,
            first_votes: None,
            deadline: None,
            outbound,
        }
    }

    /// The current phase.
    pub fn phase(&self) -> ReductionPhase {
        self.phase
    }

    /// The step currently collecting votes, if any.
    pub fn current_step(&self) -> Option<u8> {
        match self.phase {
            ReductionPhase::FirstStep => Some(self.first_step),
            ReductionPhase::SecondStep => Some(self.first_step + 1),
            _ => None,
        }
    }

    /// Deadline of the running step timer, if a step is active.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Start a reduction iteration from a selection outcome.
    ///
    /// `iteration` counts how often this round's selection re-ran; it spaces
    /// the step numbers (iteration 0 uses steps 1 and 2) and grows the step
    /// timeout. Returns a quorum immediately when this node's own vote alone
    /// completes one.
    pub async fn start_iteration(
        &mut self,
        start_hash: Hash,
        iteration: u64,
    ) -> Option<QuorumReached> {
        // Leave room for the second step below the u8 ceiling
        self.first_step = (iteration * 2 + 1).min(253) as u8;
        self.start_hash = start_hash;
        self.first_votes = None;
        self.phase = ReductionPhase::FirstStep;

        debug!(
            round = self.round,
            step = self.first_step,
            block_hash = %hex::encode(&start_hash[..8]),
            "reduction started"
        );

        self.enter_step(self.first_step, iteration).await
    }

    /// Collect an external reduction vote for the current step.
    ///
    /// Votes for other rounds or steps are dropped: a vote for step N
    /// arriving after the reducer advanced to N+1 is stale by the step
    /// ordering contract. Message-level failures are logged and dropped;
    /// adversarial input never surfaces as an error.
    pub fn collect_vote(&mut self, ev: &Reduction) -> Option<QuorumReached> {
        let step = self.current_step()?;
        if ev.header.round != self.round || ev.header.step != step {
            trace!(
                round = ev.header.round,
                step = ev.header.step,
                current_step = step,
                "stale reduction vote dropped"
            );
            return None;
        }

        let aggregator = self.aggregator.as_mut()?;
        match aggregator.collect_vote(ev) {
            Ok(outcome) => outcome,
            Err(AggregatorError::Aggregation(e)) => {
                // Poisoned step: halt it immediately with an empty outcome.
                warn!(round = self.round, step, error = %e, "step aggregation poisoned");
                Some(QuorumReached {
                    block_hash: EMPTY_HASH,
                    step_votes: None,
                })
            }
            Err(e) => {
                debug!(round = self.round, step, error = %e, "reduction vote rejected");
                None
            }
        }
    }

    /// Complete the current step with its verified outcome.
    ///
    /// For the first step the converged hash (or the empty hash) seeds the
    /// second step. For the second step, an agreement is produced when both
    /// step vote sets exist and the hash is a real block.
    pub async fn complete_step(
        &mut self,
        block_hash: Hash,
        step_votes: Option<StepVotes>,
    ) -> StepCompletion {
        match self.phase {
            ReductionPhase::FirstStep => {
                debug!(
                    round = self.round,
                    step = self.first_step,
                    converged = step_votes.is_some(),
                    "first reduction step completed"
                );
                self.first_votes = step_votes;
                self.start_hash = block_hash;
                self.phase = ReductionPhase::SecondStep;

                let iteration = u64::from(self.first_step / 2);
                let quorum = self.enter_step(self.first_step + 1, iteration).await;
                StepCompletion::Continued(quorum)
            }
            ReductionPhase::SecondStep => {
                debug!(
                    round = self.round,
                    step = self.first_step + 1,
                    converged = step_votes.is_some(),
                    "second reduction step completed"
                );
                self.phase = ReductionPhase::Done;
                self.deadline = None;
                self.aggregator = None;

                let agreement = self.build_agreement(block_hash, step_votes);
                StepCompletion::Finished(agreement)
            }
            _ => StepCompletion::Finished(None),
        }
    }

    /// Handle the step timer expiring: the step failed to converge and
    /// completes with an empty outcome. The step counter still advances.
    pub async fn on_timeout(&mut self) -> StepCompletion {
        debug!(round = self.round, step = ?self.current_step(), "reduction step timed out");
        self.complete_step(EMPTY_HASH, None).await
    }

    /// Stop all reduction activity for this round.
    pub fn finalize(&mut self) {
        self.phase = ReductionPhase::Done;
        self.aggregator = None;
        self.deadline = None;
    }

    async fn enter_step(&mut self, step: u8, iteration: u64) -> Option<QuorumReached> {
        let committee = self.provisioners.create_voting_committee(
            self.round,
            step,
            self.config.committee_size,
            self.config.allow_repetition,
        );
        let quorum = self.provisioners.quorum(self.round);
        let am_member = committee.is_member(&self.keys.public);

        self.aggregator = Some(Aggregator::new(self.round, step, committee, quorum));
        self.deadline = Some(Instant::now() + self.config.step_timeout_for(iteration));

        if !am_member {
            return None;
        }

        // Cast our own vote: gossip it and absorb it locally, since outbound
        // traffic is not looped back through the inbound bus.
        let vote = Reduction::new_signed(&self.keys.secret, self.round, step, self.start_hash);
        if let Err(e) = self.outbound.send(Message::Reduction(vote.clone())).await {
            warn!(round = self.round, step, error = %e, "failed to gossip own reduction vote");
        }
        self.collect_vote(&vote)
    }

    fn build_agreement(
        &mut self,
        block_hash: Hash,
        second_votes: Option<StepVotes>,
    ) -> Option<Agreement> {
        let first_votes = self.first_votes.take()?;
        let second_votes = second_votes?;
        if block_hash == EMPTY_HASH {
            return None;
        }

        let second_step = self.first_step + 1;
        let header = Header::new(self.keys.public, self.round, second_step, block_hash);
        let mut agreement = Agreement::new(header);
        agreement.votes_per_step = [first_votes, second_votes];
        agreement.sign(&self.keys.secret);

        debug!(
            round = self.round,
            step = second_step,
            block_hash = %hex::encode(&block_hash[..8]),
            "agreement produced"
        );
        Some(agreement)
    }
}
