//! The round state machine and its driver loop.
//!
//! One round decides one block height. The loop sequences the three
//! sub-protocols: selection is external and arrives as a `BestScore`
//! message; the [`Reducer`] drives the two reduction steps; the agreement
//! accumulator runs concurrently from round start, because peers ahead in
//! their own reduction may already be broadcasting agreements for this
//! round.
//!
//! All state mutation happens on this single task. The loop suspends only
//! at its `select!` points: the control channel, the inbound message
//! channel, the step timer, and the round timer. Cancellation and round
//! transitions are observed at every one of them.
//!
//! A round ends the first time one of these happens:
//! - the agreement accumulator reaches quorum for some hash (this node's own
//!   agreement counts like any other), or
//! - the round timer expires, which only increments a timeout counter; the
//!   external selection re-runs with a larger step budget and reduction
//!   restarts at the next step pair.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sba_crypto::Hash;
use sba_types::{Block, Certificate, EMPTY_HASH};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::agreement::{AgreementAccumulator, AgreementHandler};
use crate::aggregator::QuorumReached;
use crate::candidates::CandidateRegistry;
use crate::config::ConsensusConfig;
use crate::keys::ConsensusKeys;
use crate::messages::{Agreement, Message, StepVotes, Topic};
use crate::provisioners::Provisioners;
use crate::queue::RoundQueue;
use crate::reducer::{Reducer, ReductionPhase, StepCompletion};

/// Fatal conditions that stop the round loop.
///
/// Message-level failures never reach this type; adversarial input is
/// dropped where it is detected.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// The database collaborator failed; no in-band retry
    #[error("database unavailable: {0}")]
    Database(String),

    /// A channel to the embedding node closed
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

/// Validates candidate blocks. Opaque to the core.
#[async_trait]
pub trait BlockVerifier: Send + Sync {
    /// Verify a candidate block, returning the rejection reason on failure.
    async fn verify(&self, candidate: &Block) -> Result<(), String>;
}

/// Fetches candidate blocks from peers.
#[async_trait]
pub trait CandidateRequestor: Send + Sync {
    /// Fetch a candidate by hash, giving up after `timeout`.
    async fn fetch(&self, block_hash: Hash, timeout: Duration) -> Option<Block>;
}

/// Persistence for accepted blocks.
#[async_trait]
pub trait Database: Send + Sync {
    /// Height of the current chain tip.
    async fn current_height(&self) -> Result<u64, String>;
    /// Store an accepted block.
    async fn store_block(&self, block: &Block) -> Result<(), String>;
}

/// Snapshot handed to the core when a round starts.
///
/// Provisioners are snapshotted at round entry; nothing mutates them
/// mid-round.
#[derive(Debug, Clone)]
pub struct RoundUpdate {
    /// The round (block height) to run
    pub round: u64,
    /// Provisioner snapshot for the round
    pub provisioners: Arc<Provisioners>,
    /// Selection outcome, when already known at round entry
    pub start_hash: Option<Hash>,
}

/// A decided round, emitted on the winner stream.
#[derive(Debug, Clone)]
pub struct RoundWinner {
    /// The decided round
    pub round: u64,
    /// Hash of the winning block
    pub block_hash: Hash,
    /// Certificate proving the two-step quorum
    pub certificate: Certificate,
    /// The winning block with its certificate attached
    pub block: Block,
}

enum Control {
    StartRound(RoundUpdate),
    Cancel,
}

/// Sync progress shared with the handle.
#[derive(Debug)]
struct SyncProgress {
    base: AtomicU64,
    current: AtomicU64,
    target: AtomicU64,
}

impl SyncProgress {
    fn new() -> Self {
        Self {
            base: AtomicU64::new(u64::MAX),
            current: AtomicU64::new(0),
            target: AtomicU64::new(0),
        }
    }

    fn observe_current(&self, round: u64) {
        // First observed round anchors the scale
        let _ = self
            .base
            .compare_exchange(u64::MAX, round, Ordering::SeqCst, Ordering::SeqCst);
        self.current.fetch_max(round, Ordering::SeqCst);
        self.target.fetch_max(round, Ordering::SeqCst);
    }

    fn observe_target(&self, round: u64) {
        self.target.fetch_max(round, Ordering::SeqCst);
    }

    fn percent(&self) -> u8 {
        let base = self.base.load(Ordering::SeqCst);
        if base == u64::MAX {
            return 0;
        }
        let current = self.current.load(Ordering::SeqCst);
        let target = self.target.load(Ordering::SeqCst);
        if current >= target || target == base {
            return 100;
        }
        (((current - base) * 100) / (target - base)).min(100) as u8
    }
}

/// Client handle to a running consensus task.
#[derive(Clone)]
pub struct ConsensusHandle {
    control_tx: mpsc::Sender<Control>,
    inbound_tx: mpsc::Sender<(Topic, Bytes)>,
    progress: Arc<SyncProgress>,
}

impl ConsensusHandle {
    /// Start a round with its provisioner snapshot and, when already known,
    /// the selection outcome.
    pub async fn start_round(&self, update: RoundUpdate) -> Result<(), ConsensusError> {
        self.control_tx
            .send(Control::StartRound(update))
            .await
            .map_err(|_| ConsensusError::ChannelClosed("control"))
    }

    /// Cancel the in-flight round: timers stop, accumulators are dropped,
    /// the candidate registry stays intact for the next round.
    pub async fn cancel(&self) -> Result<(), ConsensusError> {
        self.control_tx
            .send(Control::Cancel)
            .await
            .map_err(|_| ConsensusError::ChannelClosed("control"))
    }

    /// Feed a raw message from the network bus.
    pub async fn accept_message(&self, topic: Topic, payload: Bytes) -> Result<(), ConsensusError> {
        self.inbound_tx
            .send((topic, payload))
            .await
            .map_err(|_| ConsensusError::ChannelClosed("inbound"))
    }

    /// Rough chain-sync progress in percent, derived from the distance
    /// between the first round this core ran and the highest round observed
    /// in live or queued traffic.
    pub fn sync_progress(&self) -> u8 {
        self.progress.percent()
    }
}

struct RoundState {
    round: u64,
    reducer: Reducer,
    handler: AgreementHandler,
    accumulator: AgreementAccumulator,
    iteration: u64,
    timeout_count: u64,
    round_deadline: Instant,
}

/// The consensus core: owns all per-round state and drives it from one task.
pub struct Consensus<V, R, D> {
    keys: ConsensusKeys,
    config: ConsensusConfig,
    verifier: Arc<V>,
    requestor: Arc<R>,
    database: Arc<D>,
    registry: Arc<CandidateRegistry>,

    control_rx: mpsc::Receiver<Control>,
    inbound_rx: mpsc::Receiver<(Topic, Bytes)>,
    outbound_tx: mpsc::Sender<Message>,
    winner_tx: mpsc::Sender<RoundWinner>,

    queue: RoundQueue,
    state: Option<RoundState>,
    last_completed: Option<u64>,
    progress: Arc<SyncProgress>,
}

impl<V, R, D> Consensus<V, R, D>
where
    V: BlockVerifier,
    R: CandidateRequestor,
    D: Database,
{
    /// Create a consensus core and its client handle.
    ///
    /// `outbound_tx` receives the messages this node gossips;
    /// `winner_tx` receives one event per decided round.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keys: ConsensusKeys,
        config: ConsensusConfig,
        verifier: Arc<V>,
        requestor: Arc<R>,
        database: Arc<D>,
        registry: Arc<CandidateRegistry>,
        outbound_tx: mpsc::Sender<Message>,
        winner_tx: mpsc::Sender<RoundWinner>,
    ) -> (Self, ConsensusHandle) {
        let (control_tx, control_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let progress = Arc::new(SyncProgress::new());

        let handle = ConsensusHandle {
            control_tx,
            inbound_tx,
            progress: progress.clone(),
        };

        let queue = RoundQueue::new(config.queue_cap_per_round);
        let core = Self {
            keys,
            config,
            verifier,
            requestor,
            database,
            registry,
            control_rx,
            inbound_rx,
            outbound_tx,
            winner_tx,
            queue,
            state: None,
            last_completed: None,
            progress,
        };
        (core, handle)
    }

    /// Run the loop until both client channels close.
    pub async fn run(mut self) -> Result<(), ConsensusError> {
        // The chain tip at startup anchors the sync-progress scale.
        let tip = self
            .database
            .current_height()
            .await
            .map_err(ConsensusError::Database)?;
        self.progress.observe_current(tip);

        loop {
            let step_deadline = self.state.as_ref().and_then(|s| s.reducer.deadline());
            let round_deadline = self.state.as_ref().map(|s| s.round_deadline);
            let far = Instant::now() + Duration::from_secs(86_400);

            tokio::select! {
                ctrl = self.control_rx.recv() => match ctrl {
                    Some(Control::StartRound(update)) => self.begin_round(update).await?,
                    Some(Control::Cancel) => self.cancel_round(),
                    None => return Ok(()),
                },
                inbound = self.inbound_rx.recv() => match inbound {
                    Some((topic, payload)) => self.dispatch(topic, payload).await?,
                    None => return Ok(()),
                },
                _ = tokio::time::sleep_until(step_deadline.unwrap_or(far)),
                    if step_deadline.is_some() =>
                {
                    self.on_step_timeout().await?;
                }
                _ = tokio::time::sleep_until(round_deadline.unwrap_or(far)),
                    if round_deadline.is_some() =>
                {
                    self.on_round_timeout();
                }
            }
        }
    }

    async fn begin_round(&mut self, update: RoundUpdate) -> Result<(), ConsensusError> {
        // The round counter never decreases.
        if let Some(state) = &self.state {
            if update.round <= state.round {
                warn!(
                    round = update.round,
                    current = state.round,
                    "ignoring non-monotonic round start"
                );
                return Ok(());
            }
        }
        if let Some(completed) = self.last_completed {
            if update.round <= completed {
                warn!(
                    round = update.round,
                    completed, "ignoring round start at completed height"
                );
                return Ok(());
            }
        }

        let round = update.round;
        info!(round, provisioners = update.provisioners.len(), "round started");

        self.registry.evict_before(round);
        self.queue.discard_below(round);
        self.progress.observe_current(round);

        let reducer = Reducer::new(
            self.keys.clone(),
            self.config.clone(),
            update.provisioners.clone(),
            round,
            self.outbound_tx.clone(),
        );
        let handler = AgreementHandler::new(round, update.provisioners.clone(), &self.config);
        let accumulator = AgreementAccumulator::new(update.provisioners.quorum(round));

        self.state = Some(RoundState {
            round,
            reducer,
            handler,
            accumulator,
            iteration: 0,
            timeout_count: 0,
            round_deadline: Instant::now() + self.config.round_timeout,
        });

        // Replay agreements buffered for this round before touching live
        // traffic; one of them may already complete the round.
        for agreement in self.queue.drain(round) {
            if self.state.is_none() {
                return Ok(());
            }
            self.process_agreement(agreement).await?;
        }

        if let Some(start_hash) = update.start_hash {
            self.start_reduction(start_hash).await?;
        }

        Ok(())
    }

    fn cancel_round(&mut self) {
        if let Some(mut state) = self.state.take() {
            info!(round = state.round, "round cancelled");
            state.reducer.finalize();
        }
    }

    async fn dispatch(&mut self, topic: Topic, mut payload: Bytes) -> Result<(), ConsensusError> {
        let message = match Message::unmarshal(topic, &mut payload) {
            Ok(message) => message,
            Err(e) => {
                // Malformed input is dropped where it is found.
                debug!(?topic, error = %e, "malformed message dropped");
                return Ok(());
            }
        };

        match message {
            Message::BestScore(bs) => {
                let Some(state) = self.state.as_ref() else {
                    return Ok(());
                };
                if bs.round != state.round {
                    trace!(round = bs.round, current = state.round, "stale best score");
                    return Ok(());
                }
                if matches!(
                    state.reducer.phase(),
                    ReductionPhase::Idle | ReductionPhase::Done
                ) {
                    self.start_reduction(bs.block_hash).await?;
                }
            }
            Message::Reduction(ev) => {
                let Some(state) = self.state.as_mut() else {
                    return Ok(());
                };
                if let Some(quorum) = state.reducer.collect_vote(&ev) {
                    self.handle_completion(StepCompletion::Continued(Some(quorum)))
                        .await?;
                }
            }
            Message::Agreement(ev) => self.route_agreement(ev).await?,
            Message::Candidate(block) => {
                let round = block.header.height;
                self.registry.insert(block, round);
            }
            Message::GetCandidate(hash) => {
                if let Some(block) = self.registry.get(&hash) {
                    self.gossip(Message::Candidate(block)).await;
                }
            }
            Message::AcceptedBlock { round, block_hash } => {
                self.on_accepted_block(round, block_hash);
            }
        }
        Ok(())
    }

    /// Discard past agreements, buffer future ones, process present ones.
    async fn route_agreement(&mut self, ev: Agreement) -> Result<(), ConsensusError> {
        let round = ev.header.round;
        let current = self.state.as_ref().map(|s| s.round);

        match current {
            Some(cur) if round < cur => {
                trace!(round, current = cur, "late agreement discarded");
            }
            Some(cur) if round > cur => {
                self.progress.observe_target(round);
                self.queue.push(round, ev);
            }
            Some(_) => self.process_agreement(ev).await?,
            None => {
                // No active round: keep it for when that round starts,
                // unless it is already decided.
                if self.last_completed.map_or(true, |completed| round > completed) {
                    self.progress.observe_target(round);
                    self.queue.push(round, ev);
                }
            }
        }
        Ok(())
    }

    async fn process_agreement(&mut self, ev: Agreement) -> Result<(), ConsensusError> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };

        if !state.handler.is_member(ev.sender(), ev.header.step) {
            trace!(sender = %ev.sender(), "agreement from non-member dropped");
            return Ok(());
        }

        if let Err(e) = state.handler.verify(&ev) {
            debug!(round = state.round, error = %e, "agreement rejected");
            return Ok(());
        }

        if let Some((hash, winning)) = state.accumulator.collect(ev) {
            self.finalize_round(hash, winning).await?;
        }
        Ok(())
    }

    async fn start_reduction(&mut self, start_hash: Hash) -> Result<(), ConsensusError> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        let iteration = state.iteration;
        let quorum = state.reducer.start_iteration(start_hash, iteration).await;
        self.handle_completion(StepCompletion::Continued(quorum))
            .await
    }

    /// Drive the reducer through step completions.
    ///
    /// Each reported quorum is resolved against the candidate oracle first;
    /// entering the next step may immediately produce another quorum, so
    /// this loops until the reducer rests.
    async fn handle_completion(
        &mut self,
        mut completion: StepCompletion,
    ) -> Result<(), ConsensusError> {
        loop {
            match completion {
                StepCompletion::Continued(None) => return Ok(()),
                StepCompletion::Continued(Some(quorum)) => {
                    let (block_hash, step_votes) = self.resolve_outcome(quorum).await;
                    let Some(state) = self.state.as_mut() else {
                        return Ok(());
                    };
                    completion = state.reducer.complete_step(block_hash, step_votes).await;
                }
                StepCompletion::Finished(Some(agreement)) => {
                    self.gossip(Message::Agreement(agreement.clone())).await;
                    return self.process_agreement(agreement).await;
                }
                StepCompletion::Finished(None) => return Ok(()),
            }
        }
    }

    /// Apply the candidate oracle to a step quorum.
    ///
    /// Convergence on the empty hash carries no votes. For a real block the
    /// candidate must be known (fetched from peers when absent) and pass
    /// external verification; a fetch timeout or a rejected candidate turns
    /// the step outcome empty, exactly like a timeout.
    async fn resolve_outcome(&mut self, quorum: QuorumReached) -> (Hash, Option<StepVotes>) {
        let hash = quorum.block_hash;
        let Some(step_votes) = quorum.step_votes else {
            return (EMPTY_HASH, None);
        };

        let block = match self.registry.get(&hash) {
            Some(block) => Some(block),
            None => {
                let fetched = self
                    .requestor
                    .fetch(hash, self.config.candidate_fetch_timeout)
                    .await;
                if let Some(block) = &fetched {
                    let round = self.state.as_ref().map(|s| s.round).unwrap_or_default();
                    self.registry.insert(block.clone(), round);
                }
                fetched
            }
        };

        let Some(block) = block else {
            warn!(block_hash = %hex::encode(&hash[..8]), "candidate fetch timed out");
            return (EMPTY_HASH, None);
        };

        match self.verifier.verify(&block).await {
            Ok(()) => (hash, Some(step_votes)),
            Err(reason) => {
                warn!(
                    block_hash = %hex::encode(&hash[..8]),
                    reason,
                    "candidate rejected after quorum"
                );
                (EMPTY_HASH, None)
            }
        }
    }

    async fn finalize_round(
        &mut self,
        block_hash: Hash,
        agreement: Agreement,
    ) -> Result<(), ConsensusError> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        let round = state.round;

        let block = match self.registry.get(&block_hash) {
            Some(block) => Some(block),
            None => {
                self.requestor
                    .fetch(block_hash, self.config.candidate_fetch_timeout)
                    .await
            }
        };
        let Some(mut block) = block else {
            // Quorum exists but the block is unreachable; the round stays
            // open for more agreements or its timeout.
            warn!(
                round,
                block_hash = %hex::encode(&block_hash[..8]),
                "winning candidate unavailable"
            );
            return Ok(());
        };

        let certificate = match agreement.generate_certificate() {
            Ok(certificate) => certificate,
            Err(e) => {
                error!(round, error = %e, "winning agreement without votes");
                return Ok(());
            }
        };
        block.cert = certificate.clone();

        self.database
            .store_block(&block)
            .await
            .map_err(ConsensusError::Database)?;

        info!(
            round,
            block_hash = %hex::encode(&block_hash[..8]),
            timeouts = state.timeout_count,
            "round decided"
        );

        let mut state = self.state.take().expect("state checked above");
        state.reducer.finalize();
        self.last_completed = Some(round);
        self.progress.observe_current(round);
        self.registry.evict_before(round + 1);

        self.winner_tx
            .send(RoundWinner {
                round,
                block_hash,
                certificate,
                block,
            })
            .await
            .map_err(|_| ConsensusError::ChannelClosed("winner"))
    }

    async fn on_step_timeout(&mut self) -> Result<(), ConsensusError> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        let completion = state.reducer.on_timeout().await;
        self.handle_completion(completion).await
    }

    /// The round ran out of budget: count it and wait for selection to
    /// re-run. The step counter moves to the next pair so a late quorum for
    /// the failed iteration can no longer form.
    fn on_round_timeout(&mut self) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        state.timeout_count += 1;
        state.iteration += 1;
        state.reducer.finalize();
        state.round_deadline = Instant::now() + self.config.round_timeout;
        warn!(
            round = state.round,
            timeouts = state.timeout_count,
            "round timed out, awaiting selection retry"
        );
    }

    /// A block for `round` was accepted elsewhere (e.g. by the chain
    /// synchronizer): an in-flight round at or below it is obsolete.
    fn on_accepted_block(&mut self, round: u64, block_hash: Hash) {
        self.progress.observe_current(round);
        if let Some(state) = &self.state {
            if state.round <= round {
                debug!(
                    round,
                    block_hash = %hex::encode(&block_hash[..8]),
                    "external block accepted, cancelling round"
                );
                self.last_completed = Some(round);
                self.cancel_round();
            }
        }
        self.queue.discard_below(round + 1);
    }

    async fn gossip(&self, message: Message) {
        if let Err(e) = self.outbound_tx.send(message).await {
            warn!(error = %e, "outbound channel closed, gossip dropped");
        }
    }
}
