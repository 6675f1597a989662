//! End-to-end tests of the round driver: a full happy-path round over the
//! message bus, queue replay of future agreements, and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use common::{candidate_block, mock_agreement, provisioner_fixture, signed_vote};
use parking_lot::Mutex;
use sba_consensus::{
    BlockVerifier, CandidateRegistry, CandidateRequestor, Consensus, ConsensusConfig,
    ConsensusHandle, ConsensusKeys, Database, Message, Provisioners, RoundUpdate, RoundWinner,
    Topic,
};
use sba_crypto::Hash;
use sba_types::Block;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct OkVerifier;

#[async_trait]
impl BlockVerifier for OkVerifier {
    async fn verify(&self, _candidate: &Block) -> Result<(), String> {
        Ok(())
    }
}

struct NoRequestor;

#[async_trait]
impl CandidateRequestor for NoRequestor {
    async fn fetch(&self, _block_hash: Hash, _timeout: Duration) -> Option<Block> {
        None
    }
}

#[derive(Default)]
struct MemDb {
    stored: Mutex<Vec<Block>>,
}

#[async_trait]
impl Database for MemDb {
    async fn current_height(&self) -> Result<u64, String> {
        Ok(self.stored.lock().last().map_or(0, |b| b.header.height))
    }

    async fn store_block(&self, block: &Block) -> Result<(), String> {
        self.stored.lock().push(block.clone());
        Ok(())
    }
}

struct Harness {
    handle: ConsensusHandle,
    winner_rx: mpsc::Receiver<RoundWinner>,
    outbound_rx: mpsc::Receiver<Message>,
    registry: Arc<CandidateRegistry>,
    database: Arc<MemDb>,
    keys: Vec<ConsensusKeys>,
    provisioners: Arc<Provisioners>,
}

fn spawn_harness(n: usize) -> Harness {
    let (provisioners, keys) = provisioner_fixture(n, 100);
    let provisioners = Arc::new(provisioners);
    let registry = Arc::new(CandidateRegistry::new(3));
    let database = Arc::new(MemDb::default());
    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let (winner_tx, winner_rx) = mpsc::channel(8);

    // Real-length timeouts: the test drives every transition itself and
    // must never race a step timer.
    let config = ConsensusConfig::default().without_repetition();

    let (core, handle) = Consensus::new(
        keys[0].clone(),
        config,
        Arc::new(OkVerifier),
        Arc::new(NoRequestor),
        database.clone(),
        registry.clone(),
        outbound_tx,
        winner_tx,
    );
    tokio::spawn(core.run());

    Harness {
        handle,
        winner_rx,
        outbound_rx,
        registry,
        database,
        keys,
        provisioners,
    }
}

fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::new();
    message.marshal(&mut buf).unwrap();
    buf.freeze()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_full_round_happy_path() {
    let mut h = spawn_harness(5);
    let round = 10;

    let block = candidate_block(round);
    let hash = block.hash();
    h.registry.insert(block, round);

    h.handle
        .start_round(RoundUpdate {
            round,
            provisioners: h.provisioners.clone(),
            start_hash: Some(hash),
        })
        .await
        .unwrap();
    settle().await;

    // Three external first-step votes; with our own that is the quorum of 4
    for k in h.keys[1..4].iter() {
        let vote = Message::Reduction(signed_vote(k, round, 1, hash));
        h.handle
            .accept_message(Topic::Reduction, encode(&vote))
            .await
            .unwrap();
    }
    settle().await;

    // Same for the second step
    for k in h.keys[1..4].iter() {
        let vote = Message::Reduction(signed_vote(k, round, 2, hash));
        h.handle
            .accept_message(Topic::Reduction, encode(&vote))
            .await
            .unwrap();
    }
    settle().await;

    // Our own agreement is one of four; three peers complete the quorum
    for i in 1..4 {
        let agreement =
            mock_agreement(hash, round, 2, i, &h.keys, &h.provisioners);
        h.handle
            .accept_message(Topic::Agreement, encode(&Message::Agreement(agreement)))
            .await
            .unwrap();
    }

    let winner = timeout(Duration::from_secs(5), h.winner_rx.recv())
        .await
        .expect("round must decide")
        .expect("winner stream open");

    assert_eq!(winner.round, round);
    assert_eq!(winner.block_hash, hash);
    assert_eq!(winner.certificate.step, 2);
    assert_eq!(winner.block.cert, winner.certificate);
    assert_eq!(winner.block.header.height, round);

    // The decided block was persisted
    assert_eq!(h.database.stored.lock().len(), 1);

    // This node gossiped its two votes and its agreement
    let mut reductions = 0;
    let mut agreements = 0;
    while let Ok(message) = h.outbound_rx.try_recv() {
        match message {
            Message::Reduction(_) => reductions += 1,
            Message::Agreement(_) => agreements += 1,
            _ => {}
        }
    }
    assert_eq!(reductions, 2);
    assert_eq!(agreements, 1);

    assert_eq!(h.handle.sync_progress(), 100);
}

#[tokio::test]
async fn test_future_agreements_replayed_on_round_start() {
    let mut h = spawn_harness(5);

    let block = candidate_block(12);
    let hash = block.hash();
    h.registry.insert(block, 12);

    // Round 10 is running; peers are two rounds ahead
    h.handle
        .start_round(RoundUpdate {
            round: 10,
            provisioners: h.provisioners.clone(),
            start_hash: None,
        })
        .await
        .unwrap();
    settle().await;

    for i in 0..4 {
        let agreement = mock_agreement(hash, 12, 2, i, &h.keys, &h.provisioners);
        h.handle
            .accept_message(Topic::Agreement, encode(&Message::Agreement(agreement)))
            .await
            .unwrap();
    }
    settle().await;

    // Nothing decided yet: the agreements are buffered for round 12
    assert!(h.winner_rx.try_recv().is_err());

    // Entering round 12 replays the buffer before any live traffic; the
    // round decides without a single reduction vote.
    h.handle
        .start_round(RoundUpdate {
            round: 12,
            provisioners: h.provisioners.clone(),
            start_hash: None,
        })
        .await
        .unwrap();

    let winner = timeout(Duration::from_secs(5), h.winner_rx.recv())
        .await
        .expect("queued agreements must decide the round")
        .unwrap();
    assert_eq!(winner.round, 12);
    assert_eq!(winner.block_hash, hash);
}

#[tokio::test]
async fn test_late_agreements_for_prior_rounds_are_discarded() {
    let mut h = spawn_harness(5);

    h.handle
        .start_round(RoundUpdate {
            round: 10,
            provisioners: h.provisioners.clone(),
            start_hash: None,
        })
        .await
        .unwrap();
    settle().await;

    let stale_hash = candidate_block(9).hash();
    for i in 0..4 {
        let agreement = mock_agreement(stale_hash, 9, 2, i, &h.keys, &h.provisioners);
        h.handle
            .accept_message(Topic::Agreement, encode(&Message::Agreement(agreement)))
            .await
            .unwrap();
    }
    settle().await;

    assert!(h.winner_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_cancel_stops_the_round_but_keeps_candidates() {
    let mut h = spawn_harness(5);
    let round = 10;

    let block = candidate_block(round);
    let hash = block.hash();
    h.registry.insert(block, round);

    h.handle
        .start_round(RoundUpdate {
            round,
            provisioners: h.provisioners.clone(),
            start_hash: Some(hash),
        })
        .await
        .unwrap();
    settle().await;

    h.handle.cancel().await.unwrap();
    settle().await;

    // Agreements after cancellation decide nothing
    for i in 1..4 {
        let agreement = mock_agreement(hash, round, 2, i, &h.keys, &h.provisioners);
        h.handle
            .accept_message(Topic::Agreement, encode(&Message::Agreement(agreement)))
            .await
            .unwrap();
    }
    settle().await;
    assert!(h.winner_rx.try_recv().is_err());

    // The registry survives for the next round's lookups
    assert!(h.registry.contains(&hash));
}

#[tokio::test]
async fn test_get_candidate_is_answered_from_the_registry() {
    let mut h = spawn_harness(5);
    let block = candidate_block(10);
    let hash = block.hash();
    h.registry.insert(block.clone(), 10);

    h.handle
        .start_round(RoundUpdate {
            round: 10,
            provisioners: h.provisioners.clone(),
            start_hash: None,
        })
        .await
        .unwrap();
    settle().await;

    h.handle
        .accept_message(Topic::GetCandidate, encode(&Message::GetCandidate(hash)))
        .await
        .unwrap();

    let answer = timeout(Duration::from_secs(2), h.outbound_rx.recv())
        .await
        .expect("candidate request must be answered")
        .unwrap();
    assert_eq!(answer, Message::Candidate(block));
}
