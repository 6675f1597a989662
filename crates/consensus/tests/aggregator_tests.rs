//! Tests for the per-step reduction accumulator: quorum detection,
//! duplicate-sender idempotence, delivery-order independence, and
//! reconstructibility of the aggregated votes.

mod common;

use common::{provisioner_fixture, signed_vote};
use sba_consensus::{
    reconstruct_apk, signable_vote_bytes, Aggregator, ConsensusKeys, Provisioners, Reduction,
    MAX_COMMITTEE_SIZE,
};
use sba_types::EMPTY_HASH;

const ROUND: u64 = 10;
const STEP: u8 = 1;
const HASH: [u8; 32] = [0x11; 32];

fn aggregator_fixture(n: usize) -> (Aggregator, Vec<ConsensusKeys>, Provisioners) {
    let (provisioners, keys) = provisioner_fixture(n, 100);
    let committee = provisioners.create_voting_committee(ROUND, STEP, MAX_COMMITTEE_SIZE, false);
    let quorum = provisioners.quorum(ROUND);
    let aggregator = Aggregator::new(ROUND, STEP, committee, quorum);
    (aggregator, keys, provisioners)
}

#[test]
fn test_quorum_reached_on_fourth_of_five() {
    let (mut aggregator, keys, _) = aggregator_fixture(5);

    for k in keys.iter().take(3) {
        let outcome = aggregator
            .collect_vote(&signed_vote(k, ROUND, STEP, HASH))
            .unwrap();
        assert!(outcome.is_none());
        assert!(!aggregator.is_finished());
    }

    let outcome = aggregator
        .collect_vote(&signed_vote(&keys[3], ROUND, STEP, HASH))
        .unwrap()
        .expect("fourth vote completes quorum");

    assert!(aggregator.is_finished());
    assert_eq!(outcome.block_hash, HASH);
    let votes = outcome.step_votes.expect("real block carries votes");
    assert_eq!(votes.step, STEP);
    assert_eq!(votes.bitset.count_ones(), 4);
}

#[test]
fn test_split_vote_below_quorum_never_finishes() {
    // Three provisioners vote one hash, two another; quorum of 4 is
    // unreachable for either and the step can only end by timeout.
    let (mut aggregator, keys, _) = aggregator_fixture(5);
    let other: [u8; 32] = [0x22; 32];

    for k in keys.iter().take(3) {
        assert!(aggregator
            .collect_vote(&signed_vote(k, ROUND, STEP, HASH))
            .unwrap()
            .is_none());
    }
    for k in keys.iter().skip(3) {
        assert!(aggregator
            .collect_vote(&signed_vote(k, ROUND, STEP, other))
            .unwrap()
            .is_none());
    }

    assert!(!aggregator.is_finished());
}

#[test]
fn test_duplicate_sender_is_noop() {
    let (mut aggregator, keys, provisioners) = aggregator_fixture(5);

    let vote = signed_vote(&keys[0], ROUND, STEP, HASH);
    assert!(aggregator.collect_vote(&vote).unwrap().is_none());
    // Same reduction twice: the duplicate is absorbed without error and
    // without inflating the count.
    assert!(aggregator.collect_vote(&vote).unwrap().is_none());

    for k in keys.iter().skip(1).take(2) {
        assert!(aggregator
            .collect_vote(&signed_vote(k, ROUND, STEP, HASH))
            .unwrap()
            .is_none());
    }

    // Only the fourth distinct sender completes the quorum
    let outcome = aggregator
        .collect_vote(&signed_vote(&keys[3], ROUND, STEP, HASH))
        .unwrap();
    assert!(outcome.is_some());
    let _ = provisioners;
}

#[test]
fn test_vote_from_non_member_rejected() {
    let (mut aggregator, _, _) = aggregator_fixture(5);
    let outsider = ConsensusKeys::from_seed(&[99u8; 32]).unwrap();

    let result = aggregator.collect_vote(&signed_vote(&outsider, ROUND, STEP, HASH));
    assert!(result.is_err());
    assert!(!aggregator.is_finished());
}

#[test]
fn test_invalid_signature_rejected() {
    let (mut aggregator, keys, _) = aggregator_fixture(5);

    // Header claims keys[0], signature comes from keys[1]
    let mut forged = signed_vote(&keys[0], ROUND, STEP, HASH);
    forged.signed_hash = signed_vote(&keys[1], ROUND, STEP, HASH).signed_hash;

    assert!(aggregator.collect_vote(&forged).is_err());
    assert!(!aggregator.is_finished());
}

#[test]
fn test_wrong_step_vote_rejected() {
    let (mut aggregator, keys, _) = aggregator_fixture(5);
    let stale = signed_vote(&keys[0], ROUND, STEP + 1, HASH);
    assert!(aggregator.collect_vote(&stale).is_err());
}

#[test]
fn test_empty_hash_quorum_carries_no_votes() {
    let (mut aggregator, keys, _) = aggregator_fixture(5);

    let mut outcome = None;
    for k in &keys {
        outcome = aggregator
            .collect_vote(&signed_vote(k, ROUND, STEP, EMPTY_HASH))
            .unwrap();
        if outcome.is_some() {
            break;
        }
    }

    let outcome = outcome.expect("empty-hash votes still reach quorum");
    assert_eq!(outcome.block_hash, EMPTY_HASH);
    assert!(outcome.step_votes.is_none());
}

#[test]
fn test_delivery_order_does_not_change_outcome() {
    // The same fixed multiset of four valid votes, applied in two different
    // orders, must produce identical finished state and identical
    // aggregates.
    let (provisioners, keys) = provisioner_fixture(5, 100);
    let committee = provisioners.create_voting_committee(ROUND, STEP, MAX_COMMITTEE_SIZE, false);
    let quorum = provisioners.quorum(ROUND);

    let votes: Vec<Reduction> = keys
        .iter()
        .take(4)
        .map(|k| signed_vote(k, ROUND, STEP, HASH))
        .collect();

    let run = |order: Vec<&Reduction>| {
        let mut aggregator = Aggregator::new(ROUND, STEP, committee.clone(), quorum);
        let mut outcome = None;
        for vote in order {
            if let Some(q) = aggregator.collect_vote(vote).unwrap() {
                outcome = Some(q);
            }
        }
        (aggregator.is_finished(), outcome.unwrap())
    };

    let (done_fwd, fwd) = run(votes.iter().collect());
    let (done_rev, rev) = run(votes.iter().rev().collect());

    assert!(done_fwd && done_rev);
    assert_eq!(fwd.block_hash, rev.block_hash);
    assert_eq!(fwd.step_votes, rev.step_votes);
}

#[test]
fn test_finished_aggregator_drops_further_votes() {
    let (mut aggregator, keys, _) = aggregator_fixture(5);

    for k in keys.iter().take(4) {
        aggregator
            .collect_vote(&signed_vote(k, ROUND, STEP, HASH))
            .unwrap();
    }
    assert!(aggregator.is_finished());

    // The fifth vote lands after the latch: absorbed silently, no second
    // quorum is reported.
    let outcome = aggregator
        .collect_vote(&signed_vote(&keys[4], ROUND, STEP, HASH))
        .unwrap();
    assert!(outcome.is_none());
}

#[test]
fn test_quorum_votes_reconstruct_and_verify() {
    // The bitset of a finished step selects a subcommittee whose
    // reconstructed aggregated key verifies the aggregated signature.
    let (provisioners, keys) = provisioner_fixture(5, 100);
    let committee = provisioners.create_voting_committee(ROUND, STEP, MAX_COMMITTEE_SIZE, false);
    let mut aggregator = Aggregator::new(
        ROUND,
        STEP,
        committee.clone(),
        provisioners.quorum(ROUND),
    );

    let mut outcome = None;
    for k in &keys {
        if let Some(q) = aggregator
            .collect_vote(&signed_vote(k, ROUND, STEP, HASH))
            .unwrap()
        {
            outcome = Some(q);
            break;
        }
    }

    let votes = outcome.unwrap().step_votes.unwrap();
    let subcommittee = committee.intersect(votes.bitset);
    let apk = reconstruct_apk(&subcommittee).unwrap();

    let signature = votes.signature().unwrap();
    assert!(signature.verify(&signable_vote_bytes(ROUND, STEP, &HASH), &apk));
}
