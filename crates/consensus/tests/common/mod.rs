//! Shared fixtures for consensus integration tests.
//!
//! Committees are drawn without repetition here so that a fixture of N
//! equal-stake provisioners yields a committee containing every key, which
//! makes expected bitsets and quorums exact.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::BTreeSet;

use sba_consensus::{
    signable_vote_bytes, Agreement, ConsensusConfig, ConsensusKeys, Header, Provisioners,
    Reduction, Stake, StepVotes, MAX_COMMITTEE_SIZE,
};
use sba_crypto::Hash;
use sba_types::{Block, BlockHeader, Transaction};

/// A test configuration: short timeouts, committees without repeated seats.
pub fn test_config() -> ConsensusConfig {
    ConsensusConfig::fast().without_repetition()
}

/// N provisioners with one equal stake each, active from round 1 to 1000,
/// with their signing keys (seeded, deterministic).
pub fn provisioner_fixture(n: usize, amount: u64) -> (Provisioners, Vec<ConsensusKeys>) {
    let mut provisioners = Provisioners::new();
    let mut keys = Vec::with_capacity(n);

    for i in 0..n {
        let consensus_keys = ConsensusKeys::from_seed(&[i as u8 + 1; 32]).unwrap();
        provisioners
            .insert(consensus_keys.public.as_bytes(), Stake::new(amount, 1, 1000))
            .unwrap();
        keys.push(consensus_keys);
    }

    (provisioners, keys)
}

/// A signed reduction vote.
pub fn signed_vote(keys: &ConsensusKeys, round: u64, step: u8, block_hash: Hash) -> Reduction {
    Reduction::new_signed(&keys.secret, round, step, block_hash)
}

/// Aggregate the votes of every fixture key holding a seat in the step's
/// agreement committee, stamping the committee bitset.
pub fn gen_step_votes(
    block_hash: Hash,
    round: u64,
    step: u8,
    keys: &[ConsensusKeys],
    provisioners: &Provisioners,
) -> StepVotes {
    let committee = provisioners.create_voting_committee(round, step, MAX_COMMITTEE_SIZE, false);

    let mut votes = StepVotes::new();
    let mut voters = BTreeSet::new();

    for k in keys {
        if !committee.is_member(&k.public) || voters.contains(&k.public) {
            continue;
        }
        let sig = k.secret.sign(&signable_vote_bytes(round, step, &block_hash));
        votes.add(&sig.to_bytes(), &k.public, step).unwrap();
        voters.insert(k.public);
    }

    votes.bitset = committee.bits(&voters);
    votes
}

/// A well-formed agreement carrying the aggregated votes of both reduction
/// steps, signed by the fixture key at `sender_idx`.
///
/// `step` is the second reduction step; the first vote set belongs to
/// `step - 1`.
pub fn mock_agreement(
    block_hash: Hash,
    round: u64,
    step: u8,
    sender_idx: usize,
    keys: &[ConsensusKeys],
    provisioners: &Provisioners,
) -> Agreement {
    let first = gen_step_votes(block_hash, round, step - 1, keys, provisioners);
    let second = gen_step_votes(block_hash, round, step, keys, provisioners);

    let header = Header::new(keys[sender_idx].public, round, step, block_hash);
    let mut agreement = Agreement::new(header);
    agreement.votes_per_step = [first, second];
    agreement.sign(&keys[sender_idx].secret);
    agreement
}

/// A candidate block at the given height with a deterministic payload.
pub fn candidate_block(height: u64) -> Block {
    let header = BlockHeader {
        height,
        timestamp: 1_700_000_000,
        prev_block_hash: [2u8; 32],
        seed: vec![7u8; 33],
        ..Default::default()
    };
    Block::new(header, vec![Transaction::new(vec![height as u8])])
}
