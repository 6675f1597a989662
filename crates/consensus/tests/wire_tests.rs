//! Round-trip and malformed-input tests for the message codecs.

mod common;

use bytes::BytesMut;
use common::{candidate_block, mock_agreement, provisioner_fixture, signed_vote};
use sba_consensus::{
    Agreement, BestScore, Message, Reduction, StepVotes, Topic, WireError,
};

const ROUND: u64 = 10;
const HASH: [u8; 32] = [0x11; 32];

#[test]
fn test_reduction_roundtrip() {
    let (_, keys) = provisioner_fixture(2, 100);
    let vote = signed_vote(&keys[0], ROUND, 1, HASH);

    let mut buf = BytesMut::new();
    vote.marshal(&mut buf);
    let restored = Reduction::unmarshal(&mut buf.freeze()).unwrap();

    assert_eq!(vote, restored);
}

#[test]
fn test_reduction_vote_set_roundtrip() {
    let (_, keys) = provisioner_fixture(4, 100);
    let votes: Vec<Reduction> = keys
        .iter()
        .map(|k| signed_vote(k, ROUND, 1, HASH))
        .collect();

    let mut buf = BytesMut::new();
    Reduction::marshal_vote_set(&mut buf, &votes);
    let restored = Reduction::unmarshal_vote_set(&mut buf.freeze()).unwrap();

    assert_eq!(votes, restored);
}

#[test]
fn test_step_votes_roundtrip() {
    let (provisioners, keys) = provisioner_fixture(5, 100);
    let votes = common::gen_step_votes(HASH, ROUND, 1, &keys, &provisioners);

    let mut buf = BytesMut::new();
    votes.marshal(&mut buf).unwrap();
    let mut restored = StepVotes::unmarshal(&mut buf.freeze()).unwrap();
    restored.step = votes.step;

    assert_eq!(votes, restored);
}

#[test]
fn test_empty_step_votes_have_no_wire_form() {
    let votes = StepVotes::new();
    let mut buf = BytesMut::new();
    assert!(votes.marshal(&mut buf).is_err());
}

#[test]
fn test_agreement_roundtrip() {
    let (provisioners, keys) = provisioner_fixture(5, 100);
    let agreement = mock_agreement(HASH, ROUND, 2, 1, &keys, &provisioners);

    let mut buf = BytesMut::new();
    agreement.marshal(&mut buf).unwrap();
    let restored = Agreement::unmarshal(&mut buf.freeze()).unwrap();

    assert_eq!(agreement, restored);
    assert_eq!(agreement.header, restored.header);
    assert_eq!(agreement.signed_votes(), restored.signed_votes());
    assert_eq!(agreement.repr(), restored.repr());
    // Step fields are recomputed from the header on the way in
    assert_eq!(restored.votes_per_step[0].step, 1);
    assert_eq!(restored.votes_per_step[1].step, 2);
}

#[test]
fn test_agreement_with_wrong_vote_count_is_malformed() {
    let (provisioners, keys) = provisioner_fixture(5, 100);
    let agreement = mock_agreement(HASH, ROUND, 2, 1, &keys, &provisioners);

    // Re-encode by hand with a single step vote set
    let mut buf = BytesMut::new();
    agreement.header.marshal(&mut buf);
    buf.extend_from_slice(agreement.signed_votes());
    buf.extend_from_slice(&[1u8]); // varint count = 1
    agreement.votes_per_step[0].marshal(&mut buf).unwrap();

    assert!(matches!(
        Agreement::unmarshal(&mut buf.freeze()),
        Err(WireError::InvalidCount {
            expected: 2,
            actual: 1
        })
    ));
}

#[test]
fn test_truncated_agreement_is_malformed() {
    let (provisioners, keys) = provisioner_fixture(5, 100);
    let agreement = mock_agreement(HASH, ROUND, 2, 1, &keys, &provisioners);

    let mut buf = BytesMut::new();
    agreement.marshal(&mut buf).unwrap();
    let bytes = buf.freeze();

    for cut in [1, 40, 100, bytes.len() - 1] {
        let mut truncated = bytes.slice(..cut);
        assert!(Agreement::unmarshal(&mut truncated).is_err());
    }
}

#[test]
fn test_best_score_roundtrip() {
    let best = BestScore {
        round: ROUND,
        block_hash: HASH,
    };

    let mut buf = BytesMut::new();
    best.marshal(&mut buf);
    let restored = BestScore::unmarshal(&mut buf.freeze()).unwrap();

    assert_eq!(best, restored);
}

#[test]
fn test_candidate_block_roundtrip() {
    let block = candidate_block(10);

    let mut buf = BytesMut::new();
    let message = Message::Candidate(block.clone());
    message.marshal(&mut buf).unwrap();

    let restored = Message::unmarshal(Topic::Candidate, &mut buf.freeze()).unwrap();
    assert_eq!(restored, Message::Candidate(block));
}

#[test]
fn test_message_roundtrip_by_topic() {
    let (_, keys) = provisioner_fixture(2, 100);

    let messages = vec![
        Message::BestScore(BestScore {
            round: ROUND,
            block_hash: HASH,
        }),
        Message::Reduction(signed_vote(&keys[0], ROUND, 1, HASH)),
        Message::GetCandidate(HASH),
        Message::AcceptedBlock {
            round: ROUND,
            block_hash: HASH,
        },
    ];

    for message in messages {
        let mut buf = BytesMut::new();
        message.marshal(&mut buf).unwrap();
        let restored = Message::unmarshal(message.topic(), &mut buf.freeze()).unwrap();
        assert_eq!(message, restored);
    }
}

#[test]
fn test_unknown_topic_discriminant_rejected() {
    assert!(matches!(
        Topic::try_from(0u8),
        Err(WireError::InvalidDiscriminant(0))
    ));
    assert!(matches!(
        Topic::try_from(99u8),
        Err(WireError::InvalidDiscriminant(99))
    ));
    assert_eq!(Topic::try_from(2u8).unwrap(), Topic::Reduction);
}
