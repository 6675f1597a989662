//! Consensus message types and their wire codecs.
//!
//! This module defines the messages exchanged during a round:
//! - [`Reduction`] - a single signed vote for one reduction step
//! - [`StepVotes`] - the aggregated votes of one reduction step
//! - [`Agreement`] - the end-of-reduction broadcast carrying both step vote
//!   sets
//! - [`BestScore`] - the selection outcome that starts reduction
//! - [`Message`] / [`Topic`] - the tagged routing envelope
//!
//! A `StepVotes` keeps its aggregated public key and signature separate from
//! the committee bitset: the bitset cannot represent duplicates, while the
//! same provisioner may hold several committee seats and contribute several
//! votes.

use bytes::{Buf, BufMut};
use num_bigint::BigUint;
use sba_crypto::bls::{BlsPublicKey, BlsSecretKey, BlsSignature, SIGNATURE_SIZE};
use sba_crypto::Hash;
use sba_types::{Block, BlockHeader, Certificate, Transaction};

use crate::header::Header;
use crate::provisioners::ProvisionerKey;
use crate::wire::{self, WireError};

/// Message topics routed over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Topic {
    /// Selection outcome: the highest-scoring candidate hash
    BestScore = 1,
    /// Single signed reduction vote
    Reduction = 2,
    /// End-of-reduction agreement broadcast
    Agreement = 3,
    /// Full candidate block
    Candidate = 4,
    /// Request for a candidate block by hash
    GetCandidate = 5,
    /// Notification that a block was accepted
    AcceptedBlock = 6,
}

impl TryFrom<u8> for Topic {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(Topic::BestScore),
            2 => Ok(Topic::Reduction),
            3 => Ok(Topic::Agreement),
            4 => Ok(Topic::Candidate),
            5 => Ok(Topic::GetCandidate),
            6 => Ok(Topic::AcceptedBlock),
            other => Err(WireError::InvalidDiscriminant(other)),
        }
    }
}

// ============================================================================
// Reduction
// ============================================================================

/// A single reduction vote: a header plus the sender's signature over the
/// signable vote bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reduction {
    /// Message header; `block_hash` is the voted hash
    pub header: Header,
    /// Compressed BLS signature over `(round, step, block_hash)`
    pub signed_hash: [u8; SIGNATURE_SIZE],
}

impl Reduction {
    /// Create and sign a reduction vote with the given secret key.
    pub fn new_signed(sk: &BlsSecretKey, round: u64, step: u8, block_hash: Hash) -> Self {
        let sender = ProvisionerKey(sk.public_key().to_bytes());
        let header = Header::new(sender, round, step, block_hash);
        let signed_hash = sk.sign(&header.signable_vote_bytes()).to_bytes();
        Self {
            header,
            signed_hash,
        }
    }

    /// Marshal: header followed by the fixed-length signature.
    pub fn marshal(&self, buf: &mut impl BufMut) {
        self.header.marshal(buf);
        wire::write_array(buf, &self.signed_hash);
    }

    /// Unmarshal a reduction vote.
    pub fn unmarshal(buf: &mut impl Buf) -> Result<Self, WireError> {
        let header = Header::unmarshal(buf)?;
        let signed_hash = wire::read_array(buf)?;
        Ok(Self {
            header,
            signed_hash,
        })
    }

    /// Marshal a varint-prefixed list of reduction votes.
    pub fn marshal_vote_set(buf: &mut impl BufMut, votes: &[Reduction]) {
        wire::write_varint(buf, votes.len() as u64);
        for vote in votes {
            vote.marshal(buf);
        }
    }

    /// Unmarshal a varint-prefixed list of reduction votes.
    pub fn unmarshal_vote_set(buf: &mut impl Buf) -> Result<Vec<Reduction>, WireError> {
        let len = wire::read_varint(buf)?;
        let mut votes = Vec::with_capacity(len.min(1024) as usize);
        for _ in 0..len {
            votes.push(Reduction::unmarshal(buf)?);
        }
        Ok(votes)
    }
}

// ============================================================================
// StepVotes
// ============================================================================

/// Errors from vote aggregation into a `StepVotes`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepVotesError {
    /// A vote for a different step was fed into the aggregation
    #[error("mismatched step in aggregating vote set: expected {expected}, got {got}")]
    StepMismatch {
        /// Step this vote set aggregates
        expected: u8,
        /// Step carried by the offending vote
        got: u8,
    },

    /// Key or signature bytes failed to decode or aggregate
    #[error("vote aggregation failed: {0}")]
    Crypto(String),

    /// Operation requires a non-empty vote set
    #[error("empty step votes")]
    Empty,
}

/// The aggregated votes for one reduction step.
///
/// `apk` is the aggregate of exactly the public keys whose committee
/// positions are set in `bitset`; `signature` is the aggregate of the
/// corresponding individual signatures over the same signable vote bytes.
/// A freshly created value is *empty*; the first added vote initializes the
/// aggregates and pins the step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepVotes {
    apk: Option<BlsPublicKey>,
    signature: Option<BlsSignature>,
    /// Bitset of the voters' committee positions
    pub bitset: u64,
    /// The reduction step these votes belong to
    pub step: u8,
}

impl Default for StepVotes {
    fn default() -> Self {
        Self::new()
    }
}

impl StepVotes {
    /// Create an empty vote set.
    pub fn new() -> Self {
        Self {
            apk: None,
            signature: None,
            bitset: 0,
            step: 0,
        }
    }

    /// Whether this vote set represents a failed convergence attempt.
    pub fn is_empty(&self) -> bool {
        self.apk.is_none()
    }

    /// The aggregated public key, if any vote was added.
    pub fn apk(&self) -> Option<&BlsPublicKey> {
        self.apk.as_ref()
    }

    /// The aggregated signature, if any vote was added.
    pub fn signature(&self) -> Option<&BlsSignature> {
        self.signature.as_ref()
    }

    /// Add a vote.
    ///
    /// The first vote initializes the aggregates from the sender key and
    /// signature and pins the step; subsequent votes must carry the same
    /// step and are aggregated in. A step mismatch indicates a routing bug
    /// upstream and poisons the aggregation.
    pub fn add(
        &mut self,
        signature: &[u8; SIGNATURE_SIZE],
        sender: &ProvisionerKey,
        step: u8,
    ) -> Result<(), StepVotesError> {
        let pk = sender
            .to_public_key()
            .map_err(|e| StepVotesError::Crypto(e.to_string()))?;
        let sig = BlsSignature::from_bytes(signature)
            .map_err(|e| StepVotesError::Crypto(e.to_string()))?;

        if self.apk.is_none() {
            self.step = step;
            self.apk = Some(pk);
            self.signature = Some(sig);
            return Ok(());
        }

        if step != self.step {
            return Err(StepVotesError::StepMismatch {
                expected: self.step,
                got: step,
            });
        }

        // apk and signature are always set together
        let apk = self
            .apk
            .as_ref()
            .expect("checked above")
            .aggregate_with(&pk)
            .map_err(|e| StepVotesError::Crypto(e.to_string()))?;
        let agg = self
            .signature
            .as_ref()
            .expect("signature set with apk")
            .aggregate_with(&sig)
            .map_err(|e| StepVotesError::Crypto(e.to_string()))?;
        self.apk = Some(apk);
        self.signature = Some(agg);
        Ok(())
    }

    /// Marshal: `[apk varbytes][bitset u64 LE][signature fixed-length]`.
    ///
    /// Empty vote sets have no wire form.
    pub fn marshal(&self, buf: &mut impl BufMut) -> Result<(), StepVotesError> {
        let (apk, sig) = match (&self.apk, &self.signature) {
            (Some(apk), Some(sig)) => (apk, sig),
            _ => return Err(StepVotesError::Empty),
        };
        wire::write_varbytes(buf, &apk.to_bytes());
        wire::write_u64_le(buf, self.bitset);
        wire::write_array(buf, &sig.to_bytes());
        Ok(())
    }

    /// Unmarshal a single step's votes. The step field is not on the wire;
    /// it is recomputed from the enclosing agreement's header.
    pub fn unmarshal(buf: &mut impl Buf) -> Result<Self, WireError> {
        let apk_bytes = wire::read_varbytes(buf)?;
        let apk = BlsPublicKey::from_slice(&apk_bytes).map_err(|_| WireError::InvalidKey)?;
        let bitset = wire::read_u64_le(buf)?;
        let sig_bytes: [u8; SIGNATURE_SIZE] = wire::read_array(buf)?;
        let signature =
            BlsSignature::from_bytes(&sig_bytes).map_err(|_| WireError::InvalidKey)?;
        Ok(Self {
            apk: Some(apk),
            signature: Some(signature),
            bitset,
            step: 0,
        })
    }
}

// ============================================================================
// Agreement
// ============================================================================

/// The message created at the end of the two-step reduction.
///
/// Carries the sender's own signed vote plus the aggregated vote sets of
/// both reduction steps: `votes_per_step[0]` belongs to `header.step - 1`,
/// `votes_per_step[1]` to `header.step`.
#[derive(Debug, Clone)]
pub struct Agreement {
    /// Message header; `step` is the second reduction step
    pub header: Header,
    signed_votes: [u8; SIGNATURE_SIZE],
    /// Aggregated votes of the two reduction steps
    pub votes_per_step: [StepVotes; 2],
    repr: BigUint,
}

impl Agreement {
    /// Create an empty agreement for the given header.
    pub fn new(header: Header) -> Self {
        Self {
            header,
            signed_votes: [0u8; SIGNATURE_SIZE],
            votes_per_step: [StepVotes::new(), StepVotes::new()],
            repr: BigUint::default(),
        }
    }

    /// Attach the sender's signature over the signable vote bytes.
    ///
    /// Also derives `repr`, the big-integer form of the signature used as a
    /// total-ordering key for deterministic tie-breaking.
    pub fn set_signature(&mut self, signed_votes: [u8; SIGNATURE_SIZE]) {
        self.repr = BigUint::from_bytes_be(&signed_votes);
        self.signed_votes = signed_votes;
    }

    /// Sign the agreement with the sender's secret key.
    pub fn sign(&mut self, sk: &BlsSecretKey) {
        let sig = sk.sign(&self.header.signable_vote_bytes());
        self.set_signature(sig.to_bytes());
    }

    /// The sender's signature over the signable vote bytes.
    pub fn signed_votes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.signed_votes
    }

    /// The big-integer ordering key derived from `signed_votes`.
    pub fn repr(&self) -> &BigUint {
        &self.repr
    }

    /// The sender of the agreement.
    pub fn sender(&self) -> &ProvisionerKey {
        &self.header.sender
    }

    /// Compare two agreements by their ordering key.
    pub fn cmp_repr(&self, other: &Agreement) -> std::cmp::Ordering {
        self.repr.cmp(&other.repr)
    }

    /// Build the certificate the chain stores with the accepted block.
    ///
    /// Requires both step vote sets to be non-empty.
    pub fn generate_certificate(&self) -> Result<Certificate, StepVotesError> {
        let sig_one = self.votes_per_step[0]
            .signature()
            .ok_or(StepVotesError::Empty)?;
        let sig_two = self.votes_per_step[1]
            .signature()
            .ok_or(StepVotesError::Empty)?;
        Ok(Certificate {
            step_one_sig: sig_one.to_bytes().to_vec(),
            step_two_sig: sig_two.to_bytes().to_vec(),
            step: self.header.step,
            step_one_committee: self.votes_per_step[0].bitset,
            step_two_committee: self.votes_per_step[1].bitset,
        })
    }

    /// Marshal: header, signed votes, then the two step vote sets prefixed
    /// by their count.
    pub fn marshal(&self, buf: &mut impl BufMut) -> Result<(), StepVotesError> {
        self.header.marshal(buf);
        wire::write_array(buf, &self.signed_votes);
        wire::write_varint(buf, self.votes_per_step.len() as u64);
        for votes in &self.votes_per_step {
            votes.marshal(buf)?;
        }
        Ok(())
    }

    /// Unmarshal an agreement.
    ///
    /// An agreement always carries exactly two step vote sets, one per
    /// reduction step; any other count is a malformed message. The step
    /// fields are recomputed from the header.
    pub fn unmarshal(buf: &mut impl Buf) -> Result<Self, WireError> {
        let header = Header::unmarshal(buf)?;
        let signed_votes: [u8; SIGNATURE_SIZE] = wire::read_array(buf)?;

        let count = wire::read_varint(buf)?;
        if count != 2 {
            return Err(WireError::InvalidCount {
                expected: 2,
                actual: count,
            });
        }

        let mut first = StepVotes::unmarshal(buf)?;
        let mut second = StepVotes::unmarshal(buf)?;
        first.step = header.step.wrapping_sub(1);
        second.step = header.step;

        let mut agreement = Self::new(header);
        agreement.set_signature(signed_votes);
        agreement.votes_per_step = [first, second];
        Ok(agreement)
    }
}

impl PartialEq for Agreement {
    /// Two agreements are the same message iff their ordering keys match;
    /// the key is derived from the sender's unique signature.
    fn eq(&self, other: &Self) -> bool {
        self.repr == other.repr
    }
}

impl Eq for Agreement {}

// ============================================================================
// BestScore and routing envelope
// ============================================================================

/// Selection outcome: the candidate hash that won block generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestScore {
    /// Round the selection ran for
    pub round: u64,
    /// Hash of the highest-scoring candidate
    pub block_hash: Hash,
}

impl BestScore {
    /// Marshal: `[round u64 LE][hash 32]`.
    pub fn marshal(&self, buf: &mut impl BufMut) {
        wire::write_u64_le(buf, self.round);
        wire::write_array(buf, &self.block_hash);
    }

    /// Unmarshal a selection outcome.
    pub fn unmarshal(buf: &mut impl Buf) -> Result<Self, WireError> {
        let round = wire::read_u64_le(buf)?;
        let block_hash = wire::read_array(buf)?;
        Ok(Self { round, block_hash })
    }
}

/// A consensus message tagged by its topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Selection outcome
    BestScore(BestScore),
    /// Single reduction vote
    Reduction(Reduction),
    /// Agreement broadcast
    Agreement(Agreement),
    /// Full candidate block
    Candidate(Block),
    /// Candidate request by hash
    GetCandidate(Hash),
    /// Block accepted at a height
    AcceptedBlock {
        /// Accepted round
        round: u64,
        /// Accepted block hash
        block_hash: Hash,
    },
}

impl Message {
    /// The topic this message travels on.
    pub fn topic(&self) -> Topic {
        match self {
            Message::BestScore(_) => Topic::BestScore,
            Message::Reduction(_) => Topic::Reduction,
            Message::Agreement(_) => Topic::Agreement,
            Message::Candidate(_) => Topic::Candidate,
            Message::GetCandidate(_) => Topic::GetCandidate,
            Message::AcceptedBlock { .. } => Topic::AcceptedBlock,
        }
    }

    /// Marshal the payload (the topic travels out of band).
    pub fn marshal(&self, buf: &mut impl BufMut) -> Result<(), StepVotesError> {
        match self {
            Message::BestScore(bs) => bs.marshal(buf),
            Message::Reduction(r) => r.marshal(buf),
            Message::Agreement(a) => a.marshal(buf)?,
            Message::Candidate(block) => marshal_candidate(buf, block),
            Message::GetCandidate(hash) => wire::write_array(buf, hash),
            Message::AcceptedBlock { round, block_hash } => {
                wire::write_u64_le(buf, *round);
                wire::write_array(buf, block_hash);
            }
        }
        Ok(())
    }

    /// Unmarshal a payload for the given topic.
    pub fn unmarshal(topic: Topic, buf: &mut impl Buf) -> Result<Self, WireError> {
        match topic {
            Topic::BestScore => Ok(Message::BestScore(BestScore::unmarshal(buf)?)),
            Topic::Reduction => Ok(Message::Reduction(Reduction::unmarshal(buf)?)),
            Topic::Agreement => Ok(Message::Agreement(Agreement::unmarshal(buf)?)),
            Topic::Candidate => Ok(Message::Candidate(unmarshal_candidate(buf)?)),
            Topic::GetCandidate => Ok(Message::GetCandidate(wire::read_array(buf)?)),
            Topic::AcceptedBlock => Ok(Message::AcceptedBlock {
                round: wire::read_u64_le(buf)?,
                block_hash: wire::read_array(buf)?,
            }),
        }
    }
}

// ============================================================================
// Candidate block codec
// ============================================================================

/// Marshal a candidate block.
pub fn marshal_candidate(buf: &mut impl BufMut, block: &Block) {
    let h = &block.header;
    wire::write_u8(buf, h.version);
    wire::write_u64_le(buf, h.height);
    wire::write_i64_le(buf, h.timestamp);
    wire::write_array(buf, &h.prev_block_hash);
    wire::write_varbytes(buf, &h.seed);
    wire::write_varbytes(buf, &h.generator_bls_pubkey);
    wire::write_array(buf, &h.tx_root);

    wire::write_varint(buf, block.txs.len() as u64);
    for tx in &block.txs {
        wire::write_varbytes(buf, &tx.payload);
    }

    wire::write_varbytes(buf, &block.cert.step_one_sig);
    wire::write_varbytes(buf, &block.cert.step_two_sig);
    wire::write_u8(buf, block.cert.step);
    wire::write_u64_le(buf, block.cert.step_one_committee);
    wire::write_u64_le(buf, block.cert.step_two_committee);
}

/// Unmarshal a candidate block.
pub fn unmarshal_candidate(buf: &mut impl Buf) -> Result<Block, WireError> {
    let header = BlockHeader {
        version: wire::read_u8(buf)?,
        height: wire::read_u64_le(buf)?,
        timestamp: wire::read_i64_le(buf)?,
        prev_block_hash: wire::read_array(buf)?,
        seed: wire::read_varbytes(buf)?,
        generator_bls_pubkey: wire::read_varbytes(buf)?,
        tx_root: wire::read_array(buf)?,
    };

    let n_txs = wire::read_varint(buf)?;
    let mut txs = Vec::with_capacity(n_txs.min(4096) as usize);
    for _ in 0..n_txs {
        txs.push(Transaction::new(wire::read_varbytes(buf)?));
    }

    let cert = Certificate {
        step_one_sig: wire::read_varbytes(buf)?,
        step_two_sig: wire::read_varbytes(buf)?,
        step: wire::read_u8(buf)?,
        step_one_committee: wire::read_u64_le(buf)?,
        step_two_committee: wire::read_u64_le(buf)?,
    };

    Ok(Block { header, txs, cert })
}
