//! Consensus message header and the signable vote digest.
//!
//! Every consensus message opens with the same header: the sender's BLS key,
//! the round, the step, and the block hash being voted on. What a vote
//! signature covers is narrower — the canonical encoding of
//! `(round, step, block_hash)` only. The sender key is excluded so that
//! signatures from different committee members over the same vote aggregate
//! into one.

use bytes::{Buf, BufMut};
use sba_crypto::bls::{BlsPublicKey, BlsSignature, SIGNATURE_SIZE};
use sba_crypto::Hash;

use crate::provisioners::ProvisionerKey;
use crate::wire::{self, WireError};

/// Errors from header signature checks
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// The sender key bytes do not decode to a valid public key
    #[error("invalid sender key: {0}")]
    InvalidSender(String),

    /// The signature bytes do not decode to a valid signature
    #[error("invalid signature encoding: {0}")]
    InvalidEncoding(String),

    /// The signature does not verify over the signable vote bytes
    #[error("signature verification failed")]
    VerificationFailed,
}

/// Common header of all consensus messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// BLS public key of the message sender
    pub sender: ProvisionerKey,
    /// Round (block height) the message belongs to
    pub round: u64,
    /// Step within the round
    pub step: u8,
    /// Block hash being voted on; all zeros when no block converged
    pub block_hash: Hash,
}

impl Header {
    /// Create a header.
    pub fn new(sender: ProvisionerKey, round: u64, step: u8, block_hash: Hash) -> Self {
        Self {
            sender,
            round,
            step,
            block_hash,
        }
    }

    /// Canonical bytes a vote signature covers: `(round, step, block_hash)`,
    /// sender excluded.
    pub fn signable_vote_bytes(&self) -> Vec<u8> {
        signable_vote_bytes(self.round, self.step, &self.block_hash)
    }

    /// Verify a single-signer vote signature made by this header's sender.
    pub fn verify_vote_signature(
        &self,
        signature: &[u8; SIGNATURE_SIZE],
    ) -> Result<(), SignatureError> {
        let pk = self
            .sender
            .to_public_key()
            .map_err(|e| SignatureError::InvalidSender(e.to_string()))?;
        let sig = BlsSignature::from_bytes(signature)
            .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;

        if !sig.verify(&self.signable_vote_bytes(), &pk) {
            return Err(SignatureError::VerificationFailed);
        }
        Ok(())
    }

    /// Marshal the header: `[sender varbytes][round u64 LE][step u8][hash 32]`.
    pub fn marshal(&self, buf: &mut impl BufMut) {
        wire::write_varbytes(buf, self.sender.as_bytes());
        wire::write_u64_le(buf, self.round);
        wire::write_u8(buf, self.step);
        wire::write_array(buf, &self.block_hash);
    }

    /// Unmarshal a header.
    pub fn unmarshal(buf: &mut impl Buf) -> Result<Self, WireError> {
        let sender_bytes = wire::read_varbytes(buf)?;
        let sender = ProvisionerKey::from_slice(&sender_bytes).map_err(|_| {
            WireError::InvalidLength {
                expected: sba_crypto::bls::PUBLIC_KEY_SIZE,
                actual: sender_bytes.len(),
            }
        })?;
        let round = wire::read_u64_le(buf)?;
        let step = wire::read_u8(buf)?;
        let block_hash = wire::read_array(buf)?;
        Ok(Self {
            sender,
            round,
            step,
            block_hash,
        })
    }
}

/// Canonical signable vote bytes for `(round, step, block_hash)`.
pub fn signable_vote_bytes(round: u64, step: u8, block_hash: &Hash) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + 1 + 32);
    bytes.extend_from_slice(&round.to_le_bytes());
    bytes.push(step);
    bytes.extend_from_slice(block_hash);
    bytes
}

/// Verify an aggregated vote signature against a reconstructed APK.
///
/// Used by agreement verification after rebuilding the aggregate public key
/// from the sub-committee a bitset selects.
pub fn verify_aggregate_signature(
    round: u64,
    step: u8,
    block_hash: &Hash,
    apk: &BlsPublicKey,
    signature: &BlsSignature,
) -> Result<(), SignatureError> {
    if !signature.verify(&signable_vote_bytes(round, step, block_hash), apk) {
        return Err(SignatureError::VerificationFailed);
    }
    Ok(())
}
