//! # BLS12-381 Signatures for Consensus
//!
//! This module provides BLS (Boneh-Lynn-Shacham) signatures using the BLS12-381
//! curve. BLS signatures are used by the consensus core for their key property:
//! **signature aggregation** - the votes of a whole committee combine into a
//! single signature that verifies against the aggregated public keys.
//!
//! The `min_sig` variant is used: public keys are 96-byte compressed G2 points
//! (matching the provisioner key size on the wire) and signatures are 48-byte
//! compressed G1 points.
//!
//! ## Key Types
//!
//! - `BlsSecretKey` - Secret key for signing (32-byte scalar)
//! - `BlsPublicKey` - Public key (96 bytes, G2 point), also used as an
//!   aggregated public key ("APK") after aggregation
//! - `BlsSignature` - Signature (48 bytes, G1 point)
//!
//! ## Example
//!
//! ```rust
//! use sba_crypto::bls::{BlsSecretKey, BlsPublicKey, BlsSignature};
//!
//! // Single signature
//! let sk = BlsSecretKey::random();
//! let pk = sk.public_key();
//! let sig = sk.sign(b"block hash");
//! assert!(sig.verify(b"block hash", &pk));
//!
//! // Aggregate signatures (for consensus)
//! let keys: Vec<_> = (0..3).map(|_| BlsSecretKey::random()).collect();
//! let pubkeys: Vec<_> = keys.iter().map(|k| k.public_key()).collect();
//! let message = b"consensus message";
//!
//! let signatures: Vec<_> = keys.iter().map(|k| k.sign(message)).collect();
//! let sig_refs: Vec<_> = signatures.iter().collect();
//! let pk_refs: Vec<_> = pubkeys.iter().collect();
//!
//! let aggregate = BlsSignature::aggregate(&sig_refs).unwrap();
//! let apk = BlsPublicKey::aggregate(&pk_refs).unwrap();
//! assert!(aggregate.verify(message, &apk));
//! ```

use crate::{CryptoError, Result};
use blst::min_sig::{AggregatePublicKey, AggregateSignature, PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Size of a compressed BLS public key in bytes (G2 point).
pub const PUBLIC_KEY_SIZE: usize = 96;

/// Size of a compressed BLS signature in bytes (G1 point).
pub const SIGNATURE_SIZE: usize = 48;

/// Domain separation tag for consensus vote signatures.
const DST_VOTE: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_SBA_VOTE_";

// ============================================================================
// BLS Secret Key
// ============================================================================

/// BLS secret key
///
/// A 32-byte scalar used for signing. Must be kept secret.
pub struct BlsSecretKey {
    inner: SecretKey,
}

impl BlsSecretKey {
    /// Generate a random BLS secret key using a cryptographically secure RNG.
    pub fn random() -> Self {
        let mut ikm = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut ikm);
        let sk = SecretKey::key_gen(&ikm, &[]).expect("key generation failed");
        Self { inner: sk }
    }

    /// Create a BLS secret key from a seed.
    ///
    /// Uses BLS key derivation (IKM -> secret key). Deterministic: the same
    /// seed always produces the same key, which makes it suitable for test
    /// fixtures.
    ///
    /// # Arguments
    ///
    /// * `ikm` - Input keying material (at least 32 bytes)
    pub fn from_seed(ikm: &[u8]) -> Result<Self> {
        if ikm.len() < 32 {
            return Err(CryptoError::InvalidLength {
                expected: 32,
                actual: ikm.len(),
            });
        }
        let sk = SecretKey::key_gen(ikm, &[])
            .map_err(|_| CryptoError::InvalidSecretKey("key generation failed".to_string()))?;
        Ok(Self { inner: sk })
    }

    /// Create a BLS secret key from raw bytes.
    ///
    /// # Arguments
    ///
    /// * `bytes` - 32-byte scalar in big-endian format
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let sk = SecretKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidSecretKey(format!("{:?}", e)))?;
        Ok(Self { inner: sk })
    }

    /// Get the raw bytes of the secret key.
    ///
    /// # Security
    ///
    /// Be careful with the returned bytes - they are the secret key!
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    /// Derive the public key from this secret key.
    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey {
            inner: self.inner.sk_to_pk(),
        }
    }

    /// Sign a message.
    ///
    /// All consensus votes are signed under the same domain tag; replay across
    /// rounds and steps is prevented by the signed payload itself, which
    /// embeds both.
    pub fn sign(&self, message: &[u8]) -> BlsSignature {
        BlsSignature {
            inner: self.inner.sign(message, DST_VOTE, &[]),
        }
    }
}

impl Clone for BlsSecretKey {
    fn clone(&self) -> Self {
        let bytes = self.to_bytes();
        Self::from_bytes(&bytes).expect("cloning valid key should succeed")
    }
}

impl std::fmt::Debug for BlsSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlsSecretKey")
            .field("public_key", &self.public_key().to_hex())
            .finish()
    }
}

// ============================================================================
// BLS Public Key
// ============================================================================

/// BLS public key (96 bytes, G2 point)
///
/// Used for verifying signatures and can be aggregated with other public keys
/// into an aggregated public key (APK). Implements `Ord` over the compressed
/// bytes so key sets have a deterministic canonical ordering.
#[derive(Clone)]
pub struct BlsPublicKey {
    inner: PublicKey,
}

impl BlsPublicKey {
    /// Create a public key from compressed bytes (96 bytes).
    ///
    /// Validates that the bytes represent a valid point on the curve and are
    /// in canonical form.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<Self> {
        let pk = PublicKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(format!("{:?}", e)))?;

        // Validate canonical encoding
        let reencoded = pk.to_bytes();
        if reencoded != *bytes {
            return Err(CryptoError::InvalidPublicKey(
                "non-canonical public key encoding".to_string(),
            ));
        }

        Ok(Self { inner: pk })
    }

    /// Create a public key from a variable-length slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidLength {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; PUBLIC_KEY_SIZE];
        arr.copy_from_slice(bytes);
        Self::from_bytes(&arr)
    }

    /// Create a public key from a hex string.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let bytes = hex::decode(hex)?;
        Self::from_slice(&bytes)
    }

    /// Get the compressed public key bytes (96 bytes).
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.inner.to_bytes()
    }

    /// Get the hex-encoded public key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Aggregate multiple public keys into one.
    ///
    /// The resulting key verifies an aggregated signature created from
    /// signatures by the corresponding secret keys over the same message.
    /// Aggregation is commutative, so input order does not affect the result.
    pub fn aggregate(pubkeys: &[&BlsPublicKey]) -> Result<Self> {
        if pubkeys.is_empty() {
            return Err(CryptoError::BlsError(
                "cannot aggregate empty list".to_string(),
            ));
        }

        let pks: Vec<&PublicKey> = pubkeys.iter().map(|pk| &pk.inner).collect();
        let agg = AggregatePublicKey::aggregate(&pks, false)
            .map_err(|e| CryptoError::BlsError(format!("aggregation failed: {:?}", e)))?;

        Ok(Self {
            inner: agg.to_public_key(),
        })
    }

    /// Aggregate another public key into this one, returning the new APK.
    ///
    /// Used when votes arrive one at a time and the APK grows incrementally.
    pub fn aggregate_with(&self, other: &BlsPublicKey) -> Result<Self> {
        Self::aggregate(&[self, other])
    }
}

impl PartialEq for BlsPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsPublicKey {}

impl PartialOrd for BlsPublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlsPublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl std::hash::Hash for BlsPublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl std::fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlsPublicKey")
            .field("bytes", &self.to_hex())
            .finish()
    }
}

impl Serialize for BlsPublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bytes = self.to_bytes();
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            serializer.serialize_bytes(&bytes)
        }
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            BlsPublicKey::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            BlsPublicKey::from_slice(&bytes).map_err(serde::de::Error::custom)
        }
    }
}

// ============================================================================
// BLS Signature
// ============================================================================

/// BLS signature (48 bytes, G1 point)
///
/// Can be aggregated with other signatures over the same message for
/// efficient verification against the aggregated public keys.
#[derive(Clone)]
pub struct BlsSignature {
    inner: Signature,
}

impl BlsSignature {
    /// Create a signature from compressed bytes (48 bytes).
    ///
    /// Validates canonical encoding to prevent malleability. The bytes are
    /// parsed into an owned point; verification never reuses caller buffers.
    pub fn from_bytes(bytes: &[u8; SIGNATURE_SIZE]) -> Result<Self> {
        let sig = Signature::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidSignature(format!("{:?}", e)))?;

        // Validate canonical encoding to prevent malleability
        let reencoded = sig.to_bytes();
        if reencoded != *bytes {
            return Err(CryptoError::InvalidSignature(
                "non-canonical signature encoding".to_string(),
            ));
        }

        Ok(Self { inner: sig })
    }

    /// Create a signature from a variable-length slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidLength {
                expected: SIGNATURE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; SIGNATURE_SIZE];
        arr.copy_from_slice(bytes);
        Self::from_bytes(&arr)
    }

    /// Get the compressed signature bytes (48 bytes).
    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        self.inner.to_bytes()
    }

    /// Get the hex-encoded signature.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Verify the signature against a message and public key.
    ///
    /// The public key may be a single signer's key or an aggregated key, in
    /// which case the signature must be the matching aggregate over the same
    /// message.
    pub fn verify(&self, message: &[u8], public_key: &BlsPublicKey) -> bool {
        let result = self
            .inner
            .verify(true, message, DST_VOTE, &[], &public_key.inner, true);
        result == BLST_ERROR::BLST_SUCCESS
    }

    /// Aggregate multiple signatures into one.
    ///
    /// All signatures must be over the SAME message for aggregation to be
    /// meaningful. The result verifies against the aggregate of the signers'
    /// public keys.
    pub fn aggregate(signatures: &[&BlsSignature]) -> Result<Self> {
        if signatures.is_empty() {
            return Err(CryptoError::BlsError(
                "cannot aggregate empty list".to_string(),
            ));
        }

        let sigs: Vec<&Signature> = signatures.iter().map(|s| &s.inner).collect();
        let agg = AggregateSignature::aggregate(&sigs, false)
            .map_err(|e| CryptoError::BlsError(format!("aggregation failed: {:?}", e)))?;

        Ok(Self {
            inner: agg.to_signature(),
        })
    }

    /// Aggregate another signature into this one, returning the new aggregate.
    pub fn aggregate_with(&self, other: &BlsSignature) -> Result<Self> {
        Self::aggregate(&[self, other])
    }

    /// Verify an aggregated signature against multiple public keys.
    ///
    /// All signers must have signed the SAME message for this to verify.
    pub fn verify_aggregate(&self, message: &[u8], public_keys: &[&BlsPublicKey]) -> bool {
        let apk = match BlsPublicKey::aggregate(public_keys) {
            Ok(apk) => apk,
            Err(_) => return false,
        };
        self.verify(message, &apk)
    }
}

impl PartialEq for BlsSignature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for BlsSignature {}

impl std::fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlsSignature")
            .field("bytes", &self.to_hex())
            .finish()
    }
}

impl Serialize for BlsSignature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let bytes = self.to_bytes();
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            serializer.serialize_bytes(&bytes)
        }
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            let s = s.strip_prefix("0x").unwrap_or(&s);
            let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
            BlsSignature::from_slice(&bytes).map_err(serde::de::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            BlsSignature::from_slice(&bytes).map_err(serde::de::Error::custom)
        }
    }
}
