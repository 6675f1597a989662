//! # SBA Crypto
//!
//! Cryptographic primitives for the SBA consensus core.
//!
//! This crate provides:
//! - **SHA-3-256 hashing** - sortition seeds and block hashing
//! - **BLS12-381 signatures** - aggregatable signatures for consensus votes
//!
//! ## Example
//!
//! ```rust
//! use sba_crypto::{sha3_256, bls};
//!
//! // Hash some data
//! let hash = sha3_256(b"hello world");
//!
//! // Generate a BLS key and sign
//! let sk = bls::BlsSecretKey::random();
//! let pk = sk.public_key();
//! let sig = sk.sign(b"vote bytes");
//! assert!(sig.verify(b"vote bytes", &pk));
//! ```

pub mod bls;
pub mod hash;

// Re-export commonly used items
pub use bls::{BlsPublicKey, BlsSecretKey, BlsSignature, PUBLIC_KEY_SIZE, SIGNATURE_SIZE};
pub use hash::{sha3_256, sha3_256_concat, Hasher};

/// Common type alias for a 32-byte hash
pub type Hash = [u8; 32];

/// Error types for cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Invalid secret key bytes
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),

    /// Invalid public key bytes
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid signature bytes
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// BLS operation failed
    #[error("BLS operation failed: {0}")]
    BlsError(String),

    /// Invalid input length
    #[error("invalid input length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex decoding error
    #[error("hex decoding error: {0}")]
    HexError(String),
}

impl From<hex::FromHexError> for CryptoError {
    fn from(e: hex::FromHexError) -> Self {
        CryptoError::HexError(e.to_string())
    }
}

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha3_256_basic() {
        let hash = sha3_256(b"abc");
        assert_eq!(hash.len(), 32);
        // Known SHA3-256 hash of "abc"
        assert_eq!(
            hex::encode(hash),
            "3a985da74fe225b2045c172d6bd390bd855f086e3e9d525b46bfe24511431532"
        );
    }

    #[test]
    fn test_bls_sign_verify() {
        let sk = bls::BlsSecretKey::random();
        let pk = sk.public_key();
        let message = b"test message";

        let signature = sk.sign(message);
        assert!(signature.verify(message, &pk));
    }

    #[test]
    fn test_bls_aggregate() {
        let keys: Vec<_> = (0..3).map(|_| bls::BlsSecretKey::random()).collect();
        let pubkeys: Vec<_> = keys.iter().map(|k| k.public_key()).collect();
        let message = b"consensus message";

        let signatures: Vec<_> = keys.iter().map(|k| k.sign(message)).collect();
        let sig_refs: Vec<_> = signatures.iter().collect();

        let aggregate = bls::BlsSignature::aggregate(&sig_refs).unwrap();
        let pk_refs: Vec<_> = pubkeys.iter().collect();
        let apk = bls::BlsPublicKey::aggregate(&pk_refs).unwrap();
        assert!(aggregate.verify(message, &apk));
    }
}
