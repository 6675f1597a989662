//! The node's consensus key pair.

use sba_crypto::bls::BlsSecretKey;

use crate::provisioners::ProvisionerKey;

/// The BLS key pair this node signs consensus messages with.
#[derive(Debug, Clone)]
pub struct ConsensusKeys {
    /// Signing key
    pub secret: BlsSecretKey,
    /// Wire form of the matching public key
    pub public: ProvisionerKey,
}

impl ConsensusKeys {
    /// Wrap an existing secret key.
    pub fn from_secret(secret: BlsSecretKey) -> Self {
        let public = ProvisionerKey(secret.public_key().to_bytes());
        Self { secret, public }
    }

    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        Self::from_secret(BlsSecretKey::random())
    }

    /// Derive a key pair from a seed. Deterministic; used by tests.
    pub fn from_seed(ikm: &[u8]) -> Result<Self, sba_crypto::CryptoError> {
        Ok(Self::from_secret(BlsSecretKey::from_seed(ikm)?))
    }
}
