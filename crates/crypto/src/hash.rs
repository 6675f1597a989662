//! # SHA-3-256 Hashing Utilities
//!
//! This module provides SHA-3-256 hashing functions used across the consensus
//! core for sortition seeds, signable vote digests, and block hashing.
//!
//! ## Functions
//!
//! - `sha3_256` - Hash a single byte slice
//! - `sha3_256_concat` - Hash multiple byte slices concatenated
//!
//! ## Streaming Hasher
//!
//! For incremental data, use the `Hasher` struct:
//!
//! ```rust
//! use sba_crypto::hash::Hasher;
//!
//! let mut hasher = Hasher::new();
//! hasher.update(b"hello");
//! hasher.update(b" world");
//! let hash = hasher.finalize();
//! ```

use sha3::{Digest, Sha3_256};

/// Compute the SHA-3-256 hash of the input data.
///
/// # Arguments
///
/// * `data` - The byte slice to hash
///
/// # Returns
///
/// A 32-byte array containing the SHA-3-256 hash
#[inline]
pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the SHA-3-256 hash of multiple concatenated inputs.
///
/// This is more efficient than manually concatenating the inputs and then
/// hashing, as it avoids allocating a temporary buffer.
///
/// # Arguments
///
/// * `parts` - A slice of byte slices to hash together
#[inline]
pub fn sha3_256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// A streaming SHA-3-256 hasher for incremental hashing.
///
/// Use this when the data to hash arrives in chunks, such as when building a
/// sortition seed from round, step, and counter components.
#[derive(Clone)]
pub struct Hasher {
    inner: Sha3_256,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher {
    /// Create a new SHA-3-256 hasher.
    #[inline]
    pub fn new() -> Self {
        Self {
            inner: Sha3_256::new(),
        }
    }

    /// Update the hasher with additional data.
    ///
    /// This can be called multiple times to feed data incrementally.
    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Update the hasher with multiple data chunks.
    #[inline]
    pub fn update_many(&mut self, parts: &[&[u8]]) {
        for part in parts {
            self.inner.update(part);
        }
    }

    /// Finalize the hasher and return the hash.
    ///
    /// This consumes the hasher. To continue hashing, create a new `Hasher`.
    #[inline]
    pub fn finalize(self) -> [u8; 32] {
        self.inner.finalize().into()
    }
}

impl std::fmt::Debug for Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hasher").finish_non_exhaustive()
    }
}
