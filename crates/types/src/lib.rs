//! # SBA Types
//!
//! Chain data types shared between the consensus core and the embedding node:
//! candidate blocks, block headers, transactions, and the certificate a
//! finished round attaches to its winning block.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod block;

pub use block::{Block, BlockHeader, Certificate, Transaction};

/// Common type alias for a 32-byte hash
pub type Hash = sba_crypto::Hash;

/// The 32-byte all-zero block hash denoting "no convergence".
pub const EMPTY_HASH: Hash = [0u8; 32];
