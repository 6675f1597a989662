//! # SBA Consensus
//!
//! Segregated Byzantine Agreement consensus core for a proof-of-stake chain.
//!
//! For each block height (a *round*), a winning block is selected from the
//! candidates proposed by elected generators through three chained
//! sub-protocols, executed in lock-step by stake-weighted committees drawn
//! per `(round, step)`:
//!
//! ```text
//! Round r (height r):
//!
//! ┌──────────────┐
//! │  SELECTION   │  external: generators emit scored candidates,
//! │  (external)  │  peers pick the highest score -> BestScore(hash)
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │ REDUCTION 1  │  committee(r, s) votes on the selection winner;
//! │  (step s)    │  votes aggregate into StepVotes; quorum = 75%
//! └──────┬───────┘
//!        │ converged hash (or empty)
//!        ▼
//! ┌──────────────┐
//! │ REDUCTION 2  │  committee(r, s+1) ratifies the step-1 outcome;
//! │  (step s+1)  │  both converged -> Agreement{StepVotes x 2}
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │  AGREEMENT   │  runs from round start, committee size 64;
//! │              │  quorum of verified agreements for one hash
//! └──────┬───────┘  decides the round
//!        │
//!        ▼
//!   accepted block + certificate
//! ```
//!
//! The core is transport-, storage- and wallet-agnostic: networking, the
//! mempool, block persistence and candidate verification are collaborator
//! traits implemented by the embedding node. Failed convergence is a
//! first-class outcome, not an error: a step or round that times out
//! produces the empty hash and the protocol moves on.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod aggregator;
pub mod agreement;
pub mod candidates;
pub mod config;
pub mod header;
pub mod keys;
pub mod messages;
pub mod provisioners;
pub mod queue;
pub mod reducer;
pub mod round;
pub mod sortition;
pub mod wire;

// Re-export main types at crate root for convenience
pub use aggregator::{Aggregator, AggregatorError, QuorumReached};
pub use agreement::{reconstruct_apk, AgreementAccumulator, AgreementError, AgreementHandler};
pub use candidates::CandidateRegistry;
pub use config::{ConsensusConfig, MAX_COMMITTEE_SIZE};
pub use header::{signable_vote_bytes, Header, SignatureError};
pub use keys::ConsensusKeys;
pub use messages::{
    Agreement, BestScore, Message, Reduction, StepVotes, StepVotesError, Topic,
};
pub use provisioners::{Member, Provisioners, ProvisionerError, ProvisionerKey, Stake};
pub use queue::RoundQueue;
pub use reducer::{Reducer, ReductionPhase, StepCompletion};
pub use round::{
    BlockVerifier, CandidateRequestor, Consensus, ConsensusError, ConsensusHandle, Database,
    RoundUpdate, RoundWinner,
};
pub use sortition::{Cluster, VotingCommittee};
pub use wire::WireError;

/// The 32-byte all-zero block hash denoting "no convergence".
pub use sba_types::EMPTY_HASH;
