//! Bounded buffering of agreements for rounds this node has not reached yet.
//!
//! Peers ahead of us emit agreements for future rounds; those are held here
//! and replayed through the accumulator when the round starts. Agreements
//! for past rounds are discarded at the door. Each round's buffer is capped
//! so an adversary cannot grow memory with fabricated far-future traffic.

use std::collections::BTreeMap;

use tracing::{trace, warn};

use crate::messages::Agreement;

/// Per-round bounded buffer of future agreements.
#[derive(Debug, Default)]
pub struct RoundQueue {
    cap_per_round: usize,
    buffered: BTreeMap<u64, Vec<Agreement>>,
}

impl RoundQueue {
    /// Create a queue with the given per-round capacity.
    pub fn new(cap_per_round: usize) -> Self {
        Self {
            cap_per_round,
            buffered: BTreeMap::new(),
        }
    }

    /// Buffer an agreement for a future round.
    ///
    /// Returns `false` when the round's buffer is full and the message was
    /// dropped.
    pub fn push(&mut self, round: u64, ev: Agreement) -> bool {
        let bucket = self.buffered.entry(round).or_default();
        if bucket.len() >= self.cap_per_round {
            warn!(round, cap = self.cap_per_round, "future agreement dropped, buffer full");
            return false;
        }
        trace!(round, buffered = bucket.len() + 1, "future agreement buffered");
        bucket.push(ev);
        true
    }

    /// Take all agreements buffered for a round.
    pub fn drain(&mut self, round: u64) -> Vec<Agreement> {
        self.buffered.remove(&round).unwrap_or_default()
    }

    /// Drop everything buffered below a round.
    pub fn discard_below(&mut self, round: u64) {
        self.buffered = self.buffered.split_off(&round);
    }

    /// The highest round with buffered agreements, if any.
    pub fn highest_round(&self) -> Option<u64> {
        self.buffered.keys().next_back().copied()
    }

    /// Number of buffered agreements across all rounds.
    pub fn len(&self) -> usize {
        self.buffered.values().map(Vec::len).sum()
    }

    /// Whether the queue holds nothing.
    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }
}
