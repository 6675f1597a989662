//! Consensus configuration.
//!
//! All tunables are taken at construction time; nothing in the core reads
//! process-global state. `Default` matches the production profile, `fast()`
//! shortens every timeout for tests.

use std::time::Duration;

/// Maximum committee size: a committee subset must fit a `u64` bitset.
pub const MAX_COMMITTEE_SIZE: usize = 64;

/// Configuration for the consensus core
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Sortition target committee size; capped at [`MAX_COMMITTEE_SIZE`]
    pub committee_size: usize,

    /// Base duration of one reduction step
    pub step_timeout: Duration,
    /// Added to the step timeout on every failed iteration of a round
    pub step_timeout_increase: Duration,
    /// Upper bound on the step timeout after increases
    pub max_step_timeout: Duration,

    /// Overall budget for one round iteration before the timeout counter
    /// increments and selection is expected to re-run
    pub round_timeout: Duration,

    /// How long to wait for a candidate block requested from peers
    pub candidate_fetch_timeout: Duration,

    /// Maximum buffered agreements per future round
    pub queue_cap_per_round: usize,

    /// Rounds a candidate block stays in the registry after insertion
    pub candidate_eviction_depth: u64,

    /// Whether sortition may select the same provisioner for several seats
    /// of one committee (the base configuration allows it)
    pub allow_repetition: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            committee_size: MAX_COMMITTEE_SIZE,
            step_timeout: Duration::from_secs(5),
            step_timeout_increase: Duration::from_secs(2),
            max_step_timeout: Duration::from_secs(60),
            round_timeout: Duration::from_secs(20),
            candidate_fetch_timeout: Duration::from_secs(5),
            queue_cap_per_round: 256,
            candidate_eviction_depth: 3,
            allow_repetition: true,
        }
    }
}

impl ConsensusConfig {
    /// A short-timeout profile for tests.
    pub fn fast() -> Self {
        Self {
            step_timeout: Duration::from_millis(100),
            step_timeout_increase: Duration::from_millis(50),
            max_step_timeout: Duration::from_secs(2),
            round_timeout: Duration::from_millis(500),
            candidate_fetch_timeout: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Set the sortition target committee size (capped at 64).
    pub fn with_committee_size(mut self, size: usize) -> Self {
        self.committee_size = size.min(MAX_COMMITTEE_SIZE);
        self
    }

    /// Set the base reduction step timeout.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Set the candidate fetch timeout.
    pub fn with_candidate_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.candidate_fetch_timeout = timeout;
        self
    }

    /// Set the per-future-round agreement buffer capacity.
    pub fn with_queue_cap(mut self, cap: usize) -> Self {
        self.queue_cap_per_round = cap;
        self
    }

    /// Forbid repeated selection of one provisioner within a committee.
    pub fn without_repetition(mut self) -> Self {
        self.allow_repetition = false;
        self
    }

    /// Step timeout for the given round iteration.
    ///
    /// `step_timeout + iteration * step_timeout_increase`, capped. A failed
    /// round re-runs with a larger budget so a slow network still converges.
    pub fn step_timeout_for(&self, iteration: u64) -> Duration {
        let increase = self
            .step_timeout_increase
            .saturating_mul(iteration.min(u32::MAX as u64) as u32);
        self.step_timeout
            .saturating_add(increase)
            .min(self.max_step_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_timeout_growth_is_capped() {
        let config = ConsensusConfig::default();
        assert_eq!(config.step_timeout_for(0), Duration::from_secs(5));
        assert_eq!(config.step_timeout_for(1), Duration::from_secs(7));
        assert_eq!(config.step_timeout_for(1000), config.max_step_timeout);
    }

    #[test]
    fn test_committee_size_is_capped() {
        let config = ConsensusConfig::default().with_committee_size(1000);
        assert_eq!(config.committee_size, MAX_COMMITTEE_SIZE);
    }
}
