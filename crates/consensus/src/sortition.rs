//! Deterministic stake-weighted committee extraction.
//!
//! For each `(round, step)` a committee is drawn from the provisioners with
//! active stake: a SHA-3-256 seed is derived from the round and step, then
//! each seat is filled by reducing a 256-bit sample modulo the total active
//! weight and walking the provisioners in canonical key order until the
//! cumulative-weight interval containing the sample is found.
//!
//! The draw samples with replacement in the base configuration, so one
//! provisioner may occupy several seats and cast that many votes. Committee
//! size is capped at 64 so a committee subset fits a `u64` bitset.
//!
//! Determinism requirement: for identical `(round, step, target size, active
//! provisioner subset)` the committee is byte-identical across nodes. At an
//! exact cumulative-weight boundary the walk resolves to the lower ordered
//! key.

use std::collections::{BTreeMap, BTreeSet};

use num_bigint::BigUint;
use sba_crypto::sha3_256_concat;

use crate::provisioners::{ProvisionerKey, Provisioners};

/// An ordered multiset of provisioner keys.
///
/// Tracks how many times each key occurs; iteration follows the canonical
/// key order. Used both for committee seats and for the set of voters
/// collected by an accumulator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cluster {
    occurrences: BTreeMap<ProvisionerKey, usize>,
}

impl Cluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one occurrence of a key.
    pub fn insert(&mut self, key: ProvisionerKey) {
        *self.occurrences.entry(key).or_insert(0) += 1;
    }

    /// Insert `n` occurrences of a key.
    pub fn insert_n(&mut self, key: ProvisionerKey, n: usize) {
        if n > 0 {
            *self.occurrences.entry(key).or_insert(0) += n;
        }
    }

    /// Total number of occurrences across all keys.
    pub fn total_occurrences(&self) -> usize {
        self.occurrences.values().sum()
    }

    /// Number of occurrences of a single key.
    pub fn occurrences_of(&self, key: &ProvisionerKey) -> usize {
        self.occurrences.get(key).copied().unwrap_or(0)
    }

    /// Whether the key occurs at least once.
    pub fn contains(&self, key: &ProvisionerKey) -> bool {
        self.occurrences.contains_key(key)
    }

    /// The distinct keys in canonical order.
    pub fn unique_keys(&self) -> Vec<ProvisionerKey> {
        self.occurrences.keys().copied().collect()
    }

    /// The distinct keys as an ordered set.
    pub fn key_set(&self) -> BTreeSet<ProvisionerKey> {
        self.occurrences.keys().copied().collect()
    }

    /// Whether the cluster is empty.
    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }
}

/// The voting committee for one `(round, step)`.
///
/// An ordered multiset of provisioner keys of size
/// `min(target_size, active_subset_size)`. Bitset operations index the
/// distinct keys by their canonical position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VotingCommittee {
    seats: Cluster,
}

impl VotingCommittee {
    /// Total number of seats (occurrences, not distinct keys).
    pub fn size(&self) -> usize {
        self.seats.total_occurrences()
    }

    /// The distinct member keys in canonical order.
    pub fn member_keys(&self) -> Vec<ProvisionerKey> {
        self.seats.unique_keys()
    }

    /// Whether a key holds at least one seat.
    pub fn is_member(&self, key: &ProvisionerKey) -> bool {
        self.seats.contains(key)
    }

    /// How many seats a key holds; each seat is one vote.
    pub fn votes_for(&self, key: &ProvisionerKey) -> usize {
        self.seats.occurrences_of(key)
    }

    /// Bitset with bit `i` set iff the i-th distinct committee key is an
    /// element of `set`.
    pub fn bits(&self, set: &BTreeSet<ProvisionerKey>) -> u64 {
        let mut bitset = 0u64;
        for (i, key) in self.seats.unique_keys().iter().enumerate() {
            if set.contains(key) {
                bitset |= 1 << i;
            }
        }
        bitset
    }

    /// The sub-multiset of the committee selected by a bitset: each set bit
    /// picks the distinct key at that canonical position, carrying all of
    /// its seats.
    pub fn intersect(&self, bitset: u64) -> Cluster {
        let mut sub = Cluster::new();
        for (i, key) in self.seats.unique_keys().iter().enumerate() {
            if bitset & (1 << i) != 0 {
                sub.insert_n(*key, self.seats.occurrences_of(key));
            }
        }
        sub
    }
}

/// Derive the sortition seed for `(round, step, counter)`.
pub fn seed(round: u64, step: u8, counter: u64) -> [u8; 32] {
    sha3_256_concat(&[&round.to_le_bytes(), &[step], &counter.to_le_bytes()])
}

/// Reduce a seat sample to a weight offset in `0..total_weight`.
fn sample_weight(seed: &[u8; 32], seat: u64, total_weight: u64) -> u64 {
    let hash = sha3_256_concat(&[seed, &seat.to_le_bytes()]);
    let sample = BigUint::from_bytes_be(&hash) % BigUint::from(total_weight);
    // total_weight fits u64, so the remainder does too
    sample.iter_u64_digits().next().unwrap_or(0)
}

/// Extract the voting committee for `(round, step)`.
///
/// With `allow_repetition` (the base configuration) seats are drawn with
/// replacement; otherwise a selected provisioner's remaining weight is
/// removed so every seat goes to a distinct key.
pub fn create_committee(
    provisioners: &Provisioners,
    round: u64,
    step: u8,
    target_size: usize,
    allow_repetition: bool,
) -> VotingCommittee {
    let mut active = provisioners.active_members(round);
    let mut total_weight: u64 = active.iter().map(|(_, w)| w).sum();

    let mut seats = Cluster::new();
    if total_weight == 0 {
        return VotingCommittee { seats };
    }

    let size = target_size.min(active.len());
    let seed = seed(round, step, 0);

    for seat in 0..size as u64 {
        let sample = sample_weight(&seed, seat, total_weight);

        // Walk the active subset in canonical key order; the provisioner
        // whose cumulative-weight interval contains the sample wins the
        // seat. An exact boundary falls into the next interval, which is
        // the lower-ordered of the two adjacent keys.
        let mut cumulative = 0u64;
        let mut selected = 0usize;
        for (i, (_, weight)) in active.iter().enumerate() {
            cumulative += weight;
            if sample < cumulative {
                selected = i;
                break;
            }
        }

        seats.insert(active[selected].0);

        if !allow_repetition {
            total_weight -= active[selected].1;
            active[selected].1 = 0;
            if total_weight == 0 {
                break;
            }
        }
    }

    VotingCommittee { seats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioners::Stake;
    use sba_crypto::bls::BlsSecretKey;

    fn provisioner_set(n: usize, amount: u64) -> Provisioners {
        let mut p = Provisioners::new();
        for i in 0..n {
            let sk = BlsSecretKey::from_seed(&[i as u8; 32]).unwrap();
            p.insert(&sk.public_key().to_bytes(), Stake::new(amount, 1, 1000))
                .unwrap();
        }
        p
    }

    #[test]
    fn test_committee_is_deterministic() {
        let p = provisioner_set(10, 100);
        let c1 = create_committee(&p, 50, 2, 64, true);
        let c2 = create_committee(&p, 50, 2, 64, true);
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_seed_depends_on_all_inputs() {
        let base = seed(50, 2, 0);
        assert_ne!(base, seed(51, 2, 0));
        assert_ne!(base, seed(50, 3, 0));
        assert_ne!(base, seed(50, 2, 1));
        assert_eq!(base, seed(50, 2, 0));
    }

    #[test]
    fn test_committee_size_capped_by_active_subset() {
        let p = provisioner_set(3, 100);
        let c = create_committee(&p, 50, 1, 64, true);
        assert_eq!(c.size(), 3);
    }

    #[test]
    fn test_empty_weight_gives_empty_committee() {
        let p = provisioner_set(3, 100);
        // No stake is active at round 0 (windows start at 1)
        let c = create_committee(&p, 0, 1, 64, true);
        assert_eq!(c.size(), 0);
    }

    #[test]
    fn test_no_repetition_gives_distinct_seats() {
        let p = provisioner_set(5, 100);
        let c = create_committee(&p, 50, 1, 5, false);
        assert_eq!(c.size(), 5);
        assert_eq!(c.member_keys().len(), 5);
    }

    #[test]
    fn test_bits_and_intersect_are_inverse() {
        let p = provisioner_set(8, 100);
        let c = create_committee(&p, 50, 1, 8, true);

        let keys = c.member_keys();
        let subset: BTreeSet<_> = keys.iter().step_by(2).copied().collect();

        let bitset = c.bits(&subset);
        let sub = c.intersect(bitset);

        assert_eq!(sub.key_set(), subset);
        for key in &subset {
            assert_eq!(sub.occurrences_of(key), c.votes_for(key));
        }
    }

    #[test]
    fn test_cluster_counts_occurrences() {
        let p = provisioner_set(2, 100);
        let keys: Vec<_> = p.iter().map(|m| *m.key()).collect();

        let mut cluster = Cluster::new();
        cluster.insert(keys[0]);
        cluster.insert(keys[0]);
        cluster.insert(keys[1]);

        assert_eq!(cluster.total_occurrences(), 3);
        assert_eq!(cluster.occurrences_of(&keys[0]), 2);
        assert_eq!(cluster.unique_keys().len(), 2);
    }
}
