// SPDX-License-Identifier: Apache-2.0

//! Lossy frequency map over features (spec §3, §4.5). Owned by exactly one
//! worker thread; no cross-thread sharing (spec §5).

use std::collections::HashSet;

use crate::feature::{domain_of, hash_feature, Domain, Feature, ALL_DOMAINS};

/// Default frequency-table size, `2^28` entries of one byte each (spec §3).
pub const DEFAULT_TABLE_BITS: u32 = 28;

pub struct FeatureSet {
    table_bits: u32,
    frequency: Vec<u8>,
    frequency_threshold: u8,
    num_features: usize,
    features_per_domain: [usize; ALL_DOMAINS.len()],
    pc_index_set: HashSet<u64>,
}

impl FeatureSet {
    /// `frequency_threshold` must be in `1..=255` (spec §6, validated at
    /// engine start-up).
    pub fn new(table_bits: u32, frequency_threshold: u8) -> Self {
        assert!((1..=255).contains(&frequency_threshold));
        Self {
            table_bits,
            frequency: vec![0u8; 1usize << table_bits],
            frequency_threshold,
            num_features: 0,
            features_per_domain: [0; ALL_DOMAINS.len()],
            pc_index_set: HashSet::new(),
        }
    }

    pub fn with_default_table(frequency_threshold: u8) -> Self {
        Self::new(DEFAULT_TABLE_BITS, frequency_threshold)
    }

    fn index(&self, feature: Feature) -> usize {
        hash_feature(feature, self.table_bits) as usize
    }

    pub fn frequency(&self, feature: Feature) -> u8 {
        self.frequency[self.index(feature)]
    }

    pub fn is_frequent(&self, feature: Feature) -> bool {
        self.frequency(feature) >= self.frequency_threshold
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn features_per_domain(&self, domain: Domain) -> usize {
        self.features_per_domain[domain.index()]
    }

    pub fn pc_index_set(&self) -> &HashSet<u64> {
        &self.pc_index_set
    }

    /// Returns the count of features whose hashed frequency bucket is still
    /// zero (never observed before), and compacts `features` in place to
    /// retain only those below `frequency_threshold`, preserving order
    /// (spec §4.5).
    pub fn count_unseen_and_prune_frequent(&self, features: &mut Vec<Feature>) -> usize {
        let mut unseen = 0usize;
        features.retain(|&f| {
            let freq = self.frequency(f);
            if freq == 0 {
                unseen += 1;
            }
            freq < self.frequency_threshold
        });
        unseen
    }

    /// For each feature, bump its bucket counter (first occurrence updates
    /// the domain tallies and PC-index set), saturating at
    /// `frequency_threshold` (spec §4.5).
    pub fn increment_frequencies(&mut self, features: &[Feature]) {
        for &f in features {
            let idx = self.index(f);
            if self.frequency[idx] == 0 {
                self.num_features += 1;
                self.features_per_domain[domain_of(f).index()] += 1;
                if domain_of(f) == Domain::PcCounters {
                    self.pc_index_set
                        .insert(crate::feature::counter_to_pc_index(f));
                }
            }
            if self.frequency[idx] < self.frequency_threshold {
                self.frequency[idx] += 1;
            }
        }
    }

    fn domain_weight(&self, domain: Domain) -> u32 {
        let per_domain = self.features_per_domain(domain).max(1) as u32;
        (self.num_features.max(1) as u32 / per_domain).max(1) * domain.importance()
    }

    /// `Σ_f domain_weight(f) · (256 / frequency(f))`. Only called on
    /// features already admitted, so `frequency(f) >= 1` is guaranteed
    /// (spec §4.5).
    pub fn compute_weight(&self, features: &[Feature]) -> u32 {
        features
            .iter()
            .map(|&f| {
                let freq = self.frequency(f).max(1) as u32;
                self.domain_weight(domain_of(f)) * (256 / freq)
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::counter_feature;

    fn small_set(threshold: u8) -> FeatureSet {
        FeatureSet::new(16, threshold)
    }

    #[test]
    fn unseen_count_and_prune_frequent() {
        let mut fs = small_set(2);
        let v = vec![counter_feature(1, 1), counter_feature(2, 1)];
        let mut features = v.clone();
        let unseen = fs.count_unseen_and_prune_frequent(&mut features);
        assert_eq!(unseen, 2);
        assert_eq!(features, v);

        fs.increment_frequencies(&v);
        fs.increment_frequencies(&v);
        let mut features = v.clone();
        let unseen = fs.count_unseen_and_prune_frequent(&mut features);
        assert_eq!(unseen, 0);
        assert!(features.is_empty(), "both features are now frequent");
    }

    #[test]
    fn rarer_domain_population_weighs_more_at_equal_frequency() {
        // Two CMP features (same domain, same importance weight) each seen
        // exactly once: as more distinct CMP features get admitted the
        // shared domain population grows, so domain_weight for *all* of
        // them (including ones admitted earlier) must not increase.
        let mut fs = small_set(255);
        let cmp_a = crate::feature::cmp_feature(7, 1, 2);
        fs.increment_frequencies(&[cmp_a]);
        let w_before = fs.compute_weight(&[cmp_a]);

        let cmp_b = crate::feature::cmp_feature(8, 3, 4);
        fs.increment_frequencies(&[cmp_b]);
        let w_after = fs.compute_weight(&[cmp_a]);

        assert!(
            w_after <= w_before,
            "growing a domain's population must not increase its features' weight"
        );
    }

    #[test]
    fn increasing_frequency_never_increases_weight() {
        let mut fs = small_set(255);
        let f = counter_feature(5, 9);
        fs.increment_frequencies(&[f]);
        let w1 = fs.compute_weight(&[f]);
        fs.increment_frequencies(&[f]);
        let w2 = fs.compute_weight(&[f]);
        assert!(w2 <= w1);
    }
}
