// SPDX-License-Identifier: Apache-2.0

//! Corpus records, weighted sampling, pruning, and the coverage frontier
//! (§3, §4.6).

use std::io::Write;

use rand::Rng;
use serde::Serialize;

use crate::feature::Feature;
use crate::feature_set::FeatureSet;

/// One corpus element. `bytes` is non-empty except for the initial dummy
/// input. Records are immutable once admitted; `features` may only shrink,
/// via pruning (§3).
#[derive(Debug, Clone)]
pub struct CorpusRecord {
    pub bytes: Vec<u8>,
    pub features: Vec<Feature>,
    pub cmp_args: Option<Vec<u8>>,
}

/// Parallel weight/cumulative-weight arrays for `O(log n)` weighted
/// sampling, with an explicit validity flag (§4.6).
#[derive(Debug, Default)]
pub struct WeightedDistribution {
    weight: Vec<u32>,
    cumulative: Vec<u64>,
    valid: bool,
}

impl WeightedDistribution {
    pub fn new() -> Self {
        Self {
            weight: Vec::new(),
            cumulative: Vec::new(),
            valid: true,
        }
    }

    pub fn len(&self) -> usize {
        self.weight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weight.is_empty()
    }

    /// Append a weight, keeping `cumulative` correct incrementally and
    /// leaving `valid` untouched (§4.6: "`add_weight` ... leave `valid=true`").
    pub fn add_weight(&mut self, weight: u32) {
        let last = self.cumulative.last().copied().unwrap_or(0);
        self.weight.push(weight);
        self.cumulative.push(last + weight as u64);
    }

    /// Remove the last element, keeping `cumulative` correct incrementally.
    pub fn pop_back(&mut self) {
        self.weight.pop();
        self.cumulative.pop();
    }

    /// Any weight change outside `add_weight`/`pop_back` invalidates
    /// `random_index` until `recompute` runs (§4.6).
    pub fn change_weight(&mut self, index: usize, weight: u32) {
        self.weight[index] = weight;
        self.valid = false;
    }

    pub fn recompute(&mut self) {
        let mut running = 0u64;
        for (w, c) in self.weight.iter().zip(self.cumulative.iter_mut()) {
            running += *w as u64;
            *c = running;
        }
        self.valid = true;
    }

    pub fn total_weight(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    /// Smallest `i` with `r mod total < cumulative[i]`. Requires
    /// `valid == true` and a non-empty, positive-weight distribution.
    pub fn random_index(&self, r: u64) -> Option<usize> {
        if !self.valid || self.weight.is_empty() {
            return None;
        }
        let total = self.total_weight();
        if total == 0 {
            return None;
        }
        let target = r % total;
        match self.cumulative.binary_search(&target) {
            Ok(i) => Some(i + 1),
            Err(i) => Some(i),
        }
        .filter(|&i| i < self.weight.len())
    }
}

/// A PC is in the frontier iff its enclosing function is partially covered
/// (§3, §4.6).
#[derive(Debug, Clone, Default)]
pub struct CoverageFrontier {
    frontier: Vec<bool>,
}

/// `{pc, flags}` entry of the instrumented binary's PC table (§3).
#[derive(Debug, Clone, Copy)]
pub struct PcTableEntry {
    pub pc: u64,
    pub is_func_entry: bool,
}

impl CoverageFrontier {
    pub fn contains(&self, pc_index: u64) -> bool {
        self.frontier
            .get(pc_index as usize)
            .copied()
            .unwrap_or(false)
    }

    pub fn count_in(&self, features: &[Feature]) -> usize {
        features
            .iter()
            .filter(|&&f| {
                crate::feature::domain_of(f) == crate::feature::Domain::PcCounters
                    && self.contains(crate::feature::counter_to_pc_index(f))
            })
            .count()
    }

    /// Build the frontier from the current corpus' observed PC-counter
    /// features and the binary's PC table. Returns the number of partially
    /// covered functions (§4.6).
    pub fn compute(corpus: &Corpus, pc_table: &[PcTableEntry]) -> (Self, usize) {
        let mut covered = vec![false; pc_table.len()];
        for record in &corpus.records {
            for &f in &record.features {
                if crate::feature::domain_of(f) == crate::feature::Domain::PcCounters {
                    let idx = crate::feature::counter_to_pc_index(f) as usize;
                    if idx < covered.len() {
                        covered[idx] = true;
                    }
                }
            }
        }

        let mut frontier = vec![false; pc_table.len()];
        let mut partial_functions = 0usize;
        let mut start = 0usize;
        while start < pc_table.len() {
            let mut end = start + 1;
            while end < pc_table.len() && !pc_table[end].is_func_entry {
                end += 1;
            }
            let func_covered = &covered[start..end];
            let all_covered = func_covered.iter().all(|&c| c);
            let all_uncovered = func_covered.iter().all(|&c| !c);
            if !all_covered && !all_uncovered {
                for slot in frontier[start..end].iter_mut() {
                    *slot = true;
                }
                partial_functions += 1;
            }
            start = end;
        }
        (Self { frontier }, partial_functions)
    }
}

/// Records, their weighted distribution, and derived stats (§4.6).
#[derive(Default)]
pub struct Corpus {
    records: Vec<CorpusRecord>,
    distribution: WeightedDistribution,
}

impl Corpus {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            distribution: WeightedDistribution::new(),
        }
    }

    pub fn num_active(&self) -> usize {
        self.records.len()
    }

    pub fn num_total(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, i: usize) -> &CorpusRecord {
        &self.records[i]
    }

    pub fn max_avg_size(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.records.iter().map(|r| r.bytes.len()).sum::<usize>() as f64 / self.records.len() as f64
    }

    /// Append a record and push a matching weight
    /// `w = compute_weight(features) * (1 + |features ∩ frontier|)` (§4.6).
    pub fn add(
        &mut self,
        bytes: Vec<u8>,
        features: Vec<Feature>,
        cmp_args: Option<Vec<u8>>,
        feature_set: &FeatureSet,
        frontier: &CoverageFrontier,
    ) {
        let base_weight = feature_set.compute_weight(&features);
        let frontier_bonus = 1 + frontier.count_in(&features) as u32;
        let weight = base_weight.saturating_mul(frontier_bonus);
        self.records.push(CorpusRecord {
            bytes,
            features,
            cmp_args,
        });
        self.distribution.add_weight(weight);
    }

    pub fn weighted_random(&self, r: u64) -> Option<usize> {
        self.distribution.random_index(r)
    }

    pub fn uniform_random(&self, r: u64) -> Option<usize> {
        if self.records.is_empty() {
            return None
        }
        Some((r % self.records.len() as u64) as usize)
    }

    /// Shrink each record's feature vector to the still-informative subset,
    /// recompute weights, and drop zero-weight records plus, if still over
    /// `max_size`, additional inverse-weighted-random-sampled records. The
    /// corpus is guaranteed non-empty afterwards (§4.6, §8).
    pub fn prune(
        &mut self,
        feature_set: &FeatureSet,
        frontier: &CoverageFrontier,
        max_size: usize,
        rng: &mut impl Rng,
    ) -> usize {
        let before = self.records.len();
        if before == 0 {
            return 0;
        }

        let mut weights = Vec::with_capacity(before);
        for record in &mut self.records {
            feature_set.count_unseen_and_prune_frequent(&mut record.features);
            let base = feature_set.compute_weight(&record.features);
            let bonus = 1 + frontier.count_in(&record.features) as u32;
            weights.push(base.saturating_mul(bonus));
        }

        let num_zero = weights.iter().filter(|&&w| w == 0).count();
        let target = max_size.min((before.saturating_sub(num_zero)).max(1));

        let mut keep: Vec<usize> = (0..before).filter(|&i| weights[i] > 0).collect();
        if keep.is_empty() {
            // Never let the corpus go empty: keep the least-bad record.
            let best = (0..before).max_by_key(|&i| weights[i]).unwrap_or(0);
            keep.push(best);
        }

        while keep.len() > target {
            let max_weight = keep.iter().map(|&i| weights[i]).max().unwrap_or(0);
            let inv = |i: usize| (max_weight as u64 + 1) - weights[i] as u64;
            let total: u64 = keep.iter().map(|&i| inv(i)).sum();
            let r = rng.gen_range(0..total);
            let mut acc = 0u64;
            let mut drop_pos = keep.len() - 1;
            for (pos, &idx) in keep.iter().enumerate() {
                acc += inv(idx);
                if r < acc {
                    drop_pos = pos;
                    break;
                }
            }
            keep.remove(drop_pos);
        }

        keep.sort_unstable();
        let mut new_records = Vec::with_capacity(keep.len());
        let mut new_weights = Vec::with_capacity(keep.len());
        for idx in keep {
            new_records.push(self.records[idx].clone());
            new_weights.push(weights[idx]);
        }
        let removed = before - new_records.len();
        self.records = new_records;
        self.distribution = WeightedDistribution::new();
        for w in new_weights {
            self.distribution.add_weight(w);
        }
        self.distribution.recompute();
        removed
    }

    /// Stable JSON schema `{"corpus_stats":[{"size":…,"frequencies":[…]},…]}`
    /// (§4.6).
    pub fn print_stats(&self, writer: &mut impl Write, feature_set: &FeatureSet) -> crate::error::Result<()> {
        #[derive(Serialize)]
        struct RecordStats {
            size: usize,
            frequencies: Vec<u8>,
        }
        #[derive(Serialize)]
        struct CorpusStats {
            corpus_stats: Vec<RecordStats>,
        }

        let corpus_stats = self
            .records
            .iter()
            .map(|r| RecordStats {
                size: r.bytes.len(),
                frequencies: r.features.iter().map(|&f| feature_set.frequency(f)).collect(),
            })
            .collect();

        let json = serde_json::to_string(&CorpusStats { corpus_stats })
            .map_err(|e| crate::error::CentipedeError::Config(e.to_string()))?;
        writer.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::counter_feature;

    #[test]
    fn weighted_distribution_random_index_proportional() {
        let mut dist = WeightedDistribution::new();
        dist.add_weight(2);
        dist.add_weight(1);
        dist.recompute();
        let mut counts = [0u32; 2];
        for i in 0..9000u64 {
            let idx = dist.random_index(i).unwrap();
            counts[idx] += 1;
        }
        let ratio = counts[0] as f64 / counts[1] as f64;
        assert!((ratio - 2.0).abs() < 0.3, "ratio was {ratio}");
    }

    #[test]
    fn change_weight_invalidates_until_recompute() {
        let mut dist = WeightedDistribution::new();
        dist.add_weight(5);
        dist.add_weight(5);
        dist.recompute();
        dist.change_weight(0, 1);
        assert_eq!(dist.random_index(0), None);
        dist.recompute();
        assert!(dist.random_index(0).is_some());
    }

    #[test]
    fn prune_never_empties_corpus() {
        let mut fs = FeatureSet::with_default_table(250);
        let mut corpus = Corpus::new();
        let frontier = CoverageFrontier::default();
        for i in 0..5u64 {
            let features = vec![counter_feature(i, 1)];
            fs.increment_frequencies(&features);
            corpus.add(vec![i as u8], features, None, &fs, &frontier);
        }
        let mut rng = rand::thread_rng();
        corpus.prune(&fs, &frontier, 2, &mut rng);
        assert!(corpus.num_active() >= 1);
        assert!(corpus.num_active() <= 2);
    }

    #[test]
    fn coverage_frontier_marks_only_partial_functions() {
        let pc_table = vec![
            PcTableEntry {
                pc: 0,
                is_func_entry: true,
            },
            PcTableEntry {
                pc: 1,
                is_func_entry: false,
            },
            PcTableEntry {
                pc: 2,
                is_func_entry: true,
            },
            PcTableEntry {
                pc: 3,
                is_func_entry: false,
            },
        ];
        let mut fs = FeatureSet::with_default_table(250);
        let mut corpus = Corpus::new();
        let empty_frontier = CoverageFrontier::default();
        // Only PC 0 covered out of function {0,1}: partial.
        // Neither PC of function {2,3} covered: not partial.
        let features = vec![counter_feature(0, 1)];
        fs.increment_frequencies(&features);
        corpus.add(vec![1], features, None, &fs, &empty_frontier);

        let (frontier, partial) = CoverageFrontier::compute(&corpus, &pc_table);
        assert_eq!(partial, 1);
        assert!(frontier.contains(0));
        assert!(frontier.contains(1));
        assert!(!frontier.contains(2));
        assert!(!frontier.contains(3));
    }
}
