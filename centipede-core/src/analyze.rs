// SPDX-License-Identifier: Apache-2.0

//! Coverage-difference analysis between two corpora (§4.12).

use std::collections::HashSet;

use crate::blobstore::{BlobStore, LocalBlobStore};
use crate::corpus::PcTableEntry;
use crate::engine::{ExecutionOutcome, RunnerCallbacks};
use crate::environment::Environment;
use crate::error::Result;
use crate::feature::{counter_to_pc_index, domain_of, Domain};
use crate::symbol::SymbolTable;

#[derive(Debug, Default)]
pub struct AnalyzeReport {
    pub pcs_only_in_b: Vec<u64>,
    pub unique_inputs_in_b: usize,
    pub shared_inputs_in_b: usize,
    pub descriptions: Vec<String>,
}

fn covered_pcs(
    env: &Environment,
    callbacks: &mut impl RunnerCallbacks,
) -> Result<Vec<(Vec<u8>, HashSet<u64>)>> {
    let store = LocalBlobStore;
    let mut out = Vec::new();
    for shard in env.all_shard_indices() {
        let bytes = store.read(&env.corpus_path(shard))?;
        for input in crate::blob_file::scan_blobs(&bytes) {
            let outcomes: Vec<ExecutionOutcome> = callbacks.execute_batch(&[input.clone()])?;
            let pcs: HashSet<u64> = outcomes
                .first()
                .and_then(|o| o.features.as_ref())
                .map(|features| {
                    features
                        .iter()
                        .filter(|&&f| domain_of(f) == Domain::PcCounters)
                        .map(|&f| counter_to_pc_index(f))
                        .collect()
                })
                .unwrap_or_default();
            out.push((input, pcs));
        }
    }
    Ok(out)
}

/// Compute the PCs covered by `b` but not `a`, then bucket `b`'s inputs into
/// *unique* (touches at least one `b_only` PC) vs *shared* (§4.12).
pub fn analyze(
    env_a: &Environment,
    env_b: &Environment,
    callbacks_a: &mut impl RunnerCallbacks,
    callbacks_b: &mut impl RunnerCallbacks,
    symbols: &mut impl SymbolTable,
) -> Result<AnalyzeReport> {
    let a_runs = covered_pcs(env_a, callbacks_a)?;
    let b_runs = covered_pcs(env_b, callbacks_b)?;

    let a_pcs: HashSet<u64> = a_runs.iter().flat_map(|(_, pcs)| pcs.iter().copied()).collect();
    let b_pcs: HashSet<u64> = b_runs.iter().flat_map(|(_, pcs)| pcs.iter().copied()).collect();
    let mut b_only: Vec<u64> = b_pcs.difference(&a_pcs).copied().collect();
    b_only.sort_unstable();

    let b_only_set: HashSet<u64> = b_only.iter().copied().collect();
    let mut unique = 0usize;
    let mut shared = 0usize;
    for (_, pcs) in &b_runs {
        if pcs.iter().any(|pc| b_only_set.contains(pc)) {
            unique += 1;
        } else {
            shared += 1;
        }
    }

    let descriptions = b_only.iter().map(|&pc| symbols.describe(pc)).collect();

    Ok(AnalyzeReport {
        pcs_only_in_b: b_only,
        unique_inputs_in_b: unique,
        shared_inputs_in_b: shared,
        descriptions,
    })
}

/// Unused directly by `analyze` but kept as the collaborator boundary for
/// callers that already have a PC table handy (e.g. to label `b_only`
/// entries by enclosing function).
pub fn functions_touched(pc_table: &[PcTableEntry], pcs: &HashSet<u64>) -> usize {
    let mut start = 0usize;
    let mut count = 0usize;
    while start < pc_table.len() {
        let mut end = start + 1;
        while end < pc_table.len() && !pc_table[end].is_func_entry {
            end += 1;
        }
        if (start..end).any(|i| pcs.contains(&(i as u64))) {
            count += 1;
        }
        start = end;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::NoopSymbolTable;
    use tempfile::tempdir;

    struct FixedCoverage(Vec<u64>);

    impl RunnerCallbacks for FixedCoverage {
        fn execute_batch(&mut self, inputs: &[Vec<u8>]) -> Result<Vec<ExecutionOutcome>> {
            Ok(inputs
                .iter()
                .map(|_| ExecutionOutcome {
                    features: Some(
                        self.0
                            .iter()
                            .map(|&pc| crate::feature::counter_feature(pc, 1))
                            .collect(),
                    ),
                    crashed: false,
                })
                .collect())
        }
        fn dummy_valid_input(&self) -> Vec<u8> {
            vec![0]
        }
    }

    fn env_with_one_input(workdir: &std::path::Path, bytes: &[u8]) -> Environment {
        let env = Environment {
            workdir: workdir.to_path_buf(),
            binary_name: "t".into(),
            binary_hash: "h".into(),
            total_shards: 1,
            first_shard_index: 0,
            num_threads: 1,
        };
        let mut appender = crate::blob_file::BlobFileAppender::new();
        appender.open(env.corpus_path(0)).unwrap();
        appender.append(bytes).unwrap();
        appender.close().unwrap();
        env
    }

    #[test]
    fn finds_pcs_only_covered_by_b() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let env_a = env_with_one_input(dir_a.path(), b"a");
        let env_b = env_with_one_input(dir_b.path(), b"b");

        let mut cb_a = FixedCoverage(vec![1, 2]);
        let mut cb_b = FixedCoverage(vec![2, 3, 4]);
        let mut symbols = NoopSymbolTable;

        let report = analyze(&env_a, &env_b, &mut cb_a, &mut cb_b, &mut symbols).unwrap();
        assert_eq!(report.pcs_only_in_b, vec![3, 4]);
        assert_eq!(report.unique_inputs_in_b, 1);
        assert_eq!(report.shared_inputs_in_b, 0);
    }
}
