// SPDX-License-Identifier: Apache-2.0

//! Environment & paths (§4.11): deterministic file-path derivation from
//! `workdir`, `binary_name`, `binary_hash`, and zero-padded shard indices,
//! plus the `"flag1=v1,v2,…:flag2=…"` experiment-string combinator that
//! assigns the cartesian product of flag values across worker threads.

use std::path::{Path, PathBuf};

use crate::error::{CentipedeError, Result};

/// Shard indices are rendered zero-padded to 6 digits (§4.11).
pub fn shard_index_string(index: usize) -> String {
    format!("{index:06}")
}

/// Deterministic layout of every path the engine reads or writes under
/// `workdir` (§6 "On-disk layout").
#[derive(Debug, Clone)]
pub struct Environment {
    pub workdir: PathBuf,
    pub binary_name: String,
    pub binary_hash: String,
    pub total_shards: usize,
    pub first_shard_index: usize,
    pub num_threads: usize,
}

impl Environment {
    pub fn validate(&self) -> Result<()> {
        if self.total_shards < self.num_threads {
            return Err(CentipedeError::Config(
                "total_shards must be >= num_threads".into(),
            ));
        }
        if self.total_shards == 0 || self.num_threads == 0 {
            return Err(CentipedeError::Config(
                "total_shards and num_threads must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn corpus_path(&self, shard: usize) -> PathBuf {
        self.workdir.join(format!("corpus.{}", shard_index_string(shard)))
    }

    pub fn distilled_path(&self, shard: usize) -> PathBuf {
        self.workdir
            .join(format!("distilled-{}.{}", self.binary_name, shard_index_string(shard)))
    }

    fn binary_hash_dir(&self) -> PathBuf {
        self.workdir
            .join(format!("{}-{}", self.binary_name, self.binary_hash))
    }

    pub fn features_path(&self, shard: usize) -> PathBuf {
        self.binary_hash_dir()
            .join(format!("features.{}", shard_index_string(shard)))
    }

    pub fn coverage_report_path(&self, shard: usize, suffix: Option<&str>) -> PathBuf {
        self.workdir.join(format!(
            "coverage-report-{}.{}{}.txt",
            self.binary_name,
            shard_index_string(shard),
            suffix.map(|s| format!(".{s}")).unwrap_or_default(),
        ))
    }

    pub fn corpus_stats_path(&self, shard: usize, suffix: Option<&str>) -> PathBuf {
        self.workdir.join(format!(
            "corpus-stats-{}.{}{}.json",
            self.binary_name,
            shard_index_string(shard),
            suffix.map(|s| format!(".{s}")).unwrap_or_default(),
        ))
    }

    pub fn crashes_dir(&self) -> PathBuf {
        self.workdir.join("crashes")
    }

    pub fn crash_reproducer_path(&self, input_sha1: &str) -> PathBuf {
        self.crashes_dir().join(input_sha1)
    }

    pub fn all_shard_indices(&self) -> impl Iterator<Item = usize> {
        0..self.total_shards
    }

    pub fn owned_shard_index_for_thread(&self, thread_index: usize) -> usize {
        self.first_shard_index + thread_index
    }
}

/// One resolved point in an experiment's flag-value cartesian product.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExperimentArm {
    pub values: Vec<(String, String)>,
}

impl ExperimentArm {
    /// Compact positional tag, e.g. `"0-1-0"` for arm `(0, 1, 0)` (§4.11
    /// "experiment_name").
    pub fn name(&self, combination_index: &[usize]) -> String {
        combination_index
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join("-")
    }
}

/// Parse `"flag1=v1,v2,…:flag2=…"` into per-flag value lists, then expand
/// the cartesian product into one [`ExperimentArm`] per combination
/// (§4.11). Disables cross-shard loading for all arms (left to the caller).
pub fn parse_experiment(spec: &str) -> Result<Vec<ExperimentArm>> {
    if spec.is_empty() {
        return Ok(Vec::new());
    }
    let mut flags: Vec<(String, Vec<String>)> = Vec::new();
    for clause in spec.split(':') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        let (name, values) = clause
            .split_once('=')
            .ok_or_else(|| CentipedeError::Config(format!("malformed experiment clause: {clause}")))?;
        let values: Vec<String> = values.split(',').map(|v| v.trim().to_string()).collect();
        if values.is_empty() || values.iter().any(|v| v.is_empty()) {
            return Err(CentipedeError::Config(format!(
                "experiment flag {name} has an empty value"
            )));
        }
        flags.push((name.to_string(), values));
    }
    if flags.is_empty() {
        return Err(CentipedeError::Config("empty experiment spec".into()));
    }

    let mut arms = vec![ExperimentArm::default()];
    for (name, values) in &flags {
        let mut expanded = Vec::with_capacity(arms.len() * values.len());
        for arm in &arms {
            for value in values {
                let mut next = arm.clone();
                next.values.push((name.clone(), value.clone()));
                expanded.push(next);
            }
        }
        arms = expanded;
    }
    Ok(arms)
}

/// Required by §4.11: `num_threads mod |combinations| == 0`.
pub fn validate_experiment_thread_count(num_threads: usize, arms: &[ExperimentArm]) -> Result<()> {
    if arms.is_empty() {
        return Ok(());
    }
    if num_threads % arms.len() != 0 {
        return Err(CentipedeError::Config(format!(
            "num_threads ({num_threads}) must be a multiple of the experiment's {} combinations",
            arms.len()
        )));
    }
    Ok(())
}

/// Which arm owns `thread_index`, assuming threads are assigned round-robin
/// in blocks of `num_threads / arms.len()`.
pub fn arm_for_thread(thread_index: usize, num_threads: usize, arms: &[ExperimentArm]) -> usize {
    if arms.is_empty() {
        return 0;
    }
    let block = num_threads / arms.len();
    (thread_index / block.max(1)).min(arms.len() - 1)
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment {
            workdir: PathBuf::from("/tmp/workdir"),
            binary_name: "target".into(),
            binary_hash: "deadbeef".into(),
            total_shards: 4,
            first_shard_index: 0,
            num_threads: 4,
        }
    }

    #[test]
    fn shard_indices_are_zero_padded_to_six_digits() {
        assert_eq!(shard_index_string(7), "000007");
    }

    #[test]
    fn paths_follow_workdir_layout() {
        let e = env();
        assert_eq!(
            e.corpus_path(3),
            PathBuf::from("/tmp/workdir/corpus.000003")
        );
        assert_eq!(
            e.features_path(3),
            PathBuf::from("/tmp/workdir/target-deadbeef/features.000003")
        );
        assert_eq!(
            e.distilled_path(3),
            PathBuf::from("/tmp/workdir/distilled-target.000003")
        );
    }

    #[test]
    fn validate_rejects_too_few_shards() {
        let mut e = env();
        e.total_shards = 2;
        e.num_threads = 4;
        assert!(e.validate().is_err());
    }

    #[test]
    fn experiment_expands_cartesian_product() {
        let arms = parse_experiment("a=1,2:b=x,y,z").unwrap();
        assert_eq!(arms.len(), 6);
        assert!(arms
            .iter()
            .any(|a| a.values == vec![("a".to_string(), "1".to_string()), ("b".to_string(), "y".to_string())]));
    }

    #[test]
    fn experiment_requires_divisible_thread_count() {
        let arms = parse_experiment("a=1,2,3").unwrap();
        assert!(validate_experiment_thread_count(4, &arms).is_err());
        assert!(validate_experiment_thread_count(6, &arms).is_ok());
    }

    #[test]
    fn malformed_experiment_clause_is_a_config_error() {
        assert!(matches!(
            parse_experiment("a-missing-equals"),
            Err(CentipedeError::Config(_))
        ));
    }
}
