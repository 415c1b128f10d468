// SPDX-License-Identifier: Apache-2.0

//! Crash minimization loop (§4.12): repeatedly mutate the smallest known
//! crasher(s), keep only mutants that crash and are not larger than the
//! current smallest, until no further shrink is found.

use std::path::Path;

use sha1::{Digest, Sha1};

use crate::engine::RunnerCallbacks;
use crate::error::Result;
use crate::mutator::Mutator;

/// How many mutants to try per round against the current worklist.
const MUTANTS_PER_ROUND: usize = 64;
/// Stop after this many rounds without a smaller crasher (bounds an
/// otherwise potentially unbounded search).
const MAX_STALE_ROUNDS: usize = 50;

#[derive(Debug)]
pub struct MinimizeResult {
    pub smaller_found: bool,
    pub smallest: Vec<u8>,
    pub worklist: Vec<Vec<u8>>,
}

fn still_crashes(callbacks: &mut impl RunnerCallbacks, input: &[u8]) -> Result<bool> {
    let outcomes = callbacks.execute_batch(&[input.to_vec()])?;
    Ok(outcomes.first().map(|o| o.crashed).unwrap_or(false))
}

/// Minimize a crashy input `x0` (§4.12). Successful shrinks are written to
/// `crash_dir` as they're found; returns success iff the worklist ends up
/// containing a crasher smaller than `x0`.
pub fn minimize(
    x0: Vec<u8>,
    callbacks: &mut impl RunnerCallbacks,
    mutator: &mut Mutator,
    crash_dir: &Path,
) -> Result<MinimizeResult> {
    let mut worklist = vec![x0.clone()];
    let mut smallest = x0.clone();
    let mut stale_rounds = 0usize;

    while stale_rounds < MAX_STALE_ROUNDS {
        let current_len = smallest.len();
        let mutants = mutator.mutate_many(&worklist, MUTANTS_PER_ROUND, false)?;
        let mut found_smaller = false;

        for mutant in mutants {
            if mutant.len() >= current_len {
                continue;
            }
            if still_crashes(callbacks, &mutant)? {
                std::fs::create_dir_all(crash_dir)?;
                let hex: String = Sha1::digest(&mutant)
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect();
                std::fs::write(crash_dir.join(hex), &mutant)?;
                worklist.push(mutant.clone());
                if mutant.len() < smallest.len() {
                    smallest = mutant;
                    found_smaller = true;
                }
            }
        }

        if found_smaller {
            stale_rounds = 0;
        } else {
            stale_rounds += 1;
        }
    }

    Ok(MinimizeResult {
        smaller_found: smallest.len() < x0.len(),
        smallest,
        worklist,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecutionOutcome;
    use tempfile::tempdir;

    /// Crashes iff the input contains byte `0xCC`; minimization should
    /// shrink toward `[0xCC]`.
    struct CrashesOnMagicByte;

    impl RunnerCallbacks for CrashesOnMagicByte {
        fn execute_batch(&mut self, inputs: &[Vec<u8>]) -> Result<Vec<ExecutionOutcome>> {
            Ok(inputs
                .iter()
                .map(|input| ExecutionOutcome {
                    features: None,
                    crashed: input.contains(&0xCC),
                })
                .collect())
        }
        fn dummy_valid_input(&self) -> Vec<u8> {
            vec![0]
        }
    }

    #[test]
    fn shrinks_a_crasher() {
        let dir = tempdir().unwrap();
        let mut mutator = Mutator::new(123);
        let mut cb = CrashesOnMagicByte;
        let x0 = vec![1, 2, 3, 0xCC, 4, 5, 6, 7, 8];
        let result = minimize(x0.clone(), &mut cb, &mut mutator, dir.path()).unwrap();
        assert!(result.smaller_found);
        assert!(result.smallest.len() < x0.len());
        assert!(result.smallest.contains(&0xCC));
    }
}
