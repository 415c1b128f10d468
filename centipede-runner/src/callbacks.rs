// SPDX-License-Identifier: Apache-2.0

//! The trait a fuzz target implements to plug into the runner loop. Distinct
//! from `centipede_core::engine::RunnerCallbacks`, which is the engine's own
//! view of a runner (a batch of inputs in, features out); this is the
//! target's view (one input in, accept/reject out).

/// Implemented by the user's harness. `test_one_input` drives the target
/// with one input and reports whether it should count toward the corpus.
pub trait TargetCallbacks {
    /// Run the target on `data`. A return value of `false` means "reject":
    /// the runner still executes the input but does not record its
    /// features (used for e.g. malformed inputs the harness wants to skip
    /// without treating as a crash).
    fn test_one_input(&mut self, data: &[u8]) -> bool;

    /// A minimal input known not to crash, used to prime an empty corpus.
    fn dummy_valid_input(&self) -> Vec<u8> {
        vec![0]
    }

    /// Optional target-defined custom mutator. `None` defers to the
    /// runner's built-in byte-level mutator.
    fn custom_mutate(&mut self, _inputs: &[Vec<u8>], _num_mutants: usize) -> Option<Vec<Vec<u8>>> {
        None
    }
}

#[cfg(test)]
pub(crate) struct AcceptAll;

#[cfg(test)]
impl TargetCallbacks for AcceptAll {
    fn test_one_input(&mut self, _data: &[u8]) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dummy_input_is_non_empty() {
        let cb = AcceptAll;
        assert!(!cb.dummy_valid_input().is_empty());
    }

    #[test]
    fn default_custom_mutate_defers_to_builtin() {
        let mut cb = AcceptAll;
        assert!(cb.custom_mutate(&[vec![1]], 4).is_none());
    }
}
