// SPDX-License-Identifier: Apache-2.0

//! Target-side coverage collection runtime. Instruments a fuzz harness
//! links against to report back the features it touches on each input,
//! either driven directly in-process (single-process engine use, tests) or
//! via the shared-memory protocol the engine drives across a fork/exec
//! boundary.

pub mod callbacks;
pub mod execution;
pub mod flags;
pub mod state;
pub mod watchdog;

pub use callbacks::TargetCallbacks;
pub use centipede_core::error::{CentipedeError, Result};
pub use centipede_core::protocol::Stats;

use centipede_core::blob_sequence::BlobSequence;
use centipede_core::protocol::{read_execution_request, write_input_result};

/// Run every input in `inputs` directly in this process, without any shared
/// memory or subprocess involved. Used by an in-process engine and by
/// tests; a real fork-server deployment uses [`run_from_shmem_loop`]
/// instead.
pub fn run_in_process_loop(
    callbacks: &mut impl TargetCallbacks,
    inputs: &[Vec<u8>],
    use_pc_counters: bool,
) -> Vec<(Option<Vec<centipede_core::feature::Feature>>, Stats)> {
    inputs
        .iter()
        .map(|input| execution::run_one(callbacks, input, use_pc_counters))
        .collect()
}

/// The fork-server entry point: read one execution request from
/// `inputs_shmem`, run every input through `callbacks`, and write the
/// output tuples to `outputs_shmem`. Call once per wakeup; the surrounding
/// fork-server loop (outside this crate) decides when to call again.
pub fn run_from_shmem_loop(
    callbacks: &mut impl TargetCallbacks,
    inputs_shmem_name: &str,
    outputs_shmem_name: &str,
    use_pc_counters: bool,
) -> Result<()> {
    let mut inputs_seq = BlobSequence::open(inputs_shmem_name)?;
    let request = read_execution_request(&mut inputs_seq)?;

    let mut outputs_seq = BlobSequence::open(outputs_shmem_name)?;
    outputs_seq.reset();
    for input in &request.inputs {
        let (features, stats) = execution::run_one(callbacks, input, use_pc_counters);
        write_input_result(&mut outputs_seq, features.as_deref(), stats)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use centipede_core::feature::domain_of;

    struct EvenOddCounter;

    impl TargetCallbacks for EvenOddCounter {
        fn test_one_input(&mut self, data: &[u8]) -> bool {
            let bucket = if data.first().copied().unwrap_or(0) % 2 == 0 { 0 } else { 1 };
            execution::record_counter(bucket);
            true
        }
    }

    #[test]
    fn in_process_loop_reports_one_result_per_input() {
        let mut cb = EvenOddCounter;
        let inputs = vec![vec![2], vec![3], vec![4]];
        let results = run_in_process_loop(&mut cb, &inputs, true);
        assert_eq!(results.len(), 3);
        for (features, _stats) in &results {
            let features = features.as_ref().unwrap();
            assert!(features
                .iter()
                .all(|f| domain_of(*f) == centipede_core::feature::Domain::PcCounters));
        }
    }

    #[test]
    fn shmem_loop_round_trips_through_real_shared_memory() {
        let tag = std::process::id();
        let inputs_name = format!("centipede-runner-test-inputs-{tag}");
        let outputs_name = format!("centipede-runner-test-outputs-{tag}");

        let mut inputs_seq = BlobSequence::new(inputs_name.clone(), 1 << 16).unwrap();
        centipede_core::protocol::write_execution_request(
            &mut inputs_seq,
            &[vec![2], vec![3]],
        )
        .unwrap();
        inputs_seq.reset();
        let _outputs_seq = BlobSequence::new(outputs_name.clone(), 1 << 16).unwrap();

        let mut cb = EvenOddCounter;
        run_from_shmem_loop(&mut cb, &inputs_name, &outputs_name, true).unwrap();

        let mut reopened = BlobSequence::open(&outputs_name).unwrap();
        let result = centipede_core::protocol::read_batch_result(&mut reopened, 2).unwrap();
        assert_eq!(result.inputs.len(), 2);
        assert!(result.inputs[0].features.is_some());
        assert!(result.inputs[1].features.is_some());
    }
}
