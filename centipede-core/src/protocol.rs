// SPDX-License-Identifier: Apache-2.0

//! Runner ↔ engine shared-memory protocol (§4.8): request framing for
//! execution and mutation batches, and the per-input output tuple grammar
//! `[InputBegin, {Features, Stats}*, InputEnd]` the runner writes back.

use crate::blob_sequence::{Blob, BlobSequence};
use crate::error::{CentipedeError, Result};
use crate::feature::Feature;

/// Reserved blob tags. `0` stays reserved as the sentinel in
/// [`crate::blob_sequence`].
pub mod tag {
    pub const NUM_INPUTS: u64 = 1;
    pub const NUM_MUTANTS: u64 = 2;
    pub const INPUT_DATA: u64 = 3;
    pub const EXECUTION_REQUEST: u64 = 4;
    pub const MUTATION_REQUEST: u64 = 5;
    pub const INPUT_BEGIN: u64 = 6;
    pub const INPUT_END: u64 = 7;
    pub const FEATURES: u64 = 8;
    pub const STATS: u64 = 9;
}

fn u64_blob(tag: u64, value: u64) -> Blob {
    Blob {
        tag,
        bytes: value.to_le_bytes().to_vec(),
    }
}

fn read_u64(blob: &Blob) -> Result<u64> {
    let bytes: [u8; 8] = blob
        .bytes
        .as_slice()
        .try_into()
        .map_err(|_| CentipedeError::FrameCorrupt("expected an 8-byte count blob".into()))?;
    Ok(u64::from_le_bytes(bytes))
}

/// Write an execution request: tag byte, `num_inputs`, then the data blobs
/// (§4.8).
pub fn write_execution_request(seq: &mut BlobSequence, inputs: &[Vec<u8>]) -> Result<()> {
    if !seq.write(&u64_blob(tag::EXECUTION_REQUEST, 0))? {
        return Err(CentipedeError::FrameCorrupt("shmem too small for request tag".into()));
    }
    if !seq.write(&u64_blob(tag::NUM_INPUTS, inputs.len() as u64))? {
        return Err(CentipedeError::FrameCorrupt("shmem too small for num_inputs".into()));
    }
    for input in inputs {
        if !seq.write(&Blob {
            tag: tag::INPUT_DATA,
            bytes: input.clone(),
        })? {
            return Err(CentipedeError::FrameCorrupt("shmem too small for input data".into()));
        }
    }
    Ok(())
}

/// Write a mutation request: tag byte, `num_mutants`, `num_inputs`, then the
/// input data blobs (§4.8).
pub fn write_mutation_request(
    seq: &mut BlobSequence,
    num_mutants: u64,
    inputs: &[Vec<u8>],
) -> Result<()> {
    if !seq.write(&u64_blob(tag::MUTATION_REQUEST, 0))? {
        return Err(CentipedeError::FrameCorrupt("shmem too small for request tag".into()));
    }
    if !seq.write(&u64_blob(tag::NUM_MUTANTS, num_mutants))? {
        return Err(CentipedeError::FrameCorrupt("shmem too small for num_mutants".into()));
    }
    if !seq.write(&u64_blob(tag::NUM_INPUTS, inputs.len() as u64))? {
        return Err(CentipedeError::FrameCorrupt("shmem too small for num_inputs".into()));
    }
    for input in inputs {
        if !seq.write(&Blob {
            tag: tag::INPUT_DATA,
            bytes: input.clone(),
        })? {
            return Err(CentipedeError::FrameCorrupt("shmem too small for input data".into()));
        }
    }
    Ok(())
}

/// A decoded execution request.
pub struct ExecutionRequest {
    pub inputs: Vec<Vec<u8>>,
}

pub fn read_execution_request(seq: &mut BlobSequence) -> Result<ExecutionRequest> {
    let _tag = seq.read()?.ok_or(CentipedeError::EndOfStream)?;
    let count_blob = seq.read()?.ok_or(CentipedeError::EndOfStream)?;
    let num_inputs = read_u64(&count_blob)?;
    let mut inputs = Vec::with_capacity(num_inputs as usize);
    for _ in 0..num_inputs {
        let blob = seq.read()?.ok_or(CentipedeError::EndOfStream)?;
        inputs.push(blob.bytes);
    }
    Ok(ExecutionRequest { inputs })
}

/// Fixed-size per-input execution statistics (§4.8).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub prep_usec: u64,
    pub exec_usec: u64,
    pub post_usec: u64,
    pub peak_rss_mb: u64,
}

impl Stats {
    const LEN: usize = 32;

    fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.prep_usec.to_le_bytes());
        out.extend_from_slice(&self.exec_usec.to_le_bytes());
        out.extend_from_slice(&self.post_usec.to_le_bytes());
        out.extend_from_slice(&self.peak_rss_mb.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(CentipedeError::FrameCorrupt(format!(
                "stats blob must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let word = |range: std::ops::Range<usize>| {
            u64::from_le_bytes(bytes[range].try_into().unwrap())
        };
        Ok(Self {
            prep_usec: word(0..8),
            exec_usec: word(8..16),
            post_usec: word(16..24),
            peak_rss_mb: word(24..32),
        })
    }
}

fn features_to_bytes(features: &[Feature]) -> Vec<u8> {
    let mut out = Vec::with_capacity(features.len() * 8);
    for f in features {
        out.extend_from_slice(&f.0.to_le_bytes());
    }
    out
}

fn features_from_bytes(bytes: &[u8]) -> Result<Vec<Feature>> {
    if bytes.len() % 8 != 0 {
        return Err(CentipedeError::FrameCorrupt(
            "feature array size must be divisible by 8".into(),
        ));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| Feature(u64::from_le_bytes(c.try_into().unwrap())))
        .collect())
}

/// One input's runner output: its feature vector (absent when the input
/// crashed or produced no feature blob) and its timing/RSS stats.
#[derive(Debug, Clone, Default)]
pub struct InputResult {
    pub features: Option<Vec<Feature>>,
    pub stats: Stats,
}

/// The assembled per-batch result: one [`InputResult`] per requested input,
/// in request order (§4.8, §5: "output tuples appear in input order").
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub inputs: Vec<InputResult>,
}

/// Write the runner-side output for one input:
/// `[InputBegin, Features?, Stats, InputEnd]` (§4.9 step 5). A `None`
/// feature vector (rejected input) omits the `Features` blob entirely.
pub fn write_input_result(
    seq: &mut BlobSequence,
    features: Option<&[Feature]>,
    stats: Stats,
) -> Result<()> {
    let ok = seq.write(&u64_blob(tag::INPUT_BEGIN, 0))?
        && (features.is_none()
            || seq.write(&Blob {
                tag: tag::FEATURES,
                bytes: features_to_bytes(features.unwrap()),
            })?)
        && seq.write(&Blob {
            tag: tag::STATS,
            bytes: stats.to_bytes(),
        })?
        && seq.write(&u64_blob(tag::INPUT_END, 0))?;
    if !ok {
        return Err(CentipedeError::FrameCorrupt(
            "shmem too small for input result".into(),
        ));
    }
    Ok(())
}

/// Parse the runner's output blobs into a [`BatchResult`] covering up to
/// `expected_inputs` tuples. Enforces `begin_count == end_count` at every
/// interior boundary and that total tuples never exceed what was requested
/// (§4.8 "Parser invariants").
pub fn read_batch_result(seq: &mut BlobSequence, expected_inputs: usize) -> Result<BatchResult> {
    let mut inputs = Vec::with_capacity(expected_inputs);
    let mut begin_count = 0usize;
    let mut end_count = 0usize;

    while let Some(blob) = seq.read()? {
        if blob.tag != tag::INPUT_BEGIN {
            return Err(CentipedeError::FrameCorrupt(
                "expected InputBegin at tuple boundary".into(),
            ));
        }
        begin_count += 1;
        if begin_count > expected_inputs {
            return Err(CentipedeError::FrameCorrupt(
                "runner produced more tuples than requested".into(),
            ));
        }

        let mut features = None;
        let mut stats = Stats::default();
        loop {
            let blob = seq.read()?.ok_or(CentipedeError::FrameCorrupt(
                "truncated output tuple".into(),
            ))?;
            match blob.tag {
                tag::FEATURES => features = Some(features_from_bytes(&blob.bytes)?),
                tag::STATS => stats = Stats::from_bytes(&blob.bytes)?,
                tag::INPUT_END => {
                    end_count += 1;
                    break;
                }
                other => {
                    return Err(CentipedeError::FrameCorrupt(format!(
                        "unexpected tag {other} inside output tuple"
                    )))
                }
            }
        }
        debug_assert_eq!(begin_count, end_count);
        inputs.push(InputResult { features, stats });
    }

    Ok(BatchResult { inputs })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(name: &str) -> BlobSequence {
        BlobSequence::new(
            format!(
                "centipede-proto-test-{name}-{}",
                std::process::id()
            ),
            1 << 16,
        )
        .unwrap()
    }

    #[test]
    fn execution_request_round_trips() {
        let mut s = seq("exec");
        let inputs = vec![vec![1, 2, 3], vec![], vec![9u8; 40]];
        write_execution_request(&mut s, &inputs).unwrap();
        s.reset();
        let decoded = read_execution_request(&mut s).unwrap();
        assert_eq!(decoded.inputs, inputs);
    }

    #[test]
    fn batch_result_round_trips_with_crash_gap() {
        let mut s = seq("batch");
        let f1 = vec![Feature(1), Feature(2)];
        let stats1 = Stats {
            prep_usec: 1,
            exec_usec: 2,
            post_usec: 3,
            peak_rss_mb: 4,
        };
        write_input_result(&mut s, Some(&f1), stats1).unwrap();
        // Second input "crashed": no features blob.
        write_input_result(&mut s, None, Stats::default()).unwrap();
        s.reset();

        let result = read_batch_result(&mut s, 2).unwrap();
        assert_eq!(result.inputs.len(), 2);
        assert_eq!(result.inputs[0].features, Some(f1));
        assert_eq!(result.inputs[0].stats, stats1);
        assert_eq!(result.inputs[1].features, None);
    }

    #[test]
    fn more_tuples_than_requested_is_an_error() {
        let mut s = seq("overrun");
        write_input_result(&mut s, None, Stats::default()).unwrap();
        write_input_result(&mut s, None, Stats::default()).unwrap();
        s.reset();
        assert!(read_batch_result(&mut s, 1).is_err());
    }
}
