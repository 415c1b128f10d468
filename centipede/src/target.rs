// SPDX-License-Identifier: Apache-2.0

//! Drives a real external target through the runner/engine shared-memory
//! protocol (§4.8) over a fork-server command (§4.7): the
//! [`RunnerCallbacks`] boundary [`centipede_core::engine::Engine`] expects,
//! wired to an actual binary instead of the in-process mocks used by the
//! core crate's own tests.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use centipede_core::blob_sequence::BlobSequence;
use centipede_core::command::{CommandRunner, CommandSpec, ExecStatus};
use centipede_core::engine::{ExecutionOutcome, RunnerCallbacks};
use centipede_core::error::CentipedeError;
use centipede_core::protocol::{read_batch_result, write_execution_request};

/// The subset of CLI flags (§6) that shape how the target is launched and
/// what `CENTIPEDE_RUNNER_FLAGS` it's handed.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub binary: PathBuf,
    pub extra_binaries: Vec<PathBuf>,
    pub fork_server: bool,
    pub timeout: Option<Duration>,
    pub shmem_size_mb: usize,
    pub use_pc_features: bool,
    pub use_counter_features: bool,
    pub use_cmp_features: bool,
    pub use_dataflow_features: bool,
    pub use_auto_dictionary: bool,
    pub path_level: u8,
    pub crossover_level: u8,
    pub address_space_limit_mb: usize,
    pub rss_limit_mb: usize,
}

/// One launched target: its command runner plus the input/output
/// shared-memory regions the engine owns (it creates both; the runner
/// process only opens them by name, per §4.8/§5 "exactly one producer and
/// one consumer per region per request/response cycle").
struct Launched {
    runner: CommandRunner,
    inputs: BlobSequence,
    outputs: BlobSequence,
}

pub struct ExternalTarget {
    main: Launched,
    extras: Vec<Launched>,
}

fn runner_flags_env(cfg: &TargetConfig, inputs_name: &str, outputs_name: &str) -> String {
    let mut flags = format!(":shmem_inputs={inputs_name}:shmem_outputs={outputs_name}:");
    if cfg.use_pc_features {
        flags.push_str("use_pc_features:");
    }
    if cfg.use_counter_features {
        flags.push_str("use_counter_features:");
    }
    if cfg.use_cmp_features {
        flags.push_str("use_cmp_features:");
    }
    if cfg.use_dataflow_features {
        flags.push_str("use_dataflow_features:");
    }
    if cfg.use_auto_dictionary {
        flags.push_str("use_auto_dictionary:");
    }
    if cfg.path_level > 0 {
        flags.push_str("use_path_features:");
        flags.push_str(&format!("path_level={}:", cfg.path_level));
    }
    flags.push_str(&format!("crossover_level={}:", cfg.crossover_level));
    if let Some(timeout) = cfg.timeout {
        flags.push_str(&format!("timeout_in_seconds={}:", timeout.as_secs()));
    }
    if cfg.address_space_limit_mb > 0 {
        flags.push_str(&format!("address_space_limit_mb={}:", cfg.address_space_limit_mb));
    }
    if cfg.rss_limit_mb > 0 {
        flags.push_str(&format!("rss_limit_mb={}:", cfg.rss_limit_mb));
    }
    flags
}

fn launch(binary: &std::path::Path, cfg: &TargetConfig, tag: &str) -> AnyResult<Launched> {
    let pid = std::process::id();
    let inputs_name = format!("centipede-{pid}-{tag}-inputs");
    let outputs_name = format!("centipede-{pid}-{tag}-outputs");
    let region_size = (cfg.shmem_size_mb.max(1)) << 20;
    let inputs = BlobSequence::new(inputs_name.clone(), region_size)
        .context("creating inputs shared-memory region")?;
    let outputs = BlobSequence::new(outputs_name.clone(), region_size)
        .context("creating outputs shared-memory region")?;

    let mut spec = CommandSpec::new(binary);
    spec.use_forkserver = cfg.fork_server;
    spec.timeout = cfg.timeout;
    spec.env.push((
        "CENTIPEDE_RUNNER_FLAGS".to_string(),
        runner_flags_env(cfg, &inputs_name, &outputs_name),
    ));
    let runner = CommandRunner::new(spec).context("starting target command")?;

    Ok(Launched {
        runner,
        inputs,
        outputs,
    })
}

impl ExternalTarget {
    pub fn new(cfg: &TargetConfig) -> AnyResult<Self> {
        let main = launch(&cfg.binary, cfg, "main")?;
        let mut extras = Vec::with_capacity(cfg.extra_binaries.len());
        for (i, binary) in cfg.extra_binaries.iter().enumerate() {
            extras.push(launch(binary, cfg, &format!("extra{i}"))?);
        }
        Ok(Self { main, extras })
    }

    /// Run `inputs` against one launched target and decode its batch
    /// result. A nonzero exit or timeout is reported as every input in the
    /// batch crashing (§4.10 step 9 re-runs suspected inputs individually to
    /// localize the real culprit).
    fn run_one_target(launched: &mut Launched, inputs: &[Vec<u8>]) -> AnyResult<Vec<ExecutionOutcome>> {
        launched.inputs.reset();
        write_execution_request(&mut launched.inputs, inputs)?;

        let status = launched
            .runner
            .execute(std::path::Path::new("/dev/null"))
            .context("executing batch against target")?;

        match status {
            ExecStatus::Exited(0) => {
                launched.outputs.reset();
                let result = match read_batch_result(&mut launched.outputs, inputs.len()) {
                    Ok(r) => r,
                    Err(CentipedeError::FrameCorrupt(_)) | Err(CentipedeError::EndOfStream) => {
                        // Malformed/partial runner output is treated as the
                        // batch producing no usable features rather than a
                        // fatal error (§7 "I/O failure" tolerance).
                        return Ok(inputs
                            .iter()
                            .map(|_| ExecutionOutcome {
                                features: None,
                                crashed: false,
                            })
                            .collect());
                    }
                    Err(e) => return Err(e.into()),
                };
                Ok(result
                    .inputs
                    .into_iter()
                    .map(|r| ExecutionOutcome {
                        features: r.features,
                        crashed: false,
                    })
                    .collect())
            }
            ExecStatus::Exited(_) | ExecStatus::TimedOut => Ok(inputs
                .iter()
                .map(|_| ExecutionOutcome {
                    features: None,
                    crashed: true,
                })
                .collect()),
        }
    }
}

impl RunnerCallbacks for ExternalTarget {
    fn execute_batch(&mut self, inputs: &[Vec<u8>]) -> centipede_core::error::Result<Vec<ExecutionOutcome>> {
        let mut outcomes = Self::run_one_target(&mut self.main, inputs)
            .map_err(|e| CentipedeError::Precondition(e.to_string()))?;

        // Extras run the same batch purely to surface differential crashes;
        // their features never drive corpus admission, but a crash on an
        // extra still marks that input as crashed (§4.10 step 9).
        for extra in &mut self.extras {
            match Self::run_one_target(extra, inputs) {
                Ok(extra_outcomes) => {
                    for (outcome, extra_outcome) in outcomes.iter_mut().zip(extra_outcomes.iter()) {
                        if extra_outcome.crashed {
                            outcome.crashed = true;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "extra binary batch execution failed");
                }
            }
        }

        Ok(outcomes)
    }

    fn dummy_valid_input(&self) -> Vec<u8> {
        vec![b'\n']
    }
}

impl Drop for ExternalTarget {
    fn drop(&mut self) {
        self.main.inputs.release();
        self.main.outputs.release();
        for extra in &mut self.extras {
            extra.inputs.release();
            extra.outputs.release();
        }
    }
}

