// SPDX-License-Identifier: Apache-2.0

//! CLI flag surface (§6), realized as `clap::Parser`/`Subcommand` structs
//! with doc comments as `--help` text, matching
//! `simics-fuzz/src/args/mod.rs`'s style of one field per flag.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "centipede", version, about = "Distributed coverage-guided fuzzing engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the fuzzing loop against a target binary.
    Fuzz(FuzzArgs),
    /// Diff PC coverage between two workdirs' corpora.
    Analyze(AnalyzeArgs),
    /// Shrink a crashing input.
    Minimize(MinimizeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct FuzzArgs {
    /// Path to the instrumented target binary.
    #[arg(long)]
    pub binary: PathBuf,
    /// Binary used for coverage collection, if different from `--binary`.
    #[arg(long)]
    pub coverage_binary: Option<PathBuf>,
    /// Extra binaries to execute the same batch through; their coverage is
    /// ignored, only crashes are surfaced.
    #[arg(long)]
    pub extra_binaries: Vec<PathBuf>,
    /// Directory holding this fuzzing session's shard files and telemetry.
    #[arg(long)]
    pub workdir: PathBuf,
    /// Additional workdir to merge newly covering inputs from at startup.
    #[arg(long)]
    pub merge_from: Option<PathBuf>,

    /// Total number of shards in this fuzzing session.
    #[arg(long, default_value_t = 1)]
    pub total_shards: usize,
    /// Index of the first shard this process owns.
    #[arg(long, default_value_t = 0)]
    pub first_shard_index: usize,
    /// Number of worker threads this process runs.
    #[arg(long, default_value_t = 1)]
    pub num_threads: usize,
    /// Shorthand that sets `total_shards`, `num_threads` all equal to `j`.
    #[arg(short = 'j', long)]
    pub j: Option<usize>,

    /// Total number of inputs to run, across all batches (0 = sync only).
    #[arg(long, default_value_t = 0)]
    pub num_runs: u64,
    /// Inputs per batch sent to the target at once.
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,
    /// Number of seed inputs sampled per batch to mutate from.
    #[arg(long, default_value_t = 1)]
    pub mutate_batch_size: usize,
    /// Load a random sibling shard once every this many batches (0 = off).
    #[arg(long, default_value_t = 0)]
    pub load_other_shard_frequency: usize,

    /// Address space limit for the target, in MiB (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub address_space_limit_mb: usize,
    /// RSS limit for the target, in MiB (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub rss_limit_mb: usize,
    /// Per-execution timeout, in seconds (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,
    /// Maximum number of records kept in the in-memory corpus.
    #[arg(long, default_value_t = usize::MAX)]
    pub max_corpus_size: usize,
    /// Prune once the active corpus has grown by this many records since
    /// the last prune (0 = never prune).
    #[arg(long, default_value_t = 0)]
    pub prune_frequency: usize,
    /// Feature-set frequency saturation threshold, 1..=255.
    #[arg(long, default_value_t = 100)]
    pub feature_frequency_threshold: u8,

    /// Collect edge-counter features.
    #[arg(long, default_value_t = true)]
    pub use_pc_features: bool,
    /// Collect quantized 8-bit counter features.
    #[arg(long, default_value_t = true)]
    pub use_counter_features: bool,
    /// Collect CMP-argument features.
    #[arg(long, default_value_t = false)]
    pub use_cmp_features: bool,
    /// Collect data-flow features.
    #[arg(long, default_value_t = false)]
    pub use_dataflow_features: bool,
    /// Bounded-path ring-buffer depth, 0..=100 (0 = off).
    #[arg(long, default_value_t = 0)]
    pub path_level: u8,
    /// Synthesize PC-pair features from observed PC indices (quadratic).
    #[arg(long, default_value_t = false)]
    pub use_pcpair_features: bool,
    /// Weight corpus sampling by feature rarity instead of uniformly.
    #[arg(long, default_value_t = true)]
    pub use_corpus_weights: bool,
    /// Bias corpus weighting towards the coverage frontier.
    #[arg(long, default_value_t = false)]
    pub use_coverage_frontier: bool,
    /// Apply crossover during mutation, 0..=100 (0 = off).
    #[arg(long, default_value_t = 0)]
    pub crossover_level: u8,
    /// Seed the mutator's dictionary with auto-discovered CMP arguments.
    #[arg(long, default_value_t = false)]
    pub use_auto_dictionary: bool,

    /// Mirror admitted inputs into this directory, one file per sha1.
    #[arg(long)]
    pub corpus_dir: Option<PathBuf>,
    /// Copy every shard's corpus into this local directory, then exit.
    #[arg(long)]
    pub save_corpus_to_local_dir: Option<PathBuf>,
    /// Import every file in this local directory into the sharded corpus,
    /// then exit.
    #[arg(long)]
    pub export_corpus_from_local_dir: Option<PathBuf>,
    /// Dictionary file (native packed-blob or AFL/libFuzzer text).
    #[arg(long)]
    pub dictionary: Option<PathBuf>,

    /// Run the target through a persistent fork server instead of one
    /// subshell invocation per execution.
    #[arg(long, default_value_t = true)]
    pub fork_server: bool,
    /// Load every shard at startup instead of just the owned one.
    #[arg(long, default_value_t = false)]
    pub full_sync: bool,
    /// Rewrite this shard's active corpus as a distilled file, then exit.
    #[arg(long, default_value_t = false)]
    pub distill_shards: bool,
    /// Stop the whole process as soon as any batch crashes.
    #[arg(long, default_value_t = false)]
    pub exit_on_crash: bool,
    /// Maximum crash reproducers saved per crashing batch.
    #[arg(long, default_value_t = 10)]
    pub num_crash_reports: usize,
    /// Size of each worker's shared-memory region, in MiB.
    #[arg(long, default_value_t = 128)]
    pub shmem_size_mb: usize,
    /// `"flag1=v1,v2,…:flag2=…"` cartesian-product experiment spec.
    #[arg(long)]
    pub experiment: Option<String>,
    /// RNG seed (0 picks a seed derived from the shard index).
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Fail startup if the binary's `--dump_pc_table` can't be collected.
    #[arg(long, default_value_t = false)]
    pub require_pc_table: bool,
}

#[derive(Args, Debug, Clone)]
pub struct AnalyzeArgs {
    /// Baseline corpus workdir ("A").
    #[arg(long)]
    pub workdir_a: PathBuf,
    /// Candidate corpus workdir ("B"), compared against A.
    #[arg(long)]
    pub workdir_b: PathBuf,
    /// Binary used to re-run both corpora's inputs for coverage.
    #[arg(long)]
    pub binary: PathBuf,
    /// `llvm-symbolizer`-compatible binary used to describe PCs only
    /// covered by B.
    #[arg(long)]
    pub symbolizer_path: Option<PathBuf>,
    /// Total shards making up each corpus.
    #[arg(long, default_value_t = 1)]
    pub total_shards: usize,
    /// Run the target through a persistent fork server.
    #[arg(long, default_value_t = true)]
    pub fork_server: bool,
    /// Per-execution timeout, in seconds (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,
    /// Size of the shared-memory region, in MiB.
    #[arg(long, default_value_t = 128)]
    pub shmem_size_mb: usize,
}

#[derive(Args, Debug, Clone)]
pub struct MinimizeArgs {
    /// Path to the instrumented target binary.
    #[arg(long)]
    pub binary: PathBuf,
    /// Path to the crashing input to shrink.
    #[arg(long)]
    pub input: PathBuf,
    /// Directory successively smaller reproducers are written to.
    #[arg(long)]
    pub workdir: PathBuf,
    /// RNG seed for the mutator driving minimization.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Run the target through a persistent fork server.
    #[arg(long, default_value_t = true)]
    pub fork_server: bool,
    /// Per-execution timeout, in seconds (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub timeout: u64,
    /// Size of the shared-memory region, in MiB.
    #[arg(long, default_value_t = 128)]
    pub shmem_size_mb: usize,
}
