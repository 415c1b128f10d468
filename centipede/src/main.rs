// SPDX-License-Identifier: Apache-2.0

//! `centipede` CLI: wires the §6 flag surface to [`centipede_core::engine::Engine`]
//! driven against a real external target via [`target::ExternalTarget`].

mod args;
mod dictionary;
mod logging;
mod pc_table;
mod target;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use centipede_core::engine::{self, EarlyExit, Engine, EngineConfig};
use centipede_core::environment::{self, Environment};
use centipede_core::minimize;
use centipede_core::mutator::Mutator;
use centipede_core::symbol::{LlvmSymbolTable, NoopSymbolTable, SymbolTable};
use clap::Parser;
use sha1::{Digest, Sha1};

use args::{AnalyzeArgs, Cli, Command, FuzzArgs, MinimizeArgs};
use target::{ExternalTarget, TargetConfig};

fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Fuzz(args) => run_fuzz(args),
        Command::Analyze(args) => run_analyze(args),
        Command::Minimize(args) => run_minimize(args),
    }
}

fn binary_hash(binary: &Path) -> String {
    match std::fs::read(binary) {
        Ok(bytes) => {
            let digest = Sha1::digest(&bytes);
            digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
        }
        Err(_) => "unknownhash".to_string(),
    }
}

fn binary_name(binary: &Path) -> String {
    binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string())
}

fn target_config(args: &FuzzArgs) -> TargetConfig {
    TargetConfig {
        binary: args.binary.clone(),
        extra_binaries: args.extra_binaries.clone(),
        fork_server: args.fork_server,
        timeout: (args.timeout > 0).then(|| Duration::from_secs(args.timeout)),
        shmem_size_mb: args.shmem_size_mb,
        use_pc_features: args.use_pc_features,
        use_counter_features: args.use_counter_features,
        use_cmp_features: args.use_cmp_features,
        use_dataflow_features: args.use_dataflow_features,
        use_auto_dictionary: args.use_auto_dictionary,
        path_level: args.path_level,
        crossover_level: args.crossover_level,
        address_space_limit_mb: args.address_space_limit_mb,
        rss_limit_mb: args.rss_limit_mb,
    }
}

/// Applies one `"flag=value"` override from an experiment arm (§4.11) onto
/// a thread's engine config. Unknown flags are ignored rather than fatal,
/// since an experiment spec may exercise flags this build doesn't model.
fn apply_experiment_override(config: &mut EngineConfig, flag: &str, value: &str) {
    match flag {
        "batch_size" => {
            if let Ok(v) = value.parse() {
                config.mutate_batch_size = v;
            }
        }
        "frequency_threshold" | "feature_frequency_threshold" => {
            if let Ok(v) = value.parse() {
                config.frequency_threshold = v;
            }
        }
        "use_pcpair_features" => config.use_pcpair_features = value == "1" || value == "true",
        "use_coverage_frontier" => config.use_coverage_frontier = value == "1" || value == "true",
        "use_corpus_weights" => config.use_corpus_weights = value == "1" || value == "true",
        "max_corpus_size" => {
            if let Ok(v) = value.parse() {
                config.max_corpus_size = v;
            }
        }
        "prune_frequency" => {
            if let Ok(v) = value.parse() {
                config.prune_frequency = v;
            }
        }
        other => tracing::debug!(flag = other, "ignoring unrecognized experiment flag"),
    }
}

fn run_fuzz(mut args: FuzzArgs) -> Result<()> {
    if let Some(j) = args.j {
        args.total_shards = j;
        args.num_threads = j;
    }
    if args.feature_frequency_threshold == 0 {
        bail!("feature_frequency_threshold must be in 1..=255");
    }

    let env = Environment {
        workdir: args.workdir.clone(),
        binary_name: binary_name(&args.binary),
        binary_hash: binary_hash(&args.binary),
        total_shards: args.total_shards,
        first_shard_index: args.first_shard_index,
        num_threads: args.num_threads,
    };
    env.validate().context("invalid sharding configuration")?;
    environment::ensure_dir(&env.workdir)?;

    if let Some(dir) = &args.save_corpus_to_local_dir {
        engine::save_corpus_to_local_dir(&env, dir)?;
        return Ok(());
    }
    if let Some(dir) = &args.export_corpus_from_local_dir {
        engine::export_corpus_from_local_dir(&env, dir)?;
        return Ok(());
    }

    let arms = match &args.experiment {
        Some(spec) => {
            let arms = environment::parse_experiment(spec)?;
            environment::validate_experiment_thread_count(env.num_threads, &arms)?;
            arms
        }
        None => Vec::new(),
    };

    let pc_table_binary = args.coverage_binary.clone().unwrap_or_else(|| args.binary.clone());
    let pc_table = match pc_table::dump_from_binary(&pc_table_binary, &env.workdir.join("pc_table.bin")) {
        Ok(table) => Some(table),
        Err(e) if args.require_pc_table => return Err(e).context("--require_pc_table was set"),
        Err(e) => {
            tracing::warn!(error = %e, "continuing without a PC table (coverage frontier disabled)");
            None
        }
    };

    let mut workers = Vec::with_capacity(env.num_threads);
    let mut early_exits = Vec::with_capacity(env.num_threads);

    for thread_index in 0..env.num_threads {
        let mut thread_env = env.clone();
        thread_env.first_shard_index = env.owned_shard_index_for_thread(thread_index);

        let mut config = EngineConfig {
            num_runs: args.num_runs,
            batch_size: args.batch_size,
            mutate_batch_size: args.mutate_batch_size,
            max_corpus_size: args.max_corpus_size,
            prune_frequency: args.prune_frequency,
            frequency_threshold: args.feature_frequency_threshold,
            use_pcpair_features: args.use_pcpair_features,
            use_coverage_frontier: args.use_coverage_frontier,
            use_corpus_weights: args.use_corpus_weights,
            max_num_crash_reports: args.num_crash_reports,
            exit_on_crash: args.exit_on_crash,
            full_sync: args.full_sync,
            seed: if args.seed != 0 {
                args.seed
            } else {
                thread_env.first_shard_index as u64
            },
            shmem_size_mb: args.shmem_size_mb,
            load_other_shard_frequency: args.load_other_shard_frequency,
            merge_from: args.merge_from.clone(),
            distill: args.distill_shards,
        };

        if !arms.is_empty() {
            let arm = &arms[environment::arm_for_thread(thread_index, env.num_threads, &arms)];
            for (flag, value) in &arm.values {
                apply_experiment_override(&mut config, flag, value);
            }
        }

        let mut engine = Engine::new(thread_env, config);
        if let Some(table) = &pc_table {
            engine.set_pc_table(table.clone());
        }
        if let Some(dict_path) = &args.dictionary {
            dictionary::load(&mut engine.mutator, dict_path)?;
        }
        if let Some(dir) = &args.corpus_dir {
            engine.set_corpus_dir_mirror(dir.clone());
        }

        let target = ExternalTarget::new(&target_config(&args))
            .with_context(|| format!("launching worker {thread_index}"))?;

        early_exits.push(engine.early_exit_handle());
        workers.push((engine, target));
    }

    install_sigint_handler(early_exits);

    let handles: Vec<_> = workers
        .into_iter()
        .enumerate()
        .map(|(i, (mut engine, mut target))| {
            std::thread::Builder::new()
                .name(format!("centipede-worker-{i}"))
                .spawn(move || {
                    let result = engine.fuzz(&mut target);
                    (i, result)
                })
                .expect("spawning worker thread")
        })
        .collect();

    let mut failed = false;
    for handle in handles {
        let (i, result) = handle.join().expect("worker thread panicked");
        if let Err(e) = result {
            tracing::error!(worker = i, error = %e, "worker exited with an error");
            failed = true;
        }
    }
    if failed {
        bail!("one or more workers failed");
    }
    Ok(())
}

fn install_sigint_handler(early_exits: Vec<Arc<EarlyExit>>) {
    let result = ctrlc::set_handler(move || {
        for handle in &early_exits {
            handle.request(1);
        }
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "failed to install SIGINT handler");
    }
}

/// Picks between [`LlvmSymbolTable`] and [`NoopSymbolTable`] at runtime
/// without a trait object, since [`centipede_core::analyze::analyze`] takes
/// its symbolizer as a bare generic bound.
enum Symbolizer {
    Llvm(LlvmSymbolTable),
    Noop(NoopSymbolTable),
}

impl Symbolizer {
    fn new(args: &AnalyzeArgs) -> Self {
        match &args.symbolizer_path {
            Some(path) => Self::Llvm(LlvmSymbolTable::new(path.clone(), args.binary.clone())),
            None => Self::Noop(NoopSymbolTable),
        }
    }
}

impl SymbolTable for Symbolizer {
    fn describe(&mut self, pc: u64) -> String {
        match self {
            Self::Llvm(table) => table.describe(pc),
            Self::Noop(table) => table.describe(pc),
        }
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<()> {
    let env_a = Environment {
        workdir: args.workdir_a.clone(),
        binary_name: binary_name(&args.binary),
        binary_hash: binary_hash(&args.binary),
        total_shards: args.total_shards,
        first_shard_index: 0,
        num_threads: 1,
    };
    let mut env_b = env_a.clone();
    env_b.workdir = args.workdir_b.clone();

    let target_cfg = TargetConfig {
        binary: args.binary.clone(),
        extra_binaries: Vec::new(),
        fork_server: args.fork_server,
        timeout: (args.timeout > 0).then(|| Duration::from_secs(args.timeout)),
        shmem_size_mb: args.shmem_size_mb,
        use_pc_features: true,
        use_counter_features: true,
        use_cmp_features: false,
        use_dataflow_features: false,
        use_auto_dictionary: false,
        path_level: 0,
        crossover_level: 0,
        address_space_limit_mb: 0,
        rss_limit_mb: 0,
    };

    let mut target_a = ExternalTarget::new(&target_cfg)?;
    let mut target_b = ExternalTarget::new(&target_cfg)?;

    let mut symbols = Symbolizer::new(&args);

    let report = centipede_core::analyze::analyze(
        &env_a,
        &env_b,
        &mut target_a,
        &mut target_b,
        &mut symbols,
    )?;

    println!("PCs only covered by B: {}", report.pcs_only_in_b.len());
    println!("B inputs touching a B-only PC: {}", report.unique_inputs_in_b);
    println!("B inputs sharing only A's coverage: {}", report.shared_inputs_in_b);
    for description in &report.descriptions {
        println!("  {description}");
    }
    Ok(())
}

fn run_minimize(args: MinimizeArgs) -> Result<()> {
    let crash_dir = args.workdir.join("crashes");
    environment::ensure_dir(&crash_dir)?;
    let input = std::fs::read(&args.input)
        .with_context(|| format!("reading crashing input at {}", args.input.display()))?;

    let target_cfg = TargetConfig {
        binary: args.binary.clone(),
        extra_binaries: Vec::new(),
        fork_server: args.fork_server,
        timeout: (args.timeout > 0).then(|| Duration::from_secs(args.timeout)),
        shmem_size_mb: args.shmem_size_mb,
        use_pc_features: false,
        use_counter_features: false,
        use_cmp_features: false,
        use_dataflow_features: false,
        use_auto_dictionary: false,
        path_level: 0,
        crossover_level: 0,
        address_space_limit_mb: 0,
        rss_limit_mb: 0,
    };
    let mut target = ExternalTarget::new(&target_cfg)?;
    let mut mutator = Mutator::new(args.seed);

    let result = minimize::minimize(input, &mut target, &mut mutator, &crash_dir)?;
    if result.smaller_found {
        println!(
            "minimized to {} bytes ({} candidates in worklist)",
            result.smallest.len(),
            result.worklist.len()
        );
    } else {
        println!("no smaller crasher found");
    }
    Ok(())
}
