//! kvload CLI
//!
//! Runs the populate-then-query benchmark against the in-process reference
//! engine and prints the report.
//!
//! ```bash
//! # 1M items, 8 workers, 10M lookups each
//! kvload --items 1000000 --workers 8 --queries-per-worker 10000000
//!
//! # size the working set from a 1 GiB budget with text keys
//! kvload --memory-budget 1073741824 --key-encoding text
//!
//! # validate configuration without running the workload
//! kvload --profile medium --skip-run
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use kvload::{BenchmarkConfig, InMemoryEngine, KeyEncoding, MemoryProfile, RunOutcome, execute};

#[derive(Parser)]
#[command(name = "kvload")]
#[command(version, about = "Populate-then-query throughput benchmark for key-value engines")]
struct Cli {
    /// Memory profile: low, medium, large, nros
    #[arg(long, default_value = "nros")]
    profile: MemoryProfile,

    /// Working set size in items
    #[arg(long, conflicts_with = "memory_budget")]
    items: Option<u64>,

    /// Derive the working set from a memory budget in bytes
    #[arg(long)]
    memory_budget: Option<u64>,

    /// Value payload size in bytes (default: profile's item value size)
    #[arg(long)]
    value_size: Option<usize>,

    /// Number of workers (default: available CPUs)
    #[arg(long)]
    workers: Option<usize>,

    /// Lookups issued by each worker
    #[arg(long, default_value = "1000000")]
    queries_per_worker: u64,

    /// Key encoding: binary or text
    #[arg(long, default_value = "binary")]
    key_encoding: KeyEncoding,

    /// Skip payload identity checks on lookup
    #[arg(long)]
    no_verify: bool,

    /// Do not pin workers to CPUs
    #[arg(long)]
    no_pin: bool,

    /// Operations between progress lines
    #[arg(long)]
    progress_interval: Option<u64>,

    /// Item capacity of the reference engine (default: unbounded)
    #[arg(long)]
    capacity: Option<u64>,

    /// Configure the engine and exit without running the workload
    #[arg(long)]
    skip_run: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_target(false)
        .try_init();
}

fn build_config(cli: &Cli) -> Result<BenchmarkConfig> {
    let mut builder = BenchmarkConfig::builder()
        .profile(cli.profile)
        .queries_per_worker(cli.queries_per_worker)
        .key_encoding(cli.key_encoding)
        .verify_payload(!cli.no_verify)
        .pin_threads(!cli.no_pin)
        .skip_run(cli.skip_run);
    if let Some(items) = cli.items {
        builder = builder.items(items);
    }
    if let Some(bytes) = cli.memory_budget {
        builder = builder.memory_budget(bytes);
    }
    if let Some(size) = cli.value_size {
        builder = builder.value_size(size);
    }
    if let Some(workers) = cli.workers {
        builder = builder.workers(workers);
    }
    if let Some(interval) = cli.progress_interval {
        builder = builder.progress_interval(interval);
    }
    builder.build().context("Invalid benchmark configuration")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = build_config(&cli)?;
    let mut engine = match cli.capacity {
        Some(items) => InMemoryEngine::with_capacity(items),
        None => InMemoryEngine::new(),
    };

    match execute(config, &mut engine).context("Benchmark setup failed")? {
        RunOutcome::Skipped(settings) => {
            println!("Engine configured, run skipped: {:?}", settings);
        }
        RunOutcome::Completed(report) => {
            println!("{}", report);
        }
    }
    Ok(())
}
