// src/main.rs
//
// pfs-bench: parallel file-system metadata, bandwidth and find benchmark.
// Every rank is a thread of this process; the group is built once per command.
//

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use pfs_bench::backend::{display_freespace, Backend, BackendKind};
use pfs_bench::comm::{Communicator, LocalGroup};
use pfs_bench::config::{RunConfig, TransferConfig};
use pfs_bench::constants::{DEFAULT_FIND_PATTERN, DEFAULT_FIND_SIZE};
use pfs_bench::context::RunContext;
use pfs_bench::metrics::print_latency_summary;
use pfs_bench::phases::{run_benchmark, BenchmarkReport};
use pfs_bench::posix::PosixBackend;
use pfs_bench::stonewall::StonewallScope;
use pfs_bench::timebase::{timestamp_string, Timebase};
use pfs_bench::transfer::{run_transfer, TransferReport};
use pfs_bench::tsv_export::TsvExporter;
use pfs_bench::walker::{run_find, FindOptions, WalkMode};

// -----------------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------------
#[derive(Parser)]
#[command(
    name = "pfs-bench",
    version,
    about = "Parallel file system metadata, bandwidth and find benchmark"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the metadata phases (and the optional bandwidth phase)
    ///
    /// Examples:
    ///   pfs-bench run --config bench.yaml --tasks 8
    ///   pfs-bench run --work-dir /mnt/pfs/bench -b 2 -z 3 -I 10 --tasks 4
    ///   pfs-bench run --config bench.yaml --results-tsv /tmp/run1
    Run {
        /// YAML configuration; flags given on the command line override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Ranks to run (threads in this process)
        #[arg(long, default_value_t = 1)]
        tasks: usize,

        /// Export machine-readable results as <PATH>-results.tsv,
        /// <PATH>-latency.tsv and <PATH>-transfer.tsv
        #[arg(long, value_name = "PATH")]
        results_tsv: Option<PathBuf>,

        #[command(flatten)]
        overrides: RunOverrides,
    },
    /// Count (or delete) files under a directory with every rank walking
    ///
    /// Examples:
    ///   pfs-bench find --root /mnt/pfs/data --tasks 8
    ///   pfs-bench find --root /mnt/pfs/data --name .dat --newer /tmp/marker
    ///   pfs-bench find --root /mnt/pfs/scratch --delete --tasks 16
    Find {
        #[arg(long)]
        root: PathBuf,

        /// Substring the file name must contain
        #[arg(long, default_value = DEFAULT_FIND_PATTERN)]
        name: String,

        /// Exact size in bytes the file must have
        #[arg(long, default_value_t = DEFAULT_FIND_SIZE)]
        size: u64,

        /// Ignore the size criterion
        #[arg(long)]
        any_size: bool,

        /// Only files modified after this reference file
        #[arg(long)]
        newer: Option<PathBuf>,

        /// Unlink every file instead of matching
        #[arg(long)]
        delete: bool,

        #[arg(long, default_value_t = 1)]
        tasks: usize,

        /// Stop listing directories after this many seconds (0 = off)
        #[arg(long, default_value_t = 0)]
        stonewall: u64,

        /// Print the results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Parse, validate and print the resolved configuration
    ///
    /// Examples:
    ///   pfs-bench validate --config bench.yaml
    ///   pfs-bench validate --config bench.yaml --tasks 4 --format json
    Validate {
        #[arg(long)]
        config: PathBuf,

        /// Group size the task range is checked against
        #[arg(long, default_value_t = 1)]
        tasks: usize,

        /// yaml or json
        #[arg(long, default_value = "yaml")]
        format: String,
    },
}

/// Command-line settings; each one given replaces the config file value
#[derive(Args, Debug, Default)]
struct RunOverrides {
    /// Directory the test directories are created in
    #[arg(short = 'd', long)]
    work_dir: Option<PathBuf>,

    /// Storage backend (posix)
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Children per tree directory
    #[arg(short = 'b', long)]
    branch_factor: Option<u64>,

    /// Tree depth below the root
    #[arg(short = 'z', long)]
    depth: Option<u32>,

    /// Items per tree
    #[arg(short = 'n', long)]
    items: Option<u64>,

    /// Items per directory
    #[arg(short = 'I', long)]
    items_per_dir: Option<u64>,

    /// Only the deepest directories hold items
    #[arg(short = 'L', long)]
    leaf_only: bool,

    #[arg(short = 'i', long)]
    iterations: Option<u32>,

    /// Smallest task count of the sweep
    #[arg(long)]
    first_tasks: Option<usize>,

    /// Largest task count of the sweep
    #[arg(long)]
    last_tasks: Option<usize>,

    #[arg(long)]
    task_stride: Option<usize>,

    /// No barriers between phases (free-running reduction)
    #[arg(short = 'B', long)]
    no_barriers: bool,

    #[arg(short = 'C', long)]
    create_only: bool,

    #[arg(short = 'T', long)]
    stat_only: bool,

    #[arg(short = 'E', long)]
    read_only: bool,

    #[arg(short = 'r', long)]
    remove_only: bool,

    /// Directory items only
    #[arg(short = 'D', long)]
    dirs_only: bool,

    /// File items only
    #[arg(short = 'F', long)]
    files_only: bool,

    /// Stonewall deadline in seconds (0 = off)
    #[arg(short = 'W', long)]
    stonewall: Option<u64>,

    /// Skip the wear-out extension after the deadline
    #[arg(long)]
    no_wear_out: bool,

    /// Phases the deadline applies to: create, create_and_read or all
    #[arg(long)]
    stonewall_scope: Option<StonewallScope>,

    /// Randomise stat/read order with this seed
    #[arg(short = 'R', long)]
    random_seed: Option<u64>,

    /// Rank 0 creates and removes every item
    #[arg(short = 'c', long)]
    collective_creates: bool,

    #[arg(short = 'u', long)]
    unique_dir_per_task: bool,

    /// All tasks share one set of file names
    #[arg(short = 'S', long)]
    shared_file: bool,

    /// Stat, read and remove the items of task rank+N
    #[arg(short = 'N', long)]
    neighbor_stride: Option<usize>,

    #[arg(short = 'w', long)]
    write_bytes: Option<u64>,

    #[arg(short = 'e', long)]
    read_bytes: Option<u64>,

    /// fsync every file before closing
    #[arg(short = 'y', long)]
    sync_file: bool,

    #[arg(short = 'X', long)]
    verify_read: bool,

    /// Fail the run on the first data verification error
    #[arg(long)]
    abort_on_data_error: bool,

    /// Seconds to sleep before each item test
    #[arg(short = 'p', long)]
    pre_delay: Option<u64>,

    /// Warn about ranks whose timestamps stray this many seconds
    #[arg(long)]
    outlier_threshold: Option<f64>,

    #[arg(long)]
    collective_io: bool,

    /// Also run the file-per-process bandwidth phase
    #[arg(long)]
    transfer: bool,

    #[arg(long)]
    block_size: Option<u64>,

    #[arg(long)]
    transfer_size: Option<u64>,

    #[arg(long)]
    segments: Option<u64>,

    /// Read the file written by rank+N in the bandwidth phase
    #[arg(long)]
    reorder_offset: Option<usize>,

    #[arg(long)]
    verify_transfer: bool,
}

impl RunOverrides {
    fn apply(self, cfg: &mut RunConfig) {
        if let Some(v) = self.work_dir {
            cfg.work_dir = v;
        }
        if let Some(v) = self.backend {
            cfg.backend = v;
        }
        if let Some(v) = self.branch_factor {
            cfg.branch_factor = v;
        }
        if let Some(v) = self.depth {
            cfg.depth = v;
        }
        if let Some(v) = self.items {
            cfg.items = v;
        }
        if let Some(v) = self.items_per_dir {
            cfg.items_per_dir = v;
        }
        if let Some(v) = self.iterations {
            cfg.iterations = v;
        }
        if let Some(v) = self.first_tasks {
            cfg.tasks.first = Some(v);
        }
        if let Some(v) = self.last_tasks {
            cfg.tasks.last = Some(v);
        }
        if let Some(v) = self.task_stride {
            cfg.tasks.stride = v;
        }

        // Any "-only" flag selects just the phases named
        if self.create_only || self.stat_only || self.read_only || self.remove_only {
            cfg.phases.create = self.create_only;
            cfg.phases.stat = self.stat_only;
            cfg.phases.read = self.read_only;
            cfg.phases.remove = self.remove_only;
        }
        if self.dirs_only || self.files_only {
            cfg.targets.dirs = self.dirs_only;
            cfg.targets.files = self.files_only;
        }

        if let Some(v) = self.stonewall {
            cfg.stonewall.deadline = Duration::from_secs(v);
        }
        if let Some(v) = self.stonewall_scope {
            cfg.stonewall.scope = v;
        }
        if let Some(v) = self.random_seed {
            cfg.random_seed = v;
        }
        if let Some(v) = self.neighbor_stride {
            cfg.neighbor_stride = v;
        }
        if let Some(v) = self.write_bytes {
            cfg.write_bytes = v;
        }
        if let Some(v) = self.read_bytes {
            cfg.read_bytes = v;
        }
        if let Some(v) = self.pre_delay {
            cfg.pre_delay = Duration::from_secs(v);
        }
        if let Some(v) = self.outlier_threshold {
            cfg.outlier_threshold = v;
        }

        cfg.leaf_only |= self.leaf_only;
        cfg.barriers &= !self.no_barriers;
        cfg.stonewall.wear_out &= !self.no_wear_out;
        cfg.collective_creates |= self.collective_creates;
        cfg.unique_dir_per_task |= self.unique_dir_per_task;
        cfg.shared_file |= self.shared_file;
        cfg.sync_file |= self.sync_file;
        cfg.verify_read |= self.verify_read;
        cfg.abort_on_data_error |= self.abort_on_data_error;
        cfg.collective_io |= self.collective_io;

        let wants_transfer = self.transfer
            || self.block_size.is_some()
            || self.transfer_size.is_some()
            || self.segments.is_some()
            || self.reorder_offset.is_some()
            || self.verify_transfer;
        if wants_transfer {
            let xfer = cfg.transfer.get_or_insert_with(TransferConfig::default);
            if let Some(v) = self.block_size {
                xfer.block_size = v;
            }
            if let Some(v) = self.transfer_size {
                xfer.transfer_size = v;
            }
            if let Some(v) = self.segments {
                xfer.segments = v;
            }
            if let Some(v) = self.reorder_offset {
                xfer.reorder_offset = v;
            }
            xfer.verify |= self.verify_transfer;
        }
    }
}

// -----------------------------------------------------------------------------
// main
// -----------------------------------------------------------------------------
fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match cli.command {
        Commands::Run {
            config,
            tasks,
            results_tsv,
            overrides,
        } => run_cmd(config.as_deref(), tasks, results_tsv.as_deref(), overrides, cli.verbose),
        Commands::Find {
            root,
            name,
            size,
            any_size,
            newer,
            delete,
            tasks,
            stonewall,
            json,
        } => {
            let opts = FindOptions {
                root,
                mode: if delete { WalkMode::Delete } else { WalkMode::Find },
                name_filter: Some(name),
                expected_size: (!any_size).then_some(size),
                newer_than: newer,
                stonewall: Duration::from_secs(stonewall),
            };
            find_cmd(&opts, tasks, json)
        }
        Commands::Validate { config, tasks, format } => validate_cmd(&config, tasks, &format),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Map -v count to pfs_bench log level; RUST_LOG wins when set
fn init_tracing(verbose: u8) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pfs_bench={}", level)));
    fmt().with_env_filter(filter).with_thread_names(true).init();
}

fn load_config(path: Option<&Path>, overrides: RunOverrides) -> Result<RunConfig> {
    let mut cfg = match path {
        Some(path) => RunConfig::from_yaml_file(path)?,
        None => match &overrides.work_dir {
            Some(dir) => RunConfig::new(dir.clone()),
            None => bail!("either --config or --work-dir is required"),
        },
    };
    overrides.apply(&mut cfg);
    Ok(cfg)
}

// -----------------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------------
fn run_cmd(
    config: Option<&Path>,
    tasks: usize,
    results_tsv: Option<&Path>,
    overrides: RunOverrides,
    verbose: u8,
) -> Result<()> {
    if tasks == 0 {
        bail!("--tasks must be at least 1");
    }
    let mut cfg = load_config(config, overrides)?;
    let backend = match cfg.backend {
        BackendKind::Posix => PosixBackend::new(),
    };
    for warning in cfg.validate(backend.capabilities())? {
        warn!("{}", warning);
    }
    // Fail before spawning ranks if the sweep does not fit the group
    cfg.tasks.counts(tasks)?;

    std::fs::create_dir_all(&cfg.work_dir)
        .with_context(|| format!("unable to create work directory {}", cfg.work_dir.display()))?;

    println!("-- started at {} --", timestamp_string());
    println!("pfs-bench {} running on {} ranks", env!("CARGO_PKG_VERSION"), tasks);
    display_freespace(&backend, &cfg.work_dir)
        .with_context(|| format!("unable to stat file system of {}", cfg.work_dir.display()))?;

    let cfg = &cfg;
    let backend = &backend;
    let mut outputs = LocalGroup::run(tasks, |comm| {
        let timebase = Timebase::synchronize(&comm)?;
        if comm.rank() == 0 {
            debug!(deviation = timebase.deviation(), "clocks synchronised");
        }
        let ctx = RunContext::new(&comm, backend, &timebase);
        let reports = run_benchmark(&ctx, cfg)?;
        let transfer = match &cfg.transfer {
            Some(xfer) => run_transfer(&ctx, cfg, xfer)?,
            None => None,
        };
        Ok((reports, transfer))
    })?;

    // Only rank 0 carries reports
    let (reports, transfer) = if outputs.is_empty() {
        (Vec::new(), None)
    } else {
        outputs.swap_remove(0)
    };
    print_reports(&reports, transfer.as_ref(), verbose);

    if let Some(base) = results_tsv {
        let exporter = TsvExporter::new(base);
        exporter.export_results(&reports)?;
        if let Some(transfer) = &transfer {
            exporter.export_transfer(transfer)?;
        }
    }

    println!("\n-- finished at {} --", timestamp_string());
    let data_errors: u64 = reports.iter().map(|r| r.data_errors).sum::<u64>()
        + transfer.as_ref().map_or(0, |t| t.data_errors);
    if data_errors > 0 {
        warn!(data_errors, "run finished with data verification errors");
    }
    info!("run complete");
    Ok(())
}

fn print_reports(reports: &[BenchmarkReport], transfer: Option<&TransferReport>, verbose: u8) {
    for report in reports {
        report.print();
        if verbose > 0 {
            print_latency_summary(&report.latencies);
        }
    }
    if let Some(transfer) = transfer {
        transfer.print();
    }
}

fn find_cmd(opts: &FindOptions, tasks: usize, json: bool) -> Result<()> {
    if tasks == 0 {
        bail!("--tasks must be at least 1");
    }
    let results = LocalGroup::run(tasks, |comm| run_find(&comm, opts))?;
    let Some(results) = results.first() else {
        bail!("walker produced no results");
    };
    if json {
        println!("{}", serde_json::to_string_pretty(results)?);
    } else {
        results.print(opts.mode);
    }
    Ok(())
}

fn validate_cmd(path: &Path, tasks: usize, format: &str) -> Result<()> {
    let mut cfg = RunConfig::from_yaml_file(path)?;
    let capabilities = match cfg.backend {
        BackendKind::Posix => PosixBackend::new().capabilities(),
    };
    let warnings = cfg.validate(capabilities)?;
    let counts = cfg.tasks.counts(tasks)?;
    for warning in &warnings {
        println!("warning: {}", warning);
    }
    println!("task counts: {:?}", counts);
    match format {
        "yaml" => print!("{}", serde_yaml::to_string(&cfg)?),
        "json" => println!("{}", serde_json::to_string_pretty(&cfg)?),
        other => bail!("unknown format '{}' (yaml|json)", other),
    }
    println!("✅ {} is valid", path.display());
    Ok(())
}
