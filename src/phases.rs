// src/phases.rs
//! Metadata phase executor.
//!
//! Per iteration every rank runs, each step optional:
//!
//! 1. tree create (rank 0 builds one tree per task or one shared tree; the
//!    deadline is checked between trees and there is no wear-out)
//! 2. directory items: create, stat, remove
//! 3. file items: create, stat, read, remove
//! 4. tree remove (rank 0)
//!
//! Item phases are independent per rank over the rank's slice of the
//! namespace and run under the stonewall protocol. The stat, read and remove
//! roles can be shifted to a neighbour task so no rank touches the items
//! it created itself.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::backend::{AccessMode, Backend, OpenMode};
use crate::buffers::{count_mismatches, fill_pattern, AlignedBuffer, PatternSeed};
use crate::comm::{CommError, Communicator, ReduceOp};
use crate::config::RunConfig;
use crate::constants::{DEFAULT_FILL_BYTE, TEST_DIR_PREFIX};
use crate::context::RunContext;
use crate::error::BenchError;
use crate::metrics::{reduce_latencies, LatencySummary, OpHists};
use crate::namespace::{
    resolve_items_per_dir, AccessOrder, ItemKind, Namespace, Role, Sharing, TaskRoles, TreeBuilder,
    TreeShape,
};
use crate::stats::{reduce_records, Column, Discipline, IterationRecord, PhaseSample, ResultTable};
use crate::stonewall::{run_stonewalled, Progress, StonewallReport, StonewallScope, StonewallSettings};

/// Everything rank 0 knows after one task group finished all iterations
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    /// Backend the items were created on
    pub backend: &'static str,
    pub tasks: usize,
    pub iterations: u32,
    /// Items in the whole namespace of one iteration
    pub total_items: u64,
    pub table: ResultTable,
    pub latencies: Vec<(Column, LatencySummary)>,
    /// Mismatching items summed over ranks and iterations
    pub data_errors: u64,
    pub stonewall: Vec<StonewallSummary>,
}

impl BenchmarkReport {
    pub fn print(&self) {
        println!(
            "\n{} tasks on {}, {} files/directories per iteration",
            self.tasks, self.backend, self.total_items
        );
        for s in &self.stonewall {
            println!(
                "Stonewall {} (iteration {}): done min: {} max: {} ranks hit: {} ranks extended: {}",
                s.column.key(),
                s.iteration,
                s.min,
                s.max,
                s.ranks_hit,
                s.ranks_extended
            );
        }
        self.table.print_summary();
        if self.data_errors > 0 {
            println!("\nWARNING: {} items failed data verification", self.data_errors);
        }
    }
}

/// Stonewall outcome of one phase, folded over the ranks
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StonewallSummary {
    pub iteration: u32,
    pub column: Column,
    /// Smallest count any rank reached before the deadline
    pub min: u64,
    /// Largest count any rank reached before the deadline
    pub max: u64,
    pub ranks_hit: u64,
    pub ranks_extended: u64,
}

/// Run every configured task count. Rank 0 gets one report per count.
///
/// `cfg` must already be validated. Every rank of `ctx` calls this.
pub fn run_benchmark<C: Communicator, B: Backend>(
    ctx: &RunContext<'_, C, B>,
    cfg: &RunConfig,
) -> Result<Vec<BenchmarkReport>> {
    let shape = TreeShape::new(cfg.branch_factor, cfg.depth)?;
    let items_per_dir = resolve_items_per_dir(&shape, cfg.leaf_only, cfg.items, cfg.items_per_dir)?;
    let counts = cfg.tasks.counts(ctx.size())?;

    let mut reports = Vec::new();
    for tasks in counts {
        let sub = ctx.comm.split(tasks)?;
        if let Some(sub) = &sub {
            let group = ctx.with_comm(sub);
            if let Some(report) = run_task_group(&group, cfg, shape, items_per_dir)? {
                reports.push(report);
            }
        }
        ctx.comm.barrier()?;
    }
    Ok(reports)
}

fn run_task_group<C: Communicator, B: Backend>(
    ctx: &RunContext<'_, C, B>,
    cfg: &RunConfig,
    shape: TreeShape,
    items_per_dir: u64,
) -> Result<Option<BenchmarkReport>> {
    let tasks = ctx.size();
    let seed = ctx.comm.broadcast_u64(cfg.random_seed, 0)?;
    let mut hists = OpHists::new()?;
    let mut records = Vec::with_capacity(cfg.iterations as usize);
    let mut walls = Vec::new();
    let mut local_errors = 0;
    let mut total_items = 0;

    if ctx.is_root() {
        info!(
            backend = ctx.backend.name(),
            tasks,
            iterations = cfg.iterations,
            branch_factor = shape.branch_factor,
            depth = shape.depth,
            items_per_dir,
            "starting task group"
        );
    }

    for iteration in 0..cfg.iterations {
        let ns = Namespace::new(
            test_dir_for(&cfg.work_dir, iteration),
            shape,
            items_per_dir,
            cfg.leaf_only,
            cfg.sharing(),
            tasks,
        )?;
        total_items = ns.total_items() * ns.num_trees() as u64;

        let mut runner = IterationRunner::new(ctx, cfg, ns, iteration, seed, &mut hists)?;
        runner.run()?;
        local_errors += runner.worker.data_errors;
        walls.extend(
            runner
                .stonewall
                .iter()
                .map(|(column, report)| (iteration, *column, *report)),
        );
        records.push(runner.record);
    }

    let discipline = if cfg.barriers {
        Discipline::Barrier
    } else {
        Discipline::FreeRunning
    };
    let table = reduce_records(ctx.comm, &records, discipline, cfg.outlier_threshold)?;
    let latencies = reduce_latencies(ctx.comm, &hists)?;
    let data_errors = ctx.comm.all_reduce_u64(local_errors, ReduceOp::Sum)?;
    let stonewall = reduce_stonewall(ctx.comm, &walls)?;

    match (table, latencies) {
        (Some(table), Some(latencies)) => {
            if data_errors > 0 {
                warn!(data_errors, "data verification found mismatching items");
            }
            Ok(Some(BenchmarkReport {
                backend: ctx.backend.name(),
                tasks,
                iterations: cfg.iterations,
                total_items,
                table,
                latencies,
                data_errors,
                stonewall,
            }))
        }
        _ => Ok(None),
    }
}

/// Gather the per-rank stonewall reports; rank 0 folds them.
fn reduce_stonewall<C: Communicator>(
    comm: &C,
    walls: &[(u32, Column, StonewallReport)],
) -> Result<Vec<StonewallSummary>, CommError> {
    let flat: Vec<f64> = walls
        .iter()
        .flat_map(|(_, _, r)| {
            [
                r.done_before_deadline as f64,
                f64::from(u8::from(r.hit)),
                f64::from(u8::from(r.extended)),
            ]
        })
        .collect();
    let gathered = comm.all_gather_f64(&flat)?;
    if comm.rank() != 0 {
        return Ok(Vec::new());
    }

    Ok(walls
        .iter()
        .enumerate()
        .map(|(i, (iteration, column, _))| {
            let per_rank: Vec<&[f64]> = gathered
                .iter()
                .filter_map(|values| values.get(i * 3..i * 3 + 3))
                .collect();
            let done = per_rank.iter().map(|v| v[0] as u64);
            StonewallSummary {
                iteration: *iteration,
                column: *column,
                min: done.clone().min().unwrap_or(0),
                max: done.max().unwrap_or(0),
                ranks_hit: per_rank.iter().filter(|v| v[1] != 0.0).count() as u64,
                ranks_extended: per_rank.iter().filter(|v| v[2] != 0.0).count() as u64,
            }
        })
        .collect())
}

/// What one item test does to its path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOp {
    Mkdir,
    StatDir,
    Rmdir,
    /// Create, optionally write and fsync, close
    CreateFile,
    /// Create and close only (collective pre-creation by rank 0)
    TouchFile,
    /// Open an existing file write-only and fill it (collective creates)
    FillFile,
    StatFile,
    ReadFile,
    RemoveFile,
}

/// Per-rank I/O state: buffers, counters, histograms
struct ItemWorker<'w, B: Backend> {
    backend: &'w B,
    hists: &'w mut OpHists,
    write_buf: AlignedBuffer,
    read_buf: AlignedBuffer,
    /// Owner the write buffer currently holds the pattern for
    filled_for: Option<u64>,
    verify: bool,
    sync_file: bool,
    signature: u32,
    data_errors: u64,
}

impl<'w, B: Backend> ItemWorker<'w, B> {
    fn new(backend: &'w B, hists: &'w mut OpHists, cfg: &RunConfig, iteration: u32) -> Result<Self> {
        Ok(Self {
            backend,
            hists,
            write_buf: AlignedBuffer::filled(cfg.write_bytes as usize, DEFAULT_FILL_BYTE)?,
            read_buf: AlignedBuffer::new(cfg.read_bytes as usize)?,
            filled_for: None,
            verify: cfg.verify_read,
            sync_file: cfg.sync_file,
            signature: iteration,
            data_errors: 0,
        })
    }

    fn seed(&self, owner: u64) -> PatternSeed {
        PatternSeed {
            owner,
            signature: self.signature,
        }
    }

    fn apply(&mut self, op: ItemOp, column: Column, path: &Path, owner: u64) -> Result<()> {
        let started = Instant::now();
        match op {
            ItemOp::Mkdir => self.backend.mkdir(path)?,
            ItemOp::Rmdir => self.backend.rmdir(path)?,
            ItemOp::StatDir | ItemOp::StatFile => {
                self.backend.stat(path)?;
            }
            ItemOp::TouchFile => {
                let handle = self.backend.create(path)?;
                self.backend.close(handle, path)?;
            }
            ItemOp::CreateFile | ItemOp::FillFile => {
                let mut handle = if op == ItemOp::CreateFile {
                    self.backend.create(path)?
                } else {
                    self.backend.open(path, OpenMode::WriteOnly)?
                };
                if !self.write_buf.is_empty() {
                    if self.verify && self.filled_for != Some(owner) {
                        let seed = self.seed(owner);
                        fill_pattern(&mut self.write_buf, seed, 0);
                        self.filled_for = Some(owner);
                    }
                    let written = self.backend.write_at(&mut handle, &self.write_buf, 0, path)?;
                    if written != self.write_buf.len() {
                        anyhow::bail!(
                            "short write on {}: {} of {} bytes",
                            path.display(),
                            written,
                            self.write_buf.len()
                        );
                    }
                }
                if self.sync_file {
                    self.backend.fsync(&mut handle, path)?;
                }
                self.backend.close(handle, path)?;
            }
            ItemOp::ReadFile => {
                let mut handle = self.backend.open(path, OpenMode::ReadOnly)?;
                if !self.read_buf.is_empty() {
                    let n = self.backend.read_at(&mut handle, &mut self.read_buf, 0, path)?;
                    if self.verify {
                        let expected = self.read_buf.len().min(self.write_buf.len());
                        let seed = self.seed(owner);
                        if n < expected || count_mismatches(&self.read_buf[..expected], seed, 0) > 0 {
                            self.data_errors += 1;
                            debug!("data mismatch in {}", path.display());
                        }
                    }
                }
                self.backend.close(handle, path)?;
            }
            ItemOp::RemoveFile => self.backend.delete(path)?,
        }
        self.hists.record(column, started.elapsed());
        Ok(())
    }
}

/// One iteration of one task group on one rank
struct IterationRunner<'r, 'a, C: Communicator, B: Backend> {
    ctx: &'r RunContext<'a, C, B>,
    cfg: &'r RunConfig,
    ns: Namespace,
    roles: TaskRoles,
    seed: u64,
    worker: ItemWorker<'r, B>,
    record: IterationRecord,
    stonewall: Vec<(Column, StonewallReport)>,
    /// Items each task created, per kind; later phases address `[0, n)`
    created_dirs: Vec<u64>,
    created_files: Vec<u64>,
    /// Trees `[0, n)` exist; tasks whose tree is missing sit the phases out
    trees_built: usize,
    tree_complete: bool,
}

impl<'r, 'a, C: Communicator, B: Backend> IterationRunner<'r, 'a, C, B> {
    fn new(
        ctx: &'r RunContext<'a, C, B>,
        cfg: &'r RunConfig,
        ns: Namespace,
        iteration: u32,
        seed: u64,
        hists: &'r mut OpHists,
    ) -> Result<Self> {
        let full: Vec<u64> = (0..ns.tasks())
            .map(|t| {
                let range = ns.task_range(t);
                range.end - range.start
            })
            .collect();
        let trees_built = ns.num_trees();
        Ok(Self {
            roles: TaskRoles::new(ctx.rank(), cfg.neighbor_stride, ns.tasks()),
            worker: ItemWorker::new(ctx.backend, hists, cfg, iteration)?,
            ctx,
            cfg,
            ns,
            seed,
            record: IterationRecord::default(),
            stonewall: Vec::new(),
            created_dirs: full.clone(),
            created_files: full,
            trees_built,
            tree_complete: true,
        })
    }

    fn run(&mut self) -> Result<()> {
        let test_dir = self.ns.test_dir().to_path_buf();
        if self.ctx.is_root() {
            let backend = self.ctx.backend;
            if !backend.access(&test_dir, AccessMode::Exists)? {
                backend
                    .mkdir(&test_dir)
                    .with_context(|| "unable to create test directory")?;
            }
        }
        self.ctx.comm.barrier()?;

        if self.cfg.phases.create {
            self.tree_phase(Column::TreeCreate)?;
        }
        if self.cfg.targets.dirs {
            self.item_cycle(ItemKind::Dir)?;
        }
        if self.cfg.targets.files {
            self.item_cycle(ItemKind::File)?;
        }
        if self.cfg.phases.remove {
            self.tree_phase(Column::TreeRemove)?;
            if self.ctx.is_root() && self.tree_complete {
                self.ctx
                    .backend
                    .rmdir(&test_dir)
                    .with_context(|| "unable to remove test directory")?;
            }
        }
        self.ctx.comm.barrier()?;
        Ok(())
    }

    fn item_cycle(&mut self, kind: ItemKind) -> Result<()> {
        let phases = self.cfg.phases.clone();
        let (create, stat, remove) = match kind {
            ItemKind::Dir => (Column::DirCreate, Column::DirStat, Column::DirRemove),
            ItemKind::File => (Column::FileCreate, Column::FileStat, Column::FileRemove),
        };
        if phases.create {
            self.create_items(kind, create)?;
        }
        if phases.stat {
            self.visit_items(kind, Role::Stat, stat)?;
        }
        if phases.read && kind == ItemKind::File {
            self.visit_items(kind, Role::Read, Column::FileRead)?;
            self.check_data_errors()?;
        }
        if phases.remove {
            self.remove_items(kind, remove)?;
        }
        Ok(())
    }

    fn settings_for(&self, role: Role) -> StonewallSettings {
        let covered = match (self.cfg.stonewall.scope, role) {
            (_, Role::Create) => true,
            (StonewallScope::CreateAndRead | StonewallScope::All, Role::Stat | Role::Read) => true,
            (StonewallScope::All, Role::Remove) => true,
            _ => false,
        };
        if covered {
            self.cfg.stonewall.settings()
        } else {
            StonewallSettings::disabled()
        }
    }

    /// Optional delay, then the opening barrier. Returns the start time.
    fn begin_phase(&self) -> Result<f64> {
        if !self.cfg.pre_delay.is_zero() {
            std::thread::sleep(self.cfg.pre_delay);
        }
        if self.cfg.barriers {
            self.ctx.comm.barrier()?;
        }
        Ok(self.ctx.now())
    }

    fn end_phase(&mut self, column: Column, start: f64, items: u64) -> Result<()> {
        if self.cfg.barriers {
            self.ctx.comm.barrier()?;
        }
        let end = self.ctx.now();
        self.record.set(column, PhaseSample { start, end, items });
        if self.ctx.is_root() {
            debug!(phase = column.key(), items, secs = end - start, "phase done");
        }
        Ok(())
    }

    /// Pattern owner of `task`'s items
    fn owner(&self, task: usize) -> u64 {
        match self.ns.sharing() {
            Sharing::SharedFile => 0,
            _ => task as u64,
        }
    }

    fn has_tree(&self, task: usize) -> bool {
        self.ns.tree_of(task) < self.trees_built
    }

    fn created(&self, kind: ItemKind) -> &[u64] {
        match kind {
            ItemKind::Dir => &self.created_dirs,
            ItemKind::File => &self.created_files,
        }
    }

    fn create_items(&mut self, kind: ItemKind, column: Column) -> Result<()> {
        let start = self.begin_phase()?;
        let task = self.roles.task_for(Role::Create);
        let range = self.ns.task_range(task);
        let collective = self.cfg.collective_creates;
        let mut items = 0;

        if collective {
            if self.ctx.is_root() {
                let op = match kind {
                    ItemKind::Dir => ItemOp::Mkdir,
                    ItemKind::File => ItemOp::TouchFile,
                };
                let with_tree: Vec<usize> = (0..self.ns.tasks()).filter(|t| self.has_tree(*t)).collect();
                for t in with_tree {
                    let owner = self.owner(t);
                    for index in self.ns.task_range(t) {
                        let path = self.ns.path_for(index, kind, t);
                        self.worker.apply(op, column, &path, owner)?;
                        items += 1;
                    }
                }
            }
            self.ctx.comm.barrier()?;
        }

        // Collective directories are complete after rank 0's pass.
        let count = if (collective && kind == ItemKind::Dir) || !self.has_tree(task) {
            0
        } else {
            range.end - range.start
        };
        let op = match (kind, collective) {
            (ItemKind::Dir, _) => ItemOp::Mkdir,
            (ItemKind::File, false) => ItemOp::CreateFile,
            (ItemKind::File, true) => ItemOp::FillFile,
        };
        let settings = self.settings_for(Role::Create);
        let owner = self.owner(task);
        let ns = &self.ns;
        let worker = &mut self.worker;
        let outcome = run_stonewalled(self.ctx.comm, settings, count, |k| {
            let path = ns.path_for(range.start + k, kind, task);
            worker.apply(op, column, &path, owner)
        })?;
        if !collective {
            items = outcome.items_done;
        }
        self.end_phase(column, start, items)?;

        if let Some(report) = outcome.report {
            self.stonewall.push((column, report));
            if !(collective && kind == ItemKind::Dir) {
                // rank r creates task r's items, so the gather is indexed by task
                let created = self.ctx.comm.all_gather_u64(outcome.items_done)?;
                match kind {
                    ItemKind::Dir => self.created_dirs = created,
                    ItemKind::File => self.created_files = created,
                }
            }
        }
        Ok(())
    }

    /// Stat or read phase
    fn visit_items(&mut self, kind: ItemKind, role: Role, column: Column) -> Result<()> {
        let start = self.begin_phase()?;
        let task = self.roles.task_for(role);
        let range = self.ns.task_range(task);
        let count = self.created(kind).get(task).copied().unwrap_or(0);
        let order = AccessOrder::for_count(count, self.seed);
        let op = match (kind, role) {
            (ItemKind::Dir, _) => ItemOp::StatDir,
            (ItemKind::File, Role::Read) => ItemOp::ReadFile,
            (ItemKind::File, _) => ItemOp::StatFile,
        };
        let settings = self.settings_for(role);
        let owner = self.owner(task);
        let ns = &self.ns;
        let worker = &mut self.worker;
        let outcome = run_stonewalled(self.ctx.comm, settings, count, |k| {
            let path = ns.path_for(range.start + order.offset(k), kind, task);
            worker.apply(op, column, &path, owner)
        })?;
        self.end_phase(column, start, outcome.items_done)?;
        if let Some(report) = outcome.report {
            self.stonewall.push((column, report));
        }
        Ok(())
    }

    fn remove_items(&mut self, kind: ItemKind, column: Column) -> Result<()> {
        let start = self.begin_phase()?;
        let op = match kind {
            ItemKind::Dir => ItemOp::Rmdir,
            ItemKind::File => ItemOp::RemoveFile,
        };
        let shared_file = self.ns.sharing() == Sharing::SharedFile;

        if self.cfg.collective_creates {
            let mut items = 0;
            if self.ctx.is_root() {
                for t in 0..self.ns.tasks() {
                    let range = self.ns.task_range(t);
                    let count = self.created(kind).get(t).copied().unwrap_or(0);
                    for index in range.start..range.start + count {
                        let path = self.ns.path_for(index, kind, t);
                        self.worker.apply(op, column, &path, 0)?;
                        items += 1;
                    }
                }
            }
            return self.end_phase(column, start, items);
        }

        let task = self.roles.task_for(Role::Remove);
        let range = self.ns.task_range(task);
        let created = self.created(kind).get(task).copied().unwrap_or(0);
        // every task addresses the same names; rank 0 deletes them
        let count = if shared_file && !self.ctx.is_root() {
            0
        } else {
            created
        };
        let settings = self.settings_for(Role::Remove);
        let ns = &self.ns;
        let worker = &mut self.worker;
        let outcome = run_stonewalled(self.ctx.comm, settings, count, |k| {
            let path = ns.path_for(range.start + k, kind, task);
            worker.apply(op, column, &path, 0)
        })?;
        self.end_phase(column, start, outcome.items_done)?;
        if let Some(report) = outcome.report {
            self.stonewall.push((column, report));
        }

        // Items left behind by the deadline are removed untimed so the tree
        // can be taken down.
        for index in range.start + outcome.items_done..range.start + count {
            let path = self.ns.path_for(index, kind, task);
            match kind {
                ItemKind::Dir => self.ctx.backend.rmdir(&path)?,
                ItemKind::File => self.ctx.backend.delete(&path)?,
            }
        }
        Ok(())
    }

    /// Promote verification failures to a collective error when requested.
    fn check_data_errors(&mut self) -> Result<()> {
        if !(self.cfg.verify_read && self.cfg.abort_on_data_error) {
            return Ok(());
        }
        let errors = self
            .ctx
            .comm
            .all_reduce_u64(self.worker.data_errors, ReduceOp::Sum)?;
        if errors > 0 {
            return Err(BenchError::DataIntegrity { errors }.into());
        }
        Ok(())
    }

    /// Rank 0 builds or removes whole trees and checks the deadline between
    /// them. The first tree is always finished. When the deadline stops the
    /// create early, only tasks whose tree exists take part in later phases.
    fn tree_phase(&mut self, column: Column) -> Result<()> {
        let start = self.begin_phase()?;
        let mut dirs = 0;
        let mut trees = 0;
        if self.ctx.is_root() {
            let deadline = match column {
                Column::TreeRemove if self.cfg.stonewall.scope != StonewallScope::All => Duration::ZERO,
                _ => self.cfg.stonewall.deadline,
            };
            let progress = Progress::begin(deadline);
            let test_dir = self.ns.test_dir().to_path_buf();
            let available = match column {
                Column::TreeCreate => self.ns.num_trees(),
                _ => self.trees_built,
            };
            while trees < available {
                if trees > 0 && progress.expired() {
                    warn!(
                        phase = column.key(),
                        trees,
                        of = available,
                        "stonewall hit during tree phase"
                    );
                    break;
                }
                let task = self.ns.tree_task(trees);
                let builder = TreeBuilder::new(*self.ns.shape(), self.ns.tree_base(task));
                dirs += match column {
                    Column::TreeCreate => create_tree(self.ctx.backend, &builder, &test_dir)?,
                    _ => remove_tree(self.ctx.backend, &builder, &test_dir)?,
                };
                trees += 1;
            }
            if column == Column::TreeRemove && trees < available {
                self.tree_complete = false;
            }
        }
        if column == Column::TreeCreate {
            let built = self.ctx.comm.broadcast_u64(trees as u64, 0)? as usize;
            self.limit_to_trees(built);
        }
        self.end_phase(column, start, dirs)
    }

    /// Forget every task whose tree was not built
    fn limit_to_trees(&mut self, built: usize) {
        self.trees_built = built;
        for task in 0..self.ns.tasks() {
            if !self.has_tree(task) {
                self.created_dirs[task] = 0;
                self.created_files[task] = 0;
            }
        }
        if built < self.ns.num_trees() && self.ctx.is_root() {
            info!(
                active = built,
                tasks = self.ns.tasks(),
                "item phases limited to tasks with a tree"
            );
        }
    }
}

fn create_tree<B: Backend>(backend: &B, builder: &TreeBuilder, test_dir: &Path) -> Result<u64> {
    let dirs = builder.all();
    for dir in &dirs {
        backend.mkdir(&dir.path(test_dir))?;
    }
    Ok(dirs.len() as u64)
}

/// Children go before their parents
fn remove_tree<B: Backend>(backend: &B, builder: &TreeBuilder, test_dir: &Path) -> Result<u64> {
    let dirs = builder.all();
    for dir in dirs.iter().rev() {
        backend.rmdir(&dir.path(test_dir))?;
    }
    Ok(dirs.len() as u64)
}

/// Test directory of `iteration` below `work_dir`
pub fn test_dir_for(work_dir: &Path, iteration: u32) -> PathBuf {
    work_dir.join(format!("{}.{}", TEST_DIR_PREFIX, iteration))
}
