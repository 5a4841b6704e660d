// src/config.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{BackendKind, Capabilities};
use crate::constants::{
    DEFAULT_BARRIERS, DEFAULT_BLOCK_SIZE, DEFAULT_BRANCH_FACTOR, DEFAULT_DEPTH, DEFAULT_ITERATIONS,
    DEFAULT_SEGMENTS, DEFAULT_TRANSFER_SIZE, DEFAULT_WEAR_OUT,
};
use crate::error::BenchError;
use crate::namespace::Sharing;
use crate::stonewall::{StonewallScope, StonewallSettings};

/// Run configuration, immutable once validated
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RunConfig {
    /// Directory the per-iteration test directories are created in
    pub work_dir: PathBuf,

    /// Storage backend; resolved once before any phase runs
    #[serde(default)]
    pub backend: BackendKind,

    /// Children per directory in the synthetic tree
    #[serde(default = "default_branch_factor")]
    pub branch_factor: u64,

    /// Levels below the tree root (0 = flat)
    #[serde(default = "default_depth")]
    pub depth: u32,

    /// Items in one tree. Mutually exclusive with `items_per_dir`.
    #[serde(default)]
    pub items: u64,

    /// Items in every directory that holds items
    #[serde(default)]
    pub items_per_dir: u64,

    /// Place items only in the deepest directories
    #[serde(default)]
    pub leaf_only: bool,

    #[serde(default = "default_iterations")]
    pub iterations: u32,

    /// Task counts to sweep; defaults to the whole group once
    #[serde(default)]
    pub tasks: TaskRange,

    /// Barrier between phases. Without it the reducer switches to the
    /// free-running formula.
    #[serde(default = "default_barriers")]
    pub barriers: bool,

    #[serde(default)]
    pub phases: PhaseSelection,

    #[serde(default)]
    pub targets: TargetSelection,

    #[serde(default)]
    pub stonewall: StonewallConfig,

    /// Shuffle stat/read order with this seed (0 = sequential)
    #[serde(default)]
    pub random_seed: u64,

    /// Rank 0 creates and removes every task's items
    #[serde(default)]
    pub collective_creates: bool,

    /// One private tree per task instead of one shared tree
    #[serde(default)]
    pub unique_dir_per_task: bool,

    /// All tasks address the same file names (files only)
    #[serde(default)]
    pub shared_file: bool,

    /// Offset between the creating task and the stat/read/remove task
    #[serde(default)]
    pub neighbor_stride: usize,

    /// Bytes written into each file at create time
    #[serde(default)]
    pub write_bytes: u64,

    /// Bytes read back from each file in the read phase
    #[serde(default)]
    pub read_bytes: u64,

    /// fsync every file before closing it
    #[serde(default)]
    pub sync_file: bool,

    /// Compare read data against the expected pattern
    #[serde(default)]
    pub verify_read: bool,

    /// Turn verification mismatches into a fatal error
    #[serde(default)]
    pub abort_on_data_error: bool,

    /// Sleep before each item test
    #[serde(default, with = "humantime_serde")]
    pub pre_delay: Duration,

    /// Warn about ranks whose timestamps stray this many seconds from the
    /// mean (0 = off)
    #[serde(default)]
    pub outlier_threshold: f64,

    /// Request collective I/O; reset with a warning when unsupported
    #[serde(default)]
    pub collective_io: bool,

    /// Optional file-per-process bandwidth phase
    #[serde(default)]
    pub transfer: Option<TransferConfig>,
}

fn default_branch_factor() -> u64 {
    DEFAULT_BRANCH_FACTOR
}

fn default_depth() -> u32 {
    DEFAULT_DEPTH
}

fn default_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

fn default_barriers() -> bool {
    DEFAULT_BARRIERS
}

fn default_wear_out() -> bool {
    DEFAULT_WEAR_OUT
}

fn default_true() -> bool {
    true
}

fn default_stride() -> usize {
    1
}

/// `first..=last` task counts, stepping by `stride`
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct TaskRange {
    #[serde(default)]
    pub first: Option<usize>,
    #[serde(default)]
    pub last: Option<usize>,
    #[serde(default = "default_stride")]
    pub stride: usize,
}

impl Default for TaskRange {
    fn default() -> Self {
        Self {
            first: None,
            last: None,
            stride: default_stride(),
        }
    }
}

impl TaskRange {
    /// Expand into the task counts to run for a group of `group_size`.
    pub fn counts(&self, group_size: usize) -> Result<Vec<usize>, BenchError> {
        let last = self.last.unwrap_or(group_size);
        let first = self.first.unwrap_or(last);
        if self.stride == 0 {
            return Err(BenchError::Config("task stride must be at least 1".to_string()));
        }
        if first == 0 || first > last {
            return Err(BenchError::Config(format!(
                "invalid task range {}..={}",
                first, last
            )));
        }
        if last > group_size {
            return Err(BenchError::Config(format!(
                "task range ends at {} but only {} ranks are running",
                last, group_size
            )));
        }
        Ok((first..=last).step_by(self.stride).collect())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PhaseSelection {
    #[serde(default = "default_true")]
    pub create: bool,
    #[serde(default = "default_true")]
    pub stat: bool,
    #[serde(default = "default_true")]
    pub read: bool,
    #[serde(default = "default_true")]
    pub remove: bool,
}

impl Default for PhaseSelection {
    fn default() -> Self {
        Self {
            create: true,
            stat: true,
            read: true,
            remove: true,
        }
    }
}

/// Directory items, file items, or both
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct TargetSelection {
    #[serde(default)]
    pub dirs: bool,
    #[serde(default)]
    pub files: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StonewallConfig {
    /// Phase deadline (e.g. "300s"); zero disables stonewalling
    #[serde(default, with = "humantime_serde")]
    pub deadline: Duration,

    /// Bring every rank to the same item count after the deadline
    #[serde(default = "default_wear_out")]
    pub wear_out: bool,

    #[serde(default)]
    pub scope: StonewallScope,
}

impl Default for StonewallConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::ZERO,
            wear_out: DEFAULT_WEAR_OUT,
            scope: StonewallScope::default(),
        }
    }
}

impl StonewallConfig {
    pub fn settings(&self) -> StonewallSettings {
        StonewallSettings {
            deadline: self.deadline,
            wear_out: self.wear_out,
        }
    }
}

/// File-per-process bandwidth phase
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    #[serde(default = "default_transfer_size")]
    pub transfer_size: u64,
    #[serde(default = "default_segments")]
    pub segments: u64,
    /// fsync after the write loop
    #[serde(default)]
    pub fsync: bool,
    /// Check read data against the writer's pattern
    #[serde(default)]
    pub verify: bool,
    /// Read the file written by `rank + reorder_offset`
    #[serde(default)]
    pub reorder_offset: usize,
    /// Leave the files in place after the read
    #[serde(default)]
    pub keep_files: bool,
}

fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

fn default_transfer_size() -> u64 {
    DEFAULT_TRANSFER_SIZE
}

fn default_segments() -> u64 {
    DEFAULT_SEGMENTS
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            transfer_size: DEFAULT_TRANSFER_SIZE,
            segments: DEFAULT_SEGMENTS,
            fsync: false,
            verify: false,
            reorder_offset: 0,
            keep_files: false,
        }
    }
}

impl TransferConfig {
    /// Transfers per segment
    pub fn transfers_per_block(&self) -> u64 {
        self.block_size / self.transfer_size.max(1)
    }

    /// Total write/read calls per task
    pub fn pairs(&self) -> u64 {
        self.transfers_per_block() * self.segments
    }

    pub fn bytes_per_task(&self) -> u64 {
        self.block_size * self.segments
    }
}

impl RunConfig {
    /// Minimal configuration rooted at `work_dir`
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            backend: BackendKind::default(),
            branch_factor: DEFAULT_BRANCH_FACTOR,
            depth: DEFAULT_DEPTH,
            items: 0,
            items_per_dir: 0,
            leaf_only: false,
            iterations: DEFAULT_ITERATIONS,
            tasks: TaskRange::default(),
            barriers: DEFAULT_BARRIERS,
            phases: PhaseSelection::default(),
            targets: TargetSelection::default(),
            stonewall: StonewallConfig::default(),
            random_seed: 0,
            collective_creates: false,
            unique_dir_per_task: false,
            shared_file: false,
            neighbor_stride: 0,
            write_bytes: 0,
            read_bytes: 0,
            sync_file: false,
            verify_read: false,
            abort_on_data_error: false,
            pre_delay: Duration::ZERO,
            outlier_threshold: 0.0,
            collective_io: false,
            transfer: None,
        }
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn sharing(&self) -> Sharing {
        if self.shared_file {
            Sharing::SharedFile
        } else if self.unique_dir_per_task {
            Sharing::UniqueDirPerTask
        } else {
            Sharing::SharedTree
        }
    }

    /// Check option combinations and apply the auto-corrections.
    ///
    /// Returns the warnings for corrections that change what the user asked
    /// for; fatal combinations return [`BenchError::Config`].
    pub fn validate(&mut self, capabilities: Capabilities) -> Result<Vec<String>, BenchError> {
        let mut warnings = Vec::new();

        if !self.targets.dirs && !self.targets.files {
            self.targets.dirs = true;
            self.targets.files = true;
        }
        if self.shared_file && self.targets.dirs {
            self.targets.dirs = false;
            warnings.push("shared file mode has no directory items; directory tests disabled".to_string());
        }
        if !self.barriers && self.neighbor_stride != 0 {
            return Err(BenchError::Config(
                "possible race conditions: disabling barriers is not compatible with a neighbor stride"
                    .to_string(),
            ));
        }
        if self.shared_file && self.collective_creates {
            return Err(BenchError::Config(
                "collective creates are not compatible with shared file mode".to_string(),
            ));
        }
        if self.collective_creates && !self.barriers {
            return Err(BenchError::Config(
                "collective creates require barriers".to_string(),
            ));
        }
        if self.unique_dir_per_task && self.shared_file {
            return Err(BenchError::Config(
                "unique directory per task is not compatible with shared file mode".to_string(),
            ));
        }
        if self.branch_factor < 1 && self.depth > 0 {
            return Err(BenchError::Config(
                "branch factor must be at least 1 when depth > 0".to_string(),
            ));
        }
        if self.items > 0 && self.items_per_dir > 0 {
            return Err(BenchError::Config(
                "only specify the number of items or the number of items per directory".to_string(),
            ));
        }
        if self.items == 0 && self.items_per_dir == 0 {
            return Err(BenchError::Namespace("no items requested".to_string()));
        }
        if self.iterations == 0 {
            return Err(BenchError::Config("iterations must be at least 1".to_string()));
        }
        if !self.stonewall.deadline.is_zero() && !self.barriers {
            return Err(BenchError::Config(
                "stonewalling requires barriers".to_string(),
            ));
        }
        if self.collective_io && !capabilities.collective_io {
            self.collective_io = false;
            warnings.push(format!(
                "collective I/O is not supported by the {:?} backend; using independent I/O",
                self.backend
            ));
        }
        if self.sync_file && !capabilities.fsync {
            self.sync_file = false;
            warnings.push("backend cannot fsync; sync_file disabled".to_string());
        }
        if self.verify_read && self.write_bytes == 0 {
            self.verify_read = false;
            warnings.push("verify_read needs write_bytes > 0; verification disabled".to_string());
        }
        if self.outlier_threshold < 0.0 {
            return Err(BenchError::Config("outlier threshold must not be negative".to_string()));
        }
        if let Some(transfer) = &self.transfer {
            if transfer.block_size == 0 || transfer.transfer_size == 0 || transfer.segments == 0 {
                return Err(BenchError::Config(
                    "transfer block size, transfer size and segments must be non-zero".to_string(),
                ));
            }
            if transfer.block_size % transfer.transfer_size != 0 {
                return Err(BenchError::Config(format!(
                    "block size {} must be a multiple of transfer size {}",
                    transfer.block_size, transfer.transfer_size
                )));
            }
        }
        Ok(warnings)
    }
}
