// src/constants.rs
//
// Central location for all constants used throughout pfs-bench
// This makes tuning and maintenance easier by having all magic numbers in one place

use std::time::Duration;

// =============================================================================
// Namespace Naming
// =============================================================================

/// Per-iteration test directory prefix (`<work_dir>/test-dir.<iteration>`)
pub const TEST_DIR_PREFIX: &str = "test-dir";

/// Base name of synthetic tree directories (`mdtest_tree.<id>`)
pub const TREE_BASE_NAME: &str = "mdtest_tree";

/// Item name stem; the task id (or `shared`) and item index follow
pub const ITEM_NAME_STEM: &str = "mdtest";

/// Item name infix used when every task addresses the same files
pub const SHARED_ITEM_TAG: &str = "shared";

/// Directory name for the file-per-process transfer phase
pub const TRANSFER_DIR_NAME: &str = "transfer";

/// Mode bits for directories created by the harness
pub const DIR_MODE: u32 = 0o755;

/// Mode bits for files created by the harness
pub const FILE_MODE: u32 = 0o644;

// =============================================================================
// Run Defaults
// =============================================================================

/// Default branch factor of the synthetic tree
pub const DEFAULT_BRANCH_FACTOR: u64 = 1;

/// Default tree depth (0 = everything in the tree root)
pub const DEFAULT_DEPTH: u32 = 0;

/// Default iteration count
pub const DEFAULT_ITERATIONS: u32 = 1;

/// Inter-phase barriers are on unless explicitly disabled
pub const DEFAULT_BARRIERS: bool = true;

/// Wear-out is the normal companion of a stonewall deadline
pub const DEFAULT_WEAR_OUT: bool = true;

/// Byte value the create phase writes when pattern verification is off
pub const DEFAULT_FILL_BYTE: u8 = 0x23;

// =============================================================================
// Transfer Phase Defaults
// =============================================================================

/// Bytes written per task per segment
pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;

/// Bytes per write/read call
pub const DEFAULT_TRANSFER_SIZE: u64 = 256 * 1024;

/// Segments per task file
pub const DEFAULT_SEGMENTS: u64 = 1;

/// Alignment for transfer and check buffers
pub const BUFFER_ALIGNMENT: usize = 4096;

/// Number of timestamps recorded per repetition (six write, six read)
pub const TRANSFER_TIMERS: usize = 12;

// =============================================================================
// Distributed Walker
// =============================================================================

/// How long an idle rank waits for a message before re-checking its state
pub const WALKER_IDLE_POLL: Duration = Duration::from_millis(2);

/// Minimum local queue length before a steal request is answered with work
pub const WALKER_MIN_SPLIT: usize = 2;

/// File size the IO500 find phase matches against
pub const DEFAULT_FIND_SIZE: u64 = 3900;

/// Name fragment the IO500 find phase matches against
pub const DEFAULT_FIND_PATTERN: &str = "01";

// =============================================================================
// Reporting
// =============================================================================

/// Upper bound for latency histograms (1 hour in microseconds)
pub const HISTOGRAM_MAX_MICROS: u64 = 3_600_000_000;

/// Significant digits kept by latency histograms
pub const HISTOGRAM_SIGFIG: u8 = 3;

pub const MEBIBYTE: f64 = 1024.0 * 1024.0;
pub const GIBIBYTE: f64 = 1024.0 * 1024.0 * 1024.0;
