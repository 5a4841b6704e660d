// src/backend.rs
//
// Storage capability set the benchmark core drives
//
// The core never names a concrete storage API. It is handed one value
// implementing `Backend`, chosen once when the run is configured, and every
// phase goes through it. All calls are synchronous and block only the
// calling rank.

use crate::error::BenchResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::SystemTime;

/// Attributes the core needs back from `stat`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub is_dir: bool,
    pub is_file: bool,
}

/// Capacity and inode usage of the file system holding a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
}

impl FsUsage {
    pub fn used_bytes_percent(&self) -> f64 {
        percent_used(self.total_bytes, self.free_bytes)
    }

    pub fn used_inodes_percent(&self) -> f64 {
        percent_used(self.total_inodes, self.free_inodes)
    }
}

fn percent_used(total: u64, free: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * (total.saturating_sub(free)) as f64 / total as f64
    }
}

/// Access permission test modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Exists,
}

impl AccessMode {
    /// Convert to POSIX access() mode bits
    pub fn to_posix_mode(&self) -> i32 {
        match self {
            AccessMode::Read => libc::R_OK,
            AccessMode::Write => libc::W_OK,
            AccessMode::Exists => libc::F_OK,
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::Read => write!(f, "read"),
            AccessMode::Write => write!(f, "write"),
            AccessMode::Exists => write!(f, "exists"),
        }
    }
}

/// How an existing file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
}

/// Optional features a backend may or may not offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Coordinated multi-rank I/O on a shared handle
    pub collective_io: bool,
    /// `fsync` actually reaches stable storage
    pub fsync: bool,
}

/// Which backend implementation a run uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Posix,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "posix" | "file" => Ok(BackendKind::Posix),
            _ => Err(anyhow::anyhow!("Unsupported backend: {}", s)),
        }
    }
}

/// Storage operations used by the benchmark phases.
///
/// Every error is a [`crate::error::BenchError::Backend`] naming the
/// operation and path, so callers can report it or test for "not found".
pub trait Backend: Send + Sync {
    /// Open file handle, released by [`Backend::close`] or on drop
    type Handle: Send;

    fn name(&self) -> &'static str;
    fn capabilities(&self) -> Capabilities;

    /// Create (or truncate) a file and open it for writing
    fn create(&self, path: &Path) -> BenchResult<Self::Handle>;
    fn open(&self, path: &Path, mode: OpenMode) -> BenchResult<Self::Handle>;
    fn close(&self, handle: Self::Handle, path: &Path) -> BenchResult<()>;

    fn write_at(&self, handle: &mut Self::Handle, buf: &[u8], offset: u64, path: &Path) -> BenchResult<usize>;
    fn read_at(&self, handle: &mut Self::Handle, buf: &mut [u8], offset: u64, path: &Path) -> BenchResult<usize>;
    fn fsync(&self, handle: &mut Self::Handle, path: &Path) -> BenchResult<()>;

    fn delete(&self, path: &Path) -> BenchResult<()>;
    fn mkdir(&self, path: &Path) -> BenchResult<()>;
    fn rmdir(&self, path: &Path) -> BenchResult<()>;
    fn stat(&self, path: &Path) -> BenchResult<FileStat>;
    fn access(&self, path: &Path, mode: AccessMode) -> BenchResult<bool>;
    fn statfs(&self, path: &Path) -> BenchResult<FsUsage>;
}

/// Print file-system capacity and inode usage for the test path.
pub fn display_freespace<B: Backend>(backend: &B, path: &Path) -> BenchResult<FsUsage> {
    let usage = backend.statfs(path)?;
    let gib = crate::constants::GIBIBYTE;
    println!(
        "Path: {}\nFS: {:.1} GiB   Used FS: {:.1}%   Inodes: {:.1} Mi   Used Inodes: {:.1}%",
        path.display(),
        usage.total_bytes as f64 / gib,
        usage.used_bytes_percent(),
        usage.total_inodes as f64 / (1024.0 * 1024.0),
        usage.used_inodes_percent(),
    );
    Ok(usage)
}
