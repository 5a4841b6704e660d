// src/walker/mod.rs
//! Parallel find / delete over an arbitrary directory tree.
//!
//! Rank 0 seeds the distributed queue with the search root. Directories are
//! listed by whichever rank dequeues them; sub-directories go back on the
//! queue, files are handled in place. Per-entry failures are counted and the
//! walk continues.

pub mod queue;

use anyhow::{Context, Result};
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, FileType, Metadata};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

use crate::comm::{Communicator, Mailbox, ReduceOp};
use crate::stonewall::Progress;
use queue::{drain_mailbox, DistributedQueue, ItemTag, WorkItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum WalkMode {
    /// Count files matching the predicate
    #[default]
    Find,
    /// Unlink every file, no predicate
    Delete,
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub root: PathBuf,
    pub mode: WalkMode,
    /// Substring the file name must contain
    pub name_filter: Option<String>,
    /// Exact size in bytes
    pub expected_size: Option<u64>,
    /// Reference file; matching files must be modified after it
    pub newer_than: Option<PathBuf>,
    /// Stop listing directories after this long (zero = off)
    pub stonewall: Duration,
}

/// Reduced over all ranks
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct FindResults {
    pub found: u64,
    /// Files examined (find) or unlinked (delete)
    pub scanned: u64,
    pub dirs: u64,
    pub errors: u64,
    /// Seconds, slowest rank
    pub runtime: f64,
    /// Files per second
    pub rate: f64,
}

impl FindResults {
    pub fn print(&self, mode: WalkMode) {
        let what = match mode {
            WalkMode::Find => "found",
            WalkMode::Delete => "deleted",
        };
        println!(
            "MATCHED {}/{} ({}) dirs: {} errors: {} runtime: {:.3}s rate: {:.1} files/s",
            self.found, self.scanned, what, self.dirs, self.errors, self.runtime, self.rate
        );
    }
}

/// Predicate applied to regular files in find mode
#[derive(Debug, Clone)]
struct Matcher {
    name_filter: Option<Vec<u8>>,
    expected_size: Option<u64>,
    newer_than: Option<SystemTime>,
}

impl Matcher {
    fn needs_metadata(&self) -> bool {
        self.expected_size.is_some() || self.newer_than.is_some()
    }

    fn name_matches(&self, name: &[u8]) -> bool {
        match &self.name_filter {
            Some(filter) => filter.is_empty() || name.windows(filter.len()).any(|w| w == filter.as_slice()),
            None => true,
        }
    }

    fn metadata_matches(&self, meta: &Metadata) -> bool {
        if let Some(size) = self.expected_size {
            if meta.len() != size {
                return false;
            }
        }
        if let Some(reference) = self.newer_than {
            match meta.modified() {
                // same-second timestamps count as newer
                Ok(modified) if modified >= reference => {}
                _ => return false,
            }
        }
        true
    }
}

/// A directory entry whose `lstat` is performed at most once
struct Entry {
    path: PathBuf,
    name: OsString,
    file_type: Option<FileType>,
    metadata: Option<Metadata>,
}

impl Entry {
    fn from_dir_entry(entry: fs::DirEntry) -> Self {
        Self {
            path: entry.path(),
            name: entry.file_name(),
            // d_type when the file system reports it
            file_type: entry.file_type().ok(),
            metadata: None,
        }
    }

    fn metadata(&mut self) -> std::io::Result<&Metadata> {
        if self.metadata.is_none() {
            self.metadata = Some(fs::symlink_metadata(&self.path)?);
        }
        // filled just above
        self.metadata
            .as_ref()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "metadata cache empty"))
    }

    fn tag(&mut self) -> std::io::Result<ItemTag> {
        let file_type = match self.file_type {
            Some(t) => t,
            None => self.metadata()?.file_type(),
        };
        Ok(if file_type.is_dir() {
            ItemTag::Dir
        } else if file_type.is_file() {
            ItemTag::File
        } else {
            ItemTag::Other
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LocalCounts {
    found: u64,
    scanned: u64,
    dirs: u64,
    errors: u64,
}

/// Walk `opts.root` with every rank of `comm`. All ranks get the reduced
/// results.
pub fn run_find<C>(comm: &C, opts: &FindOptions) -> Result<FindResults>
where
    C: Communicator + Mailbox,
{
    let newer_than = match &opts.newer_than {
        Some(reference) => Some(
            fs::metadata(reference)
                .and_then(|m| m.modified())
                .with_context(|| format!("unable to stat reference file {}", reference.display()))?,
        ),
        None => None,
    };
    let matcher = Matcher {
        name_filter: opts.name_filter.as_ref().map(|s| s.as_bytes().to_vec()),
        expected_size: opts.expected_size,
        newer_than,
    };

    let mut queue = DistributedQueue::new(comm, comm.rank(), comm.size());
    let mut counts = LocalCounts::default();
    if comm.rank() == 0 {
        let meta = fs::symlink_metadata(&opts.root)
            .with_context(|| format!("unable to stat search root {}", opts.root.display()))?;
        if meta.is_dir() {
            queue.push(WorkItem::dir(&opts.root));
        } else if meta.is_file() {
            queue.push(WorkItem {
                tag: ItemTag::File,
                path: opts.root.clone(),
            });
        }
        info!(root = %opts.root.display(), mode = ?opts.mode, ranks = comm.size(), "starting walk");
    }

    comm.barrier()?;
    let started = Instant::now();
    let progress = Progress::begin(opts.stonewall);
    queue.run(|item| {
        Ok(process_item(item, opts.mode, &matcher, &progress, &mut counts))
    })?;
    let runtime = started.elapsed().as_secs_f64();

    comm.barrier()?;
    let stale = drain_mailbox(comm)?;
    if stale > 0 {
        debug!(rank = comm.rank(), stale, "dropped late walker messages");
    }
    comm.barrier()?;

    let found = comm.all_reduce_u64(counts.found, ReduceOp::Sum)?;
    let scanned = comm.all_reduce_u64(counts.scanned, ReduceOp::Sum)?;
    let dirs = comm.all_reduce_u64(counts.dirs, ReduceOp::Sum)?;
    let errors = comm.all_reduce_u64(counts.errors, ReduceOp::Sum)?;
    let runtime = comm.all_reduce_f64(runtime, ReduceOp::Max)?;
    let rate = if runtime > 0.0 { scanned as f64 / runtime } else { 0.0 };

    Ok(FindResults {
        found,
        scanned,
        dirs,
        errors,
        runtime,
        rate,
    })
}

/// Returns the directories discovered while handling `item`.
fn process_item(
    item: WorkItem,
    mode: WalkMode,
    matcher: &Matcher,
    progress: &Progress,
    counts: &mut LocalCounts,
) -> Vec<WorkItem> {
    match item.tag {
        ItemTag::Dir => scan_dir(&item.path, mode, matcher, progress, counts),
        ItemTag::File => {
            let name = item
                .path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default();
            let mut entry = Entry {
                path: item.path,
                name,
                file_type: None,
                metadata: None,
            };
            handle_file(&mut entry, mode, matcher, counts);
            Vec::new()
        }
        ItemTag::Other => Vec::new(),
    }
}

fn scan_dir(
    dir: &Path,
    mode: WalkMode,
    matcher: &Matcher,
    progress: &Progress,
    counts: &mut LocalCounts,
) -> Vec<WorkItem> {
    let mut discovered = Vec::new();
    let listing = match fs::read_dir(dir) {
        Ok(listing) => listing,
        Err(e) => {
            warn!("unable to list {}: {}", dir.display(), e);
            counts.errors += 1;
            return discovered;
        }
    };
    counts.dirs += 1;

    for entry in listing {
        let mut entry = match entry {
            Ok(entry) => Entry::from_dir_entry(entry),
            Err(e) => {
                debug!("bad entry in {}: {}", dir.display(), e);
                counts.errors += 1;
                continue;
            }
        };
        match entry.tag() {
            Ok(ItemTag::Dir) => discovered.push(WorkItem::dir(entry.path)),
            Ok(ItemTag::File) => handle_file(&mut entry, mode, matcher, counts),
            Ok(ItemTag::Other) => {}
            Err(e) => {
                debug!("unable to stat {}: {}", entry.path.display(), e);
                counts.errors += 1;
            }
        }
        if progress.expired() {
            debug!(dir = %dir.display(), "stonewall hit, truncating directory scan");
            break;
        }
    }
    discovered
}

fn handle_file(entry: &mut Entry, mode: WalkMode, matcher: &Matcher, counts: &mut LocalCounts) {
    match mode {
        WalkMode::Delete => match fs::remove_file(&entry.path) {
            Ok(()) => {
                counts.scanned += 1;
                counts.found += 1;
            }
            Err(e) => {
                debug!("unable to unlink {}: {}", entry.path.display(), e);
                counts.errors += 1;
            }
        },
        WalkMode::Find => {
            counts.scanned += 1;
            if !matcher.name_matches(entry.name.as_bytes()) {
                return;
            }
            if matcher.needs_metadata() {
                match entry.metadata().map(|meta| matcher.metadata_matches(meta)) {
                    Ok(true) => counts.found += 1,
                    Ok(false) => {}
                    Err(e) => {
                        debug!("unable to stat {}: {}", entry.path.display(), e);
                        counts.errors += 1;
                    }
                }
            } else {
                counts.found += 1;
            }
        }
    }
}
