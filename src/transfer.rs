// src/transfer.rs
//! File-per-process bandwidth phase.
//!
//! Each rank writes `segments × block_size` bytes to its own file in
//! `transfer_size` calls, then reads a file back, optionally the one written
//! by `rank + reorder_offset` so the read misses the client cache. Twelve
//! timestamps per repetition (open, transfer and close, start and end, for
//! write then read) feed the usual min-start/max-end reduction.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::backend::{AccessMode, Backend, OpenMode};
use crate::buffers::{count_mismatches, fill_pattern, AlignedBuffer, PatternSeed};
use crate::comm::{Communicator, ReduceOp};
use crate::config::{RunConfig, TransferConfig};
use crate::constants::{MEBIBYTE, TRANSFER_DIR_NAME, TRANSFER_TIMERS};
use crate::context::RunContext;
use crate::error::BenchError;
use crate::stats::{rate, reduce_timers, Summary, TransferTimers};
use crate::stonewall::{run_stonewalled, StonewallScope, StonewallSettings};

// Timer slots; the read half is offset by READ_BASE.
const OPEN_START: usize = 0;
const OPEN_END: usize = 1;
const XFER_START: usize = 2;
const XFER_END: usize = 3;
const CLOSE_START: usize = 4;
const CLOSE_END: usize = 5;
const READ_BASE: usize = 6;

pub const TIMER_NAMES: [&str; TRANSFER_TIMERS] = [
    "write open start",
    "write open stop",
    "write start",
    "write stop",
    "write close start",
    "write close stop",
    "read open start",
    "read open stop",
    "read start",
    "read stop",
    "read close start",
    "read close stop",
];

/// One repetition, reduced over the ranks
#[derive(Debug, Clone, Serialize)]
pub struct TransferIteration {
    pub timers: TransferTimers,
    pub write_bytes: u64,
    pub read_bytes: u64,
}

impl TransferIteration {
    /// Aggregate write bandwidth in bytes per second
    pub fn write_bandwidth(&self) -> f64 {
        rate(self.write_bytes as f64, self.timers[CLOSE_END] - self.timers[OPEN_START])
    }

    pub fn read_bandwidth(&self) -> f64 {
        rate(
            self.read_bytes as f64,
            self.timers[READ_BASE + CLOSE_END] - self.timers[READ_BASE + OPEN_START],
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub tasks: usize,
    pub iterations: Vec<TransferIteration>,
    pub data_errors: u64,
}

impl TransferReport {
    pub fn write_summary(&self) -> Option<Summary> {
        let bw: Vec<f64> = self.iterations.iter().map(|i| i.write_bandwidth()).collect();
        Summary::of(&bw)
    }

    pub fn read_summary(&self) -> Option<Summary> {
        let bw: Vec<f64> = self.iterations.iter().map(|i| i.read_bandwidth()).collect();
        Summary::of(&bw)
    }

    pub fn print(&self) {
        println!("\nTransfer phase: {} tasks, file per process", self.tasks);
        println!(
            "   {:<10} {:>12} {:>12} {:>12} {:>12}",
            "Operation", "Max(MiB)", "Min(MiB)", "Mean(MiB)", "StdDev"
        );
        for (name, summary) in [("write", self.write_summary()), ("read", self.read_summary())] {
            if let Some(s) = summary {
                println!(
                    "   {:<10} {:>12.2} {:>12.2} {:>12.2} {:>12.2}",
                    name,
                    s.max / MEBIBYTE,
                    s.min / MEBIBYTE,
                    s.mean / MEBIBYTE,
                    s.std_dev / MEBIBYTE
                );
            }
        }
        if self.data_errors > 0 {
            println!("\nWARNING: {} transfers failed data verification", self.data_errors);
        }
    }
}

pub fn transfer_file(work_dir: &Path, rank: usize) -> PathBuf {
    work_dir
        .join(TRANSFER_DIR_NAME)
        .join(format!("data.{:08}", rank))
}

/// Offset of transfer `k` within a task file
fn offset_of(xfer: &TransferConfig, k: u64) -> u64 {
    let per_block = xfer.transfers_per_block().max(1);
    (k / per_block) * xfer.block_size + (k % per_block) * xfer.transfer_size
}

/// Run the bandwidth phase `cfg.iterations` times. Rank 0 gets the report.
pub fn run_transfer<C: Communicator, B: Backend>(
    ctx: &RunContext<'_, C, B>,
    cfg: &RunConfig,
    xfer: &TransferConfig,
) -> Result<Option<TransferReport>> {
    let dir = cfg.work_dir.join(TRANSFER_DIR_NAME);
    if ctx.is_root() && !ctx.backend.access(&dir, AccessMode::Exists)? {
        ctx.backend
            .mkdir(&dir)
            .context("unable to create transfer directory")?;
    }
    ctx.comm.barrier()?;

    let mut buffer = AlignedBuffer::new(xfer.transfer_size as usize)?;
    let mut check = AlignedBuffer::new(xfer.transfer_size as usize)?;
    let mut iterations = Vec::with_capacity(cfg.iterations as usize);
    let mut local_errors = 0;

    for iteration in 0..cfg.iterations {
        let mut timers = [0.0; TRANSFER_TIMERS];
        let signature = iteration;

        let written = write_phase(ctx, cfg, xfer, signature, &mut buffer, &mut timers)?;
        let written_by = ctx.comm.all_gather_u64(written)?;

        let (read, errors) = read_phase(ctx, cfg, xfer, signature, &written_by, &mut check, &mut timers)?;
        local_errors += errors;

        if !xfer.keep_files {
            ctx.comm.barrier()?;
            let own = transfer_file(&cfg.work_dir, ctx.rank());
            ctx.backend.delete(&own)?;
        }

        let gathered = ctx.comm.all_gather_f64(&timers)?;
        warn_outliers(ctx.rank(), &timers, &gathered, cfg.outlier_threshold);

        let write_bytes = ctx.comm.all_reduce_u64(written * xfer.transfer_size, ReduceOp::Sum)?;
        let read_bytes = ctx.comm.all_reduce_u64(read * xfer.transfer_size, ReduceOp::Sum)?;
        let per_rank: Vec<TransferTimers> = gathered
            .iter()
            .map(|values| {
                let mut t = [0.0; TRANSFER_TIMERS];
                for (slot, v) in t.iter_mut().zip(values) {
                    *slot = *v;
                }
                t
            })
            .collect();
        let reduced = TransferIteration {
            timers: reduce_timers(&per_rank),
            write_bytes,
            read_bytes,
        };
        if ctx.is_root() {
            info!(
                iteration,
                write_mib_s = reduced.write_bandwidth() / MEBIBYTE,
                read_mib_s = reduced.read_bandwidth() / MEBIBYTE,
                "transfer iteration done"
            );
        }
        iterations.push(reduced);

        if cfg.abort_on_data_error {
            let errors = ctx.comm.all_reduce_u64(local_errors, ReduceOp::Sum)?;
            if errors > 0 {
                return Err(BenchError::DataIntegrity { errors }.into());
            }
        }
    }

    let data_errors = ctx.comm.all_reduce_u64(local_errors, ReduceOp::Sum)?;
    if ctx.is_root() && !xfer.keep_files {
        ctx.backend.rmdir(&dir)?;
    }
    ctx.comm.barrier()?;

    if !ctx.is_root() {
        return Ok(None);
    }
    Ok(Some(TransferReport {
        tasks: ctx.size(),
        iterations,
        data_errors,
    }))
}

fn settings(cfg: &RunConfig, read: bool) -> StonewallSettings {
    if read && cfg.stonewall.scope == StonewallScope::Create {
        StonewallSettings::disabled()
    } else {
        cfg.stonewall.settings()
    }
}

/// Returns the number of transfers written
fn write_phase<C: Communicator, B: Backend>(
    ctx: &RunContext<'_, C, B>,
    cfg: &RunConfig,
    xfer: &TransferConfig,
    signature: u32,
    buffer: &mut AlignedBuffer,
    timers: &mut TransferTimers,
) -> Result<u64> {
    let backend = ctx.backend;
    let path = transfer_file(&cfg.work_dir, ctx.rank());
    let seed = PatternSeed {
        owner: ctx.rank() as u64,
        signature,
    };

    ctx.comm.barrier()?;
    timers[OPEN_START] = ctx.now();
    let mut handle = backend.create(&path)?;
    timers[OPEN_END] = ctx.now();

    timers[XFER_START] = ctx.now();
    let outcome = run_stonewalled(ctx.comm, settings(cfg, false), xfer.pairs(), |k| {
        let offset = offset_of(xfer, k);
        fill_pattern(buffer, seed, offset);
        let n = backend.write_at(&mut handle, buffer, offset, &path)?;
        if n != buffer.len() {
            anyhow::bail!("short write on {} at offset {}", path.display(), offset);
        }
        Ok(())
    })?;
    timers[XFER_END] = ctx.now();

    timers[CLOSE_START] = ctx.now();
    if xfer.fsync {
        backend.fsync(&mut handle, &path)?;
    }
    backend.close(handle, &path)?;
    timers[CLOSE_END] = ctx.now();

    if let Some(report) = outcome.report {
        debug!(rank = ctx.rank(), ?report, "write stonewall");
    }
    Ok(outcome.items_done)
}

/// Returns transfers read and mismatching transfers
fn read_phase<C: Communicator, B: Backend>(
    ctx: &RunContext<'_, C, B>,
    cfg: &RunConfig,
    xfer: &TransferConfig,
    signature: u32,
    written_by: &[u64],
    check: &mut AlignedBuffer,
    timers: &mut TransferTimers,
) -> Result<(u64, u64)> {
    let backend = ctx.backend;
    let target = (ctx.rank() + xfer.reorder_offset) % ctx.size();
    let path = transfer_file(&cfg.work_dir, target);
    let count = written_by.get(target).copied().unwrap_or(0);
    let seed = PatternSeed {
        owner: target as u64,
        signature,
    };
    let mut errors = 0;

    ctx.comm.barrier()?;
    timers[READ_BASE + OPEN_START] = ctx.now();
    let mut handle = backend.open(&path, OpenMode::ReadOnly)?;
    timers[READ_BASE + OPEN_END] = ctx.now();

    timers[READ_BASE + XFER_START] = ctx.now();
    let outcome = run_stonewalled(ctx.comm, settings(cfg, true), count, |k| {
        let offset = offset_of(xfer, k);
        let n = backend.read_at(&mut handle, check, offset, &path)?;
        if xfer.verify && (n < check.len() || count_mismatches(check, seed, offset) > 0) {
            errors += 1;
        }
        Ok(())
    })?;
    timers[READ_BASE + XFER_END] = ctx.now();

    timers[READ_BASE + CLOSE_START] = ctx.now();
    backend.close(handle, &path)?;
    timers[READ_BASE + CLOSE_END] = ctx.now();

    if errors > 0 {
        warn!(rank = ctx.rank(), errors, "read verification failed for {}", path.display());
    }
    Ok((outcome.items_done, errors))
}

/// Warn about timer slots where this rank strays from the cross-rank mean.
fn warn_outliers(rank: usize, own: &TransferTimers, gathered: &[Vec<f64>], threshold: f64) {
    if threshold <= 0.0 {
        return;
    }
    for (slot, name) in TIMER_NAMES.iter().enumerate() {
        let values: Vec<f64> = gathered.iter().filter_map(|v| v.get(slot).copied()).collect();
        if let Some(s) = Summary::of(&values) {
            if (own[slot] - s.mean).abs() > threshold {
                warn!(
                    rank,
                    "for task {}, {} is {:.6} (mean={:.6}, stddev={:.6})",
                    rank,
                    name,
                    own[slot],
                    s.mean,
                    s.std_dev
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalGroup;
    use crate::posix::PosixBackend;
    use crate::timebase::Timebase;
    use tempfile::TempDir;

    fn xfer() -> TransferConfig {
        TransferConfig {
            block_size: 8192,
            transfer_size: 4096,
            segments: 2,
            verify: true,
            reorder_offset: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_offsets_follow_segment_layout() {
        let x = xfer();
        let offsets: Vec<u64> = (0..x.pairs()).map(|k| offset_of(&x, k)).collect();
        assert_eq!(offsets, vec![0, 4096, 8192, 12288]);
    }

    #[test]
    fn test_bandwidth_uses_reduced_window() {
        let mut timers = [0.0; TRANSFER_TIMERS];
        timers[CLOSE_END] = 2.0;
        timers[READ_BASE + OPEN_START] = 3.0;
        timers[READ_BASE + CLOSE_END] = 4.0;
        let it = TransferIteration {
            timers,
            write_bytes: 100,
            read_bytes: 100,
        };
        assert_eq!(it.write_bandwidth(), 50.0);
        assert_eq!(it.read_bandwidth(), 100.0);
    }

    #[test]
    fn test_write_then_neighbor_read() {
        let temp_dir = TempDir::new().unwrap();
        let mut cfg = RunConfig::new(temp_dir.path());
        cfg.items = 1;
        cfg.iterations = 2;
        let x = xfer();
        let backend = PosixBackend::new();

        let reports = LocalGroup::run(3, |comm| {
            let timebase = Timebase::synchronize(&comm)?;
            let ctx = RunContext::new(&comm, &backend, &timebase);
            run_transfer(&ctx, &cfg, &x)
        })
        .unwrap();

        let report = reports[0].as_ref().unwrap();
        assert!(reports[1].is_none());
        assert_eq!(report.iterations.len(), 2);
        assert_eq!(report.data_errors, 0);
        for it in &report.iterations {
            assert_eq!(it.write_bytes, 3 * 16384);
            assert_eq!(it.read_bytes, 3 * 16384);
            assert!(it.timers[READ_BASE + CLOSE_END] >= it.timers[OPEN_START]);
        }
        assert!(!temp_dir.path().join(TRANSFER_DIR_NAME).exists());
    }

    #[test]
    fn test_keep_files() {
        let temp_dir = TempDir::new().unwrap();
        let cfg = RunConfig::new(temp_dir.path());
        let x = TransferConfig {
            keep_files: true,
            block_size: 4096,
            transfer_size: 4096,
            ..Default::default()
        };
        let backend = PosixBackend::new();
        LocalGroup::run(2, |comm| {
            let timebase = Timebase::start();
            let ctx = RunContext::new(&comm, &backend, &timebase);
            run_transfer(&ctx, &cfg, &x)
        })
        .unwrap();
        let meta = std::fs::metadata(transfer_file(temp_dir.path(), 1)).unwrap();
        assert_eq!(meta.len(), 4096);
    }
}
