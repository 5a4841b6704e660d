//! TSV export for machine-readable benchmark results

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::phases::BenchmarkReport;
use crate::stats::COLUMNS;
use crate::transfer::{TransferReport, TIMER_NAMES};

/// TSV exporter for benchmark results.
///
/// Every file is named `<basename>-<kind>.tsv`.
pub struct TsvExporter {
    basename: String,
}

impl TsvExporter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            basename: path.as_ref().to_string_lossy().to_string(),
        }
    }

    fn path_for(&self, kind: &str) -> PathBuf {
        PathBuf::from(format!("{}-{}.tsv", self.basename, kind))
    }

    fn create(&self, kind: &str) -> Result<(PathBuf, BufWriter<File>)> {
        let path = self.path_for(kind);
        let f = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        Ok((path, BufWriter::new(f)))
    }

    /// One row per task count, iteration and enabled column, followed by the
    /// latency rows
    pub fn export_results(&self, reports: &[BenchmarkReport]) -> Result<PathBuf> {
        let (path, mut f) = self.create("results")?;
        writeln!(f, "tasks\titeration\toperation\titems\trate_per_sec")?;
        for report in reports {
            for (it, (row, items)) in report.table.rows.iter().zip(&report.table.items).enumerate() {
                for column in COLUMNS {
                    if let Some(rate) = row[column.index()] {
                        writeln!(
                            f,
                            "{}\t{}\t{}\t{}\t{:.3}",
                            report.tasks,
                            it,
                            column.key(),
                            items[column.index()],
                            rate
                        )?;
                    }
                }
            }
        }
        f.flush()?;

        let (latency_path, mut lf) = self.create("latency")?;
        writeln!(lf, "tasks\toperation\tcount\tmean_us\tp50_us\tp95_us\tp99_us\tmax_us")?;
        for report in reports {
            for (column, s) in &report.latencies {
                writeln!(
                    lf,
                    "{}\t{}\t{}\t{:.2}\t{:.2}\t{:.2}\t{:.2}\t{:.2}",
                    report.tasks,
                    column.key(),
                    s.count,
                    s.mean,
                    s.p50,
                    s.p95,
                    s.p99,
                    s.max
                )?;
            }
        }
        lf.flush()?;

        println!("\nTSV results exported to: {} and {}", path.display(), latency_path.display());
        Ok(path)
    }

    /// Reduced timers and bandwidth per transfer iteration
    pub fn export_transfer(&self, report: &TransferReport) -> Result<PathBuf> {
        let (path, mut f) = self.create("transfer")?;
        let timer_header: Vec<String> = TIMER_NAMES.iter().map(|n| n.replace(' ', "_")).collect();
        writeln!(
            f,
            "tasks\titeration\twrite_bytes\tread_bytes\twrite_bps\tread_bps\t{}",
            timer_header.join("\t")
        )?;
        for (it, iteration) in report.iterations.iter().enumerate() {
            let timers: Vec<String> = iteration.timers.iter().map(|t| format!("{:.6}", t)).collect();
            writeln!(
                f,
                "{}\t{}\t{}\t{}\t{:.2}\t{:.2}\t{}",
                report.tasks,
                it,
                iteration.write_bytes,
                iteration.read_bytes,
                iteration.write_bandwidth(),
                iteration.read_bandwidth(),
                timers.join("\t")
            )?;
        }
        f.flush()?;
        println!("TSV transfer results exported to: {}", path.display());
        Ok(path)
    }
}
