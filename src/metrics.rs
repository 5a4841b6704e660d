//! Per-operation latency histograms
//!
//! One HDR histogram per result-table column. Each rank records its own
//! item latencies; at the end of a run the per-rank summaries are gathered
//! and rank 0 prints the combined table.

use anyhow::{anyhow, Result};
use hdrhistogram::Histogram;
use serde::Serialize;
use std::time::Duration;

use crate::comm::{CommError, Communicator};
use crate::constants::{HISTOGRAM_MAX_MICROS, HISTOGRAM_SIGFIG};
use crate::stats::{Column, COLUMNS, NUM_COLUMNS};

fn new_histogram() -> Result<Histogram<u64>> {
    Histogram::<u64>::new_with_bounds(1, HISTOGRAM_MAX_MICROS, HISTOGRAM_SIGFIG)
        .map_err(|e| anyhow!("failed to allocate histogram: {:?}", e))
}

/// Latency histograms for every column, owned by one rank
#[derive(Debug, Clone)]
pub struct OpHists {
    hists: Vec<Histogram<u64>>,
}

impl OpHists {
    pub fn new() -> Result<Self> {
        let hists = (0..NUM_COLUMNS)
            .map(|_| new_histogram())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { hists })
    }

    /// Record one item latency; values past the upper bound saturate
    pub fn record(&mut self, column: Column, duration: Duration) {
        let micros = (duration.as_micros() as u64).max(1);
        self.hists[column.index()].saturating_record(micros);
    }

    pub fn summary(&self, column: Column) -> Option<LatencySummary> {
        let hist = &self.hists[column.index()];
        if hist.len() == 0 {
            return None;
        }
        Some(LatencySummary {
            count: hist.len(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50) as f64,
            p95: hist.value_at_quantile(0.95) as f64,
            p99: hist.value_at_quantile(0.99) as f64,
            max: hist.max() as f64,
        })
    }
}

/// Latency figures of one column, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

const SUMMARY_FIELDS: usize = 6;

impl LatencySummary {
    fn encode(summary: Option<&LatencySummary>) -> [f64; SUMMARY_FIELDS] {
        match summary {
            Some(s) => [s.count as f64, s.mean, s.p50, s.p95, s.p99, s.max],
            None => [0.0; SUMMARY_FIELDS],
        }
    }

    fn decode(values: &[f64]) -> Option<LatencySummary> {
        if values.len() < SUMMARY_FIELDS || values[0] == 0.0 {
            return None;
        }
        Some(LatencySummary {
            count: values[0] as u64,
            mean: values[1],
            p50: values[2],
            p95: values[3],
            p99: values[4],
            max: values[5],
        })
    }

    /// Fold per-rank summaries: counts add, the mean is count-weighted and
    /// the percentiles take the worst rank.
    pub fn combine(parts: &[LatencySummary]) -> Option<LatencySummary> {
        let count: u64 = parts.iter().map(|p| p.count).sum();
        if count == 0 {
            return None;
        }
        let weighted: f64 = parts.iter().map(|p| p.mean * p.count as f64).sum();
        let worst = |f: fn(&LatencySummary) -> f64| parts.iter().map(f).fold(0.0, f64::max);
        Some(LatencySummary {
            count,
            mean: weighted / count as f64,
            p50: worst(|p| p.p50),
            p95: worst(|p| p.p95),
            p99: worst(|p| p.p99),
            max: worst(|p| p.max),
        })
    }
}

/// Gather every rank's latency summaries. Rank 0 gets the combined rows.
pub fn reduce_latencies<C: Communicator>(
    comm: &C,
    hists: &OpHists,
) -> Result<Option<Vec<(Column, LatencySummary)>>, CommError> {
    let flat: Vec<f64> = COLUMNS
        .iter()
        .flat_map(|c| LatencySummary::encode(hists.summary(*c).as_ref()))
        .collect();
    let gathered = comm.all_gather_f64(&flat)?;
    if comm.rank() != 0 {
        return Ok(None);
    }

    let mut rows = Vec::new();
    for column in COLUMNS {
        let at = column.index() * SUMMARY_FIELDS;
        let parts: Vec<LatencySummary> = gathered
            .iter()
            .filter_map(|values| values.get(at..at + SUMMARY_FIELDS))
            .filter_map(LatencySummary::decode)
            .collect();
        if let Some(combined) = LatencySummary::combine(&parts) {
            rows.push((column, combined));
        }
    }
    Ok(Some(rows))
}

pub fn print_latency_summary(rows: &[(Column, LatencySummary)]) {
    if rows.is_empty() {
        return;
    }
    println!("\nPer-item latency (µs, percentiles are the worst rank):");
    for (column, s) in rows {
        println!(
            "  [{:>20}] count={:<8} mean={:<8.0} p50={:<8.0} p95={:<8.0} p99={:<8.0} max={:<8.0}",
            column.label(),
            s.count,
            s.mean,
            s.p50,
            s.p95,
            s.p99,
            s.max
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalGroup;

    #[test]
    fn test_ophists_record() {
        let mut hists = OpHists::new().unwrap();
        hists.record(Column::FileCreate, Duration::from_micros(100));
        hists.record(Column::FileCreate, Duration::from_micros(200));
        hists.record(Column::DirStat, Duration::ZERO);

        let create = hists.summary(Column::FileCreate).unwrap();
        assert_eq!(create.count, 2);
        assert!(create.p50 >= 100.0 && create.max >= 199.0);
        // zero latencies clamp to the lowest trackable value
        assert_eq!(hists.summary(Column::DirStat).unwrap().max, 1.0);
        assert!(hists.summary(Column::FileRead).is_none());
    }

    #[test]
    fn test_combine_weights_mean_and_takes_worst_percentile() {
        let a = LatencySummary { count: 1, mean: 10.0, p50: 10.0, p95: 10.0, p99: 10.0, max: 10.0 };
        let b = LatencySummary { count: 3, mean: 30.0, p50: 20.0, p95: 40.0, p99: 50.0, max: 60.0 };
        let c = LatencySummary::combine(&[a, b]).unwrap();
        assert_eq!(c.count, 4);
        assert!((c.mean - 25.0).abs() < 1e-9);
        assert_eq!(c.p99, 50.0);
        assert!(LatencySummary::combine(&[]).is_none());
    }

    #[test]
    fn test_reduce_latencies() {
        let rows = LocalGroup::run(2, |comm| {
            let mut hists = OpHists::new()?;
            hists.record(Column::FileRemove, Duration::from_micros(100 * (comm.rank() as u64 + 1)));
            Ok(reduce_latencies(&comm, &hists)?)
        })
        .unwrap();
        let rows = rows[0].as_ref().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, Column::FileRemove);
        assert_eq!(rows[0].1.count, 2);
    }
}
