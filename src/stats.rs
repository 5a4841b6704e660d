// src/stats.rs
//! Statistics reducer: per-rank timings in, aggregate rates out.
//!
//! Every rank times itself. The reducer gathers the raw samples and applies
//! one of two disciplines:
//!
//! - **Barrier**: phases were separated by barriers, so per iteration the
//!   earliest start and the latest end across ranks bound one logical
//!   duration. Statistics run over iterations only.
//! - **Free-running**: no shared boundary exists, so every rank × iteration
//!   cell is a rate of its own and statistics run over the whole matrix.
//!
//! Tree create/remove columns are always summarised across iterations.

use crate::comm::{CommError, Communicator};
use crate::constants::TRANSFER_TIMERS;
use serde::Serialize;
use tracing::warn;

/// Columns of the aggregate result table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Column {
    DirCreate,
    DirStat,
    DirRemove,
    FileCreate,
    FileStat,
    FileRead,
    FileRemove,
    TreeCreate,
    TreeRemove,
}

pub const NUM_COLUMNS: usize = 9;

pub const COLUMNS: [Column; NUM_COLUMNS] = [
    Column::DirCreate,
    Column::DirStat,
    Column::DirRemove,
    Column::FileCreate,
    Column::FileStat,
    Column::FileRead,
    Column::FileRemove,
    Column::TreeCreate,
    Column::TreeRemove,
];

impl Column {
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn label(&self) -> &'static str {
        match self {
            Column::DirCreate => "Directory creation",
            Column::DirStat => "Directory stat",
            Column::DirRemove => "Directory removal",
            Column::FileCreate => "File creation",
            Column::FileStat => "File stat",
            Column::FileRead => "File read",
            Column::FileRemove => "File removal",
            Column::TreeCreate => "Tree creation",
            Column::TreeRemove => "Tree removal",
        }
    }

    /// Short machine-friendly name (TSV, logs)
    pub fn key(&self) -> &'static str {
        match self {
            Column::DirCreate => "dir_create",
            Column::DirStat => "dir_stat",
            Column::DirRemove => "dir_remove",
            Column::FileCreate => "file_create",
            Column::FileStat => "file_stat",
            Column::FileRead => "file_read",
            Column::FileRemove => "file_remove",
            Column::TreeCreate => "tree_create",
            Column::TreeRemove => "tree_remove",
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, Column::TreeCreate | Column::TreeRemove)
    }
}

/// One rank's timing of one phase
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PhaseSample {
    /// Seconds on the shared timebase
    pub start: f64,
    pub end: f64,
    /// Items this rank processed
    pub items: u64,
}

impl PhaseSample {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// One rank's samples for one iteration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationRecord {
    samples: [Option<PhaseSample>; NUM_COLUMNS],
}

impl IterationRecord {
    pub fn set(&mut self, column: Column, sample: PhaseSample) {
        self.samples[column.index()] = Some(sample);
    }

    pub fn get(&self, column: Column) -> Option<PhaseSample> {
        self.samples[column.index()]
    }

    /// Flatten as `[present, start, end, items]` per column
    fn encode(&self) -> Vec<f64> {
        self.samples
            .iter()
            .flat_map(|s| match s {
                Some(s) => [1.0, s.start, s.end, s.items as f64],
                None => [0.0; 4],
            })
            .collect()
    }

    fn decode(values: &[f64]) -> Self {
        let mut record = IterationRecord::default();
        for (i, chunk) in values.chunks_exact(4).take(NUM_COLUMNS).enumerate() {
            if chunk[0] != 0.0 {
                record.samples[i] = Some(PhaseSample {
                    start: chunk[1],
                    end: chunk[2],
                    items: chunk[3] as u64,
                });
            }
        }
        record
    }
}

/// Aggregation discipline, chosen by whether barriers separated the phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Discipline {
    Barrier,
    FreeRunning,
}

/// max / min / mean / population standard deviation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub max: f64,
    pub min: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl Summary {
    pub fn of(values: &[f64]) -> Option<Summary> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (mean - v).powi(2)).sum::<f64>() / n;
        Some(Summary {
            max,
            min,
            mean,
            std_dev: var.sqrt(),
        })
    }
}

/// Throughput for `items` over `duration` seconds, 0 for empty intervals
pub fn rate(items: f64, duration: f64) -> f64 {
    if duration > 0.0 {
        items / duration
    } else {
        0.0
    }
}

/// Rates per column; `None` where the phase did not run
pub type Row = [Option<f64>; NUM_COLUMNS];

/// Aggregate result table, owned by rank 0 after reduction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultTable {
    pub discipline: Discipline,
    pub ranks: usize,
    /// One logical rate per iteration (barrier-reduced)
    pub rows: Vec<Row>,
    /// Items processed per iteration across all ranks
    pub items: Vec<[u64; NUM_COLUMNS]>,
    /// Per-rank rates, `cells[rank][iteration]`, for the free-running formula
    pub cells: Vec<Vec<Row>>,
}

impl ResultTable {
    /// Reduce gathered records: `records[rank][iteration]`.
    pub fn from_records(records: &[Vec<IterationRecord>], discipline: Discipline) -> Self {
        let ranks = records.len();
        let iterations = records.iter().map(Vec::len).max().unwrap_or(0);
        let mut rows = Vec::with_capacity(iterations);
        let mut items = Vec::with_capacity(iterations);

        for it in 0..iterations {
            let mut row: Row = [None; NUM_COLUMNS];
            let mut row_items = [0u64; NUM_COLUMNS];
            for column in COLUMNS {
                let samples: Vec<PhaseSample> = records
                    .iter()
                    .filter_map(|r| r.get(it).and_then(|rec| rec.get(column)))
                    .collect();
                if samples.is_empty() {
                    continue;
                }
                let start = samples.iter().map(|s| s.start).fold(f64::INFINITY, f64::min);
                let end = samples.iter().map(|s| s.end).fold(f64::NEG_INFINITY, f64::max);
                let total: u64 = samples.iter().map(|s| s.items).sum();
                row[column.index()] = Some(rate(total as f64, end - start));
                row_items[column.index()] = total;
            }
            rows.push(row);
            items.push(row_items);
        }

        // a rank's cell extrapolates to every rank that did the same work
        let workers: Vec<[usize; NUM_COLUMNS]> = (0..iterations)
            .map(|it| {
                let mut counts = [0usize; NUM_COLUMNS];
                for column in COLUMNS {
                    counts[column.index()] = records
                        .iter()
                        .filter_map(|r| r.get(it).and_then(|rec| rec.get(column)))
                        .filter(|s| s.items > 0)
                        .count();
                }
                counts
            })
            .collect();

        let cells = records
            .iter()
            .map(|per_rank| {
                per_rank
                    .iter()
                    .zip(&workers)
                    .map(|(rec, counts)| {
                        let mut row: Row = [None; NUM_COLUMNS];
                        for column in COLUMNS {
                            if let Some(s) = rec.get(column) {
                                let scaled = s.items as f64 * counts[column.index()] as f64;
                                row[column.index()] = Some(rate(scaled, s.duration()));
                            }
                        }
                        row
                    })
                    .collect()
            })
            .collect();

        Self {
            discipline,
            ranks,
            rows,
            items,
            cells,
        }
    }

    /// Summary statistics for one column under the table's discipline
    pub fn summary(&self, column: Column) -> Option<Summary> {
        let values: Vec<f64> = match (self.discipline, column.is_tree()) {
            (Discipline::FreeRunning, false) => self
                .cells
                .iter()
                .flatten()
                .filter_map(|row| row[column.index()])
                .collect(),
            _ => self.rows.iter().filter_map(|row| row[column.index()]).collect(),
        };
        Summary::of(&values)
    }

    /// Print the SUMMARY block for the enabled columns
    pub fn print_summary(&self) {
        println!("\nSUMMARY rate: (of {} iterations)", self.rows.len());
        println!(
            "   {:<20} {:>14} {:>14} {:>14} {:>14}",
            "Operation", "Max", "Min", "Mean", "Std Dev"
        );
        println!(
            "   {:<20} {:>14} {:>14} {:>14} {:>14}",
            "---------", "---", "---", "----", "-------"
        );
        for column in COLUMNS {
            if let Some(s) = self.summary(column) {
                println!(
                    "   {:<20} {:>14.3} {:>14.3} {:>14.3} {:>14.3}",
                    format!("{}:", column.label()),
                    s.max,
                    s.min,
                    s.mean,
                    s.std_dev
                );
            }
        }
    }
}

/// Gather every rank's records; rank 0 gets the table, others `None`.
pub fn reduce_records<C: Communicator>(
    comm: &C,
    records: &[IterationRecord],
    discipline: Discipline,
    outlier_threshold: f64,
) -> Result<Option<ResultTable>, CommError> {
    let flat: Vec<f64> = records.iter().flat_map(IterationRecord::encode).collect();
    let gathered = comm.all_gather_f64(&flat)?;
    let all: Vec<Vec<IterationRecord>> = gathered
        .iter()
        .map(|values| {
            values
                .chunks_exact(NUM_COLUMNS * 4)
                .map(IterationRecord::decode)
                .collect()
        })
        .collect();

    if outlier_threshold > 0.0 {
        for outlier in find_outliers(&all, comm.rank(), outlier_threshold) {
            warn!(
                rank = comm.rank(),
                "for task {}, {} {} is {:.6} (mean={:.6}, stddev={:.6})",
                comm.rank(),
                outlier.column.key(),
                outlier.slot,
                outlier.value,
                outlier.mean,
                outlier.std_dev
            );
        }
    }

    if comm.rank() != 0 {
        return Ok(None);
    }
    Ok(Some(ResultTable::from_records(&all, discipline)))
}

/// A timestamp slot where one rank strays from the cross-rank mean
#[derive(Debug, Clone, PartialEq)]
pub struct Outlier {
    pub iteration: usize,
    pub column: Column,
    pub slot: &'static str,
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
}

/// Compare `rank`'s start, end and elapsed values against the mean of all
/// ranks for the same slot. Diagnostic only; rates are unaffected.
pub fn find_outliers(records: &[Vec<IterationRecord>], rank: usize, threshold: f64) -> Vec<Outlier> {
    let mut found = Vec::new();
    let Some(mine) = records.get(rank) else {
        return found;
    };
    for (iteration, record) in mine.iter().enumerate() {
        for column in COLUMNS {
            let Some(own) = record.get(column) else {
                continue;
            };
            let peers: Vec<PhaseSample> = records
                .iter()
                .filter_map(|r| r.get(iteration).and_then(|rec| rec.get(column)))
                .collect();
            let slots: [(&'static str, fn(&PhaseSample) -> f64); 3] = [
                ("start time", |s| s.start),
                ("elapsed time", |s| s.duration()),
                ("end time", |s| s.end),
            ];
            for (slot, pick) in slots {
                let values: Vec<f64> = peers.iter().map(pick).collect();
                if let Some(summary) = Summary::of(&values) {
                    let value = pick(&own);
                    if (value - summary.mean).abs() > threshold {
                        found.push(Outlier {
                            iteration,
                            column,
                            slot,
                            value,
                            mean: summary.mean,
                            std_dev: summary.std_dev,
                        });
                    }
                }
            }
        }
    }
    found
}

/// Twelve transfer timestamps of one repetition
pub type TransferTimers = [f64; TRANSFER_TIMERS];

/// Earliest start for even slots, latest end for odd slots.
pub fn reduce_timers(per_rank: &[TransferTimers]) -> TransferTimers {
    let mut reduced = [0.0; TRANSFER_TIMERS];
    for (i, slot) in reduced.iter_mut().enumerate() {
        let values = per_rank.iter().map(|t| t[i]);
        *slot = if i % 2 == 0 {
            values.fold(f64::INFINITY, f64::min)
        } else {
            values.fold(f64::NEG_INFINITY, f64::max)
        };
    }
    reduced
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalGroup;

    fn sample(start: f64, end: f64, items: u64) -> PhaseSample {
        PhaseSample { start, end, items }
    }

    fn record(column: Column, s: PhaseSample) -> IterationRecord {
        let mut r = IterationRecord::default();
        r.set(column, s);
        r
    }

    #[test]
    fn test_summary_population_std_dev() {
        let s = Summary::of(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(s.max, 9.0);
        assert_eq!(s.min, 2.0);
        assert!((s.mean - 5.0).abs() < 1e-12);
        assert!((s.std_dev - 2.0).abs() < 1e-12);
        assert!(Summary::of(&[]).is_none());
    }

    #[test]
    fn test_barrier_discipline_uses_min_start_max_end() {
        // two ranks, one iteration: logical duration is 1.0..3.0
        let records = vec![
            vec![record(Column::FileCreate, sample(1.0, 2.5, 100))],
            vec![record(Column::FileCreate, sample(1.2, 3.0, 100))],
        ];
        let table = ResultTable::from_records(&records, Discipline::Barrier);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0][Column::FileCreate.index()], Some(100.0));
        assert_eq!(table.items[0][Column::FileCreate.index()], 200);
        assert_eq!(table.rows[0][Column::FileStat.index()], None);
        let s = table.summary(Column::FileCreate).unwrap();
        assert_eq!(s.std_dev, 0.0);
    }

    #[test]
    fn test_free_running_discipline_uses_every_cell() {
        let records = vec![
            vec![record(Column::DirStat, sample(0.0, 1.0, 50))],
            vec![record(Column::DirStat, sample(0.0, 2.0, 50))],
        ];
        let table = ResultTable::from_records(&records, Discipline::FreeRunning);
        let s = table.summary(Column::DirStat).unwrap();
        // per cell: 50 items * 2 ranks / duration
        assert_eq!(s.max, 100.0);
        assert_eq!(s.min, 50.0);
        assert_eq!(s.mean, 75.0);
    }

    #[test]
    fn test_free_running_scales_by_working_ranks_only() {
        // shared-file removal: rank 0 deletes, the others idle
        let records = vec![
            vec![record(Column::FileRemove, sample(0.0, 2.0, 40))],
            vec![record(Column::FileRemove, sample(0.0, 0.1, 0))],
            vec![record(Column::FileRemove, sample(0.0, 0.1, 0))],
        ];
        let table = ResultTable::from_records(&records, Discipline::FreeRunning);
        assert_eq!(table.cells[0][0][Column::FileRemove.index()], Some(20.0));
        assert_eq!(table.cells[1][0][Column::FileRemove.index()], Some(0.0));
        assert_eq!(table.summary(Column::FileRemove).unwrap().max, 20.0);
    }

    #[test]
    fn test_tree_columns_summarised_over_iterations() {
        let records = vec![vec![
            record(Column::TreeCreate, sample(0.0, 1.0, 7)),
            record(Column::TreeCreate, sample(0.0, 0.5, 7)),
        ]];
        let table = ResultTable::from_records(&records, Discipline::FreeRunning);
        let s = table.summary(Column::TreeCreate).unwrap();
        assert_eq!(s.max, 14.0);
        assert_eq!(s.min, 7.0);
    }

    #[test]
    fn test_record_codec() {
        let mut r = IterationRecord::default();
        r.set(Column::FileRead, sample(0.25, 0.75, 12));
        r.set(Column::TreeRemove, sample(1.0, 2.0, 3));
        assert_eq!(IterationRecord::decode(&r.encode()), r);
    }

    #[test]
    fn test_reduce_records_across_ranks() {
        let tables = LocalGroup::run(3, |comm| {
            let r = comm.rank() as f64;
            let records = vec![record(Column::FileCreate, sample(r, 10.0 + r, 10))];
            Ok(reduce_records(&comm, &records, Discipline::Barrier, 0.0)?)
        })
        .unwrap();
        assert!(tables[1].is_none() && tables[2].is_none());
        let table = tables[0].as_ref().unwrap();
        assert_eq!(table.ranks, 3);
        // 30 items over 0.0..12.0
        assert_eq!(table.rows[0][Column::FileCreate.index()], Some(2.5));
    }

    #[test]
    fn test_outlier_detection() {
        let records = vec![
            vec![record(Column::FileStat, sample(0.0, 1.0, 1))],
            vec![record(Column::FileStat, sample(0.0, 1.0, 1))],
            vec![record(Column::FileStat, sample(0.0, 9.0, 1))],
        ];
        assert!(find_outliers(&records, 0, 5.0).is_empty());
        let slow = find_outliers(&records, 2, 5.0);
        assert_eq!(slow.len(), 2);
        assert!(slow.iter().any(|o| o.slot == "end time"));
        assert!(slow.iter().all(|o| o.column == Column::FileStat));
    }

    #[test]
    fn test_reduce_timers_min_even_max_odd() {
        let mut a = [0.0; TRANSFER_TIMERS];
        let mut b = [0.0; TRANSFER_TIMERS];
        for i in 0..TRANSFER_TIMERS {
            a[i] = i as f64;
            b[i] = i as f64 + if i % 2 == 0 { -0.5 } else { 0.5 };
        }
        let reduced = reduce_timers(&[a, b]);
        assert_eq!(reduced[0], -0.5);
        assert_eq!(reduced[1], 1.5);
        assert_eq!(reduced[5], 5.5);
        assert_eq!(reduced[6], 5.5);
    }
}
