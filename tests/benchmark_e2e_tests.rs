//! End-to-end runs over a temporary directory with several in-process ranks

use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

use pfs_bench::backend::Backend;
use pfs_bench::comm::{Communicator, LocalGroup};
use pfs_bench::config::{RunConfig, TransferConfig};
use pfs_bench::context::RunContext;
use pfs_bench::phases::{run_benchmark, test_dir_for, BenchmarkReport};
use pfs_bench::posix::PosixBackend;
use pfs_bench::stats::Column;
use pfs_bench::timebase::Timebase;
use pfs_bench::transfer::{run_transfer, TransferReport};
use pfs_bench::walker::{run_find, FindOptions, FindResults, WalkMode};

fn run_group(cfg: &RunConfig, ranks: usize) -> Result<Vec<BenchmarkReport>> {
    let mut cfg = cfg.clone();
    let backend = PosixBackend::new();
    cfg.validate(backend.capabilities())?;
    let mut per_rank = LocalGroup::run(ranks, |comm| {
        let timebase = Timebase::synchronize(&comm)?;
        let ctx = RunContext::new(&comm, &backend, &timebase);
        run_benchmark(&ctx, &cfg)
    })?;
    Ok(per_rank.swap_remove(0))
}

fn count_files(root: &Path, ranks: usize) -> Result<FindResults> {
    let opts = FindOptions {
        root: root.to_path_buf(),
        ..Default::default()
    };
    let mut results = LocalGroup::run(ranks, |comm| run_find(&comm, &opts))?;
    Ok(results.swap_remove(0))
}

fn files_only(cfg: &mut RunConfig) {
    cfg.targets.files = true;
    cfg.targets.dirs = false;
}

fn only_phases(cfg: &mut RunConfig, create: bool, stat: bool, read: bool, remove: bool) {
    cfg.phases.create = create;
    cfg.phases.stat = stat;
    cfg.phases.read = read;
    cfg.phases.remove = remove;
}

#[test]
fn test_create_then_remove_over_narrow_tree() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut cfg = RunConfig::new(temp_dir.path());
    cfg.branch_factor = 1;
    cfg.depth = 3;
    cfg.items_per_dir = 10;
    files_only(&mut cfg);

    only_phases(&mut cfg, true, false, false, false);
    let reports = run_group(&cfg, 2)?;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].total_items, 40);
    assert_eq!(reports[0].table.items[0][Column::FileCreate.index()], 40);
    assert_eq!(reports[0].table.items[0][Column::TreeCreate.index()], 4);

    let test_dir = test_dir_for(temp_dir.path(), 0);
    let found = count_files(&test_dir, 3)?;
    assert_eq!(found.scanned, 40);
    // test dir plus four tree levels
    assert_eq!(found.dirs, 5);

    only_phases(&mut cfg, false, false, false, true);
    let reports = run_group(&cfg, 2)?;
    assert_eq!(reports[0].table.items[0][Column::FileRemove.index()], 40);
    assert_eq!(reports[0].table.items[0][Column::TreeRemove.index()], 4);
    assert!(!test_dir.exists());

    let after = count_files(temp_dir.path(), 2)?;
    assert_eq!(after.scanned, 0);
    Ok(())
}

#[test]
fn test_walker_result_independent_of_rank_count() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut cfg = RunConfig::new(temp_dir.path());
    cfg.branch_factor = 3;
    cfg.depth = 2;
    cfg.items_per_dir = 7;
    cfg.write_bytes = 3900;
    files_only(&mut cfg);
    only_phases(&mut cfg, true, false, false, false);
    run_group(&cfg, 4)?;

    let test_dir = test_dir_for(temp_dir.path(), 0);
    let opts = FindOptions {
        root: test_dir.clone(),
        name_filter: Some("1".to_string()),
        expected_size: Some(3900),
        ..Default::default()
    };
    let mut seen = Vec::new();
    for ranks in [1, 3, 5] {
        let results = LocalGroup::run(ranks, |comm| run_find(&comm, &opts))?;
        // every rank agrees on the reduced counts
        assert!(results.windows(2).all(|w| w[0].found == w[1].found));
        seen.push((results[0].found, results[0].scanned, results[0].dirs));
    }
    assert!(seen.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(seen[0].1, 13 * 7);
    assert!(seen[0].0 > 0 && seen[0].0 < seen[0].1);
    Ok(())
}

#[test]
fn test_walker_delete_empties_tree() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut cfg = RunConfig::new(temp_dir.path());
    cfg.branch_factor = 2;
    cfg.depth = 2;
    cfg.items_per_dir = 5;
    files_only(&mut cfg);
    only_phases(&mut cfg, true, false, false, false);
    run_group(&cfg, 2)?;

    let opts = FindOptions {
        root: temp_dir.path().to_path_buf(),
        mode: WalkMode::Delete,
        ..Default::default()
    };
    let deleted = LocalGroup::run(4, |comm| run_find(&comm, &opts))?;
    assert_eq!(deleted[0].scanned, 35);
    assert_eq!(deleted[0].errors, 0);
    assert_eq!(count_files(temp_dir.path(), 1)?.scanned, 0);
    Ok(())
}

#[test]
fn test_stonewall_limits_create_phase() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut cfg = RunConfig::new(temp_dir.path());
    cfg.items = 40;
    files_only(&mut cfg);
    cfg.stonewall.deadline = Duration::from_nanos(1);
    only_phases(&mut cfg, true, true, false, false);

    let reports = run_group(&cfg, 2)?;
    let report = &reports[0];
    let created = report.table.items[0][Column::FileCreate.index()];
    assert!(created >= 2 && created < 40);
    // stat only touches what exists
    assert_eq!(report.table.items[0][Column::FileStat.index()], created);

    let create_wall = report
        .stonewall
        .iter()
        .find(|s| s.column == Column::FileCreate)
        .expect("create phase is stonewalled");
    assert_eq!(create_wall.ranks_hit, 2);
    assert!(create_wall.min >= 1);
    assert_eq!(count_files(temp_dir.path(), 2)?.scanned, created);
    Ok(())
}

#[test]
fn test_stonewalled_full_cycle_leaves_nothing_behind() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut cfg = RunConfig::new(temp_dir.path());
    cfg.items = 40;
    cfg.stonewall.deadline = Duration::from_nanos(1);

    let reports = run_group(&cfg, 2)?;
    let items = &reports[0].table.items[0];
    assert_eq!(items[Column::FileRemove.index()], items[Column::FileCreate.index()]);
    assert_eq!(items[Column::DirRemove.index()], items[Column::DirCreate.index()]);
    assert_eq!(std::fs::read_dir(temp_dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn test_stonewall_over_deep_shared_tree() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut cfg = RunConfig::new(temp_dir.path());
    cfg.branch_factor = 2;
    cfg.depth = 2;
    cfg.items_per_dir = 1;
    files_only(&mut cfg);
    cfg.stonewall.deadline = Duration::from_nanos(1);
    only_phases(&mut cfg, true, true, false, false);

    let reports = run_group(&cfg, 2)?;
    let items = &reports[0].table.items[0];
    // a shared tree is always finished
    assert_eq!(items[Column::TreeCreate.index()], 7);
    let created = items[Column::FileCreate.index()];
    assert!((1..=7).contains(&created));
    assert_eq!(items[Column::FileStat.index()], created);

    let found = count_files(&test_dir_for(temp_dir.path(), 0), 2)?;
    assert_eq!(found.scanned, created);
    assert_eq!(found.dirs, 8);
    Ok(())
}

#[test]
fn test_stonewalled_cycle_over_deep_tree_leaves_nothing_behind() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut cfg = RunConfig::new(temp_dir.path());
    cfg.branch_factor = 2;
    cfg.depth = 2;
    cfg.items_per_dir = 1;
    cfg.stonewall.deadline = Duration::from_nanos(1);

    let reports = run_group(&cfg, 2)?;
    let items = &reports[0].table.items[0];
    assert_eq!(items[Column::FileRemove.index()], items[Column::FileCreate.index()]);
    assert_eq!(items[Column::DirRemove.index()], items[Column::DirCreate.index()]);
    assert_eq!(items[Column::TreeRemove.index()], 7);
    assert_eq!(std::fs::read_dir(temp_dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn test_stonewall_stops_between_unique_trees() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut cfg = RunConfig::new(temp_dir.path());
    cfg.unique_dir_per_task = true;
    cfg.branch_factor = 2;
    cfg.depth = 1;
    cfg.items_per_dir = 2;
    files_only(&mut cfg);
    cfg.stonewall.deadline = Duration::from_nanos(1);
    only_phases(&mut cfg, true, true, false, false);

    let reports = run_group(&cfg, 2)?;
    let items = &reports[0].table.items[0];
    // the first tree is finished, the deadline stops the second
    assert_eq!(items[Column::TreeCreate.index()], 3);
    let test_dir = test_dir_for(temp_dir.path(), 0);
    assert!(test_dir.join("mdtest_tree.0.0").is_dir());
    assert!(!test_dir.join("mdtest_tree.1.0").exists());

    // only the task with a tree created anything
    let created = items[Column::FileCreate.index()];
    assert!((1..=6).contains(&created));
    assert_eq!(items[Column::FileStat.index()], created);
    assert_eq!(count_files(&test_dir, 2)?.scanned, created);
    Ok(())
}

#[test]
fn test_stonewalled_unique_trees_with_stride_leave_nothing_behind() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut cfg = RunConfig::new(temp_dir.path());
    cfg.unique_dir_per_task = true;
    cfg.neighbor_stride = 1;
    cfg.branch_factor = 2;
    cfg.depth = 1;
    cfg.items_per_dir = 2;
    cfg.stonewall.deadline = Duration::from_nanos(1);

    let reports = run_group(&cfg, 3)?;
    let items = &reports[0].table.items[0];
    assert_eq!(items[Column::TreeCreate.index()], 3);
    assert_eq!(items[Column::TreeRemove.index()], 3);
    assert_eq!(items[Column::FileRemove.index()], items[Column::FileCreate.index()]);
    assert_eq!(items[Column::DirRemove.index()], items[Column::DirCreate.index()]);
    assert_eq!(std::fs::read_dir(temp_dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn test_unique_dirs_with_neighbor_stride_and_verify() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut cfg = RunConfig::new(temp_dir.path());
    cfg.branch_factor = 2;
    cfg.depth = 1;
    cfg.items_per_dir = 4;
    cfg.unique_dir_per_task = true;
    cfg.neighbor_stride = 1;
    cfg.write_bytes = 8192;
    cfg.read_bytes = 8192;
    cfg.verify_read = true;
    cfg.abort_on_data_error = true;
    cfg.iterations = 2;

    let reports = run_group(&cfg, 3)?;
    let report = &reports[0];
    assert_eq!(report.table.rows.len(), 2);
    assert_eq!(report.total_items, 3 * 12);
    assert_eq!(report.data_errors, 0);
    for items in &report.table.items {
        assert_eq!(items[Column::FileRead.index()], 36);
        assert_eq!(items[Column::DirCreate.index()], 36);
        assert_eq!(items[Column::TreeCreate.index()], 9);
    }
    assert!(report.table.summary(Column::FileCreate).is_some());
    assert!(report.table.summary(Column::FileRead).is_some());
    assert_eq!(std::fs::read_dir(temp_dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn test_task_sweep_without_barriers() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut cfg = RunConfig::new(temp_dir.path());
    cfg.items = 24;
    cfg.barriers = false;
    cfg.tasks.first = Some(1);
    cfg.tasks.stride = 2;

    let reports = run_group(&cfg, 4)?;
    let tasks: Vec<usize> = reports.iter().map(|r| r.tasks).collect();
    assert_eq!(tasks, vec![1, 3]);
    for report in &reports {
        assert_eq!(report.table.cells.len(), report.tasks);
        assert_eq!(report.table.items[0][Column::FileCreate.index()], 24);
    }
    Ok(())
}

#[test]
fn test_metadata_then_transfer_in_one_group() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let mut cfg = RunConfig::new(temp_dir.path());
    cfg.items = 6;
    cfg.transfer = Some(TransferConfig {
        block_size: 64 * 1024,
        transfer_size: 16 * 1024,
        segments: 2,
        verify: true,
        reorder_offset: 1,
        ..Default::default()
    });
    let backend = PosixBackend::new();
    cfg.validate(backend.capabilities())?;

    let outputs = LocalGroup::run(2, |comm| {
        let timebase = Timebase::synchronize(&comm)?;
        let ctx = RunContext::new(&comm, &backend, &timebase);
        let reports = run_benchmark(&ctx, &cfg)?;
        let transfer: Option<TransferReport> = match &cfg.transfer {
            Some(xfer) => run_transfer(&ctx, &cfg, xfer)?,
            None => None,
        };
        Ok((comm.rank(), reports.len(), transfer))
    })?;

    let (rank, reports, transfer) = &outputs[0];
    assert_eq!(*rank, 0);
    assert_eq!(*reports, 1);
    let transfer = transfer.as_ref().expect("rank 0 holds the transfer report");
    assert_eq!(transfer.data_errors, 0);
    assert_eq!(transfer.iterations[0].write_bytes, 2 * 128 * 1024);
    assert!(transfer.write_summary().is_some());
    assert!(outputs[1].2.is_none());
    Ok(())
}
