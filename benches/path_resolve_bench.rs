// benches/path_resolve_bench.rs
// Run with: cargo bench --bench path_resolve_bench -- <args>
//
// Times the pure namespace math: item index -> path, and tree enumeration.
// Nothing touches the file system.
use anyhow::Result;
use clap::Parser;
use std::hint::black_box;
use std::time::Instant;

use pfs_bench::namespace::{ItemKind, Namespace, Sharing, TreeBuilder, TreeShape};

#[derive(Parser, Debug)]
#[command(name = "path_resolve_bench")]
struct Args {
    #[arg(long, default_value_t = 10)]
    branch_factor: u64,

    #[arg(long, default_value_t = 4)]
    depth: u32,

    #[arg(long, default_value_t = 16)]
    items_per_dir: u64,

    #[arg(long, default_value_t = 8)]
    tasks: usize,

    #[arg(long)]
    leaf_only: bool,

    #[arg(long)]
    unique_dir_per_task: bool,

    /// Number of passes over the whole namespace
    #[arg(long, default_value_t = 3)]
    passes: usize,

    // cargo bench passes --bench through to the binary
    #[arg(long, hide = true)]
    bench: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let shape = TreeShape::new(args.branch_factor, args.depth)?;
    let sharing = if args.unique_dir_per_task {
        Sharing::UniqueDirPerTask
    } else {
        Sharing::SharedTree
    };
    let ns = Namespace::new(
        "/bench/test-dir.0",
        shape,
        args.items_per_dir,
        args.leaf_only,
        sharing,
        args.tasks,
    )?;

    println!(
        "cfg: branch_factor={} depth={} dirs={} items/dir={} tasks={} sharing={:?}",
        args.branch_factor,
        args.depth,
        shape.num_dirs(),
        args.items_per_dir,
        args.tasks,
        sharing
    );

    let mut resolved = 0u64;
    let t0 = Instant::now();
    for pass in 0..args.passes {
        let pass_start = Instant::now();
        for task in 0..args.tasks {
            for index in ns.task_range(task) {
                black_box(ns.path_for(index, ItemKind::File, task));
                resolved += 1;
            }
        }
        println!("pass {} time: {:.3}s", pass + 1, pass_start.elapsed().as_secs_f64());
    }
    let dt = t0.elapsed().as_secs_f64();

    let t1 = Instant::now();
    let builder = TreeBuilder::new(shape, ns.tree_base(0));
    let mut dirs = 0usize;
    for _ in 0..args.passes {
        for dir in builder.all() {
            black_box(dir.path(ns.test_dir()));
            dirs += 1;
        }
    }
    let tree_dt = t1.elapsed().as_secs_f64();

    println!("\n=== path_resolve_bench results ===");
    println!(
        "path_for: {} paths in {:.3}s -> {:.0} paths/s ({:.1} ns/path)",
        resolved,
        dt,
        resolved as f64 / dt,
        dt * 1e9 / resolved.max(1) as f64
    );
    println!(
        "tree enumeration: {} dirs in {:.3}s -> {:.0} dirs/s",
        dirs,
        tree_dt,
        dirs as f64 / tree_dt
    );
    Ok(())
}
