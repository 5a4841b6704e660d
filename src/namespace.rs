// src/namespace.rs
//! Synthetic namespace: deterministic item index <-> path mapping.
//!
//! Directories form a heap-numbered `b`-ary tree of depth `d`. The root is
//! id 0 and the children of directory `k` are `b*k + 1 ..= b*k + b`; each
//! directory is named `<base>.<id>` and nested under its ancestors. Items
//! are numbered so that directory `k` holds `[k*ipd, (k+1)*ipd)`.
//!
//! Nothing here touches the file system. Any rank can compute any other
//! rank's paths, which is what lets the stat/read/remove phases deliberately
//! work on a neighbour's items.

use crate::constants::{ITEM_NAME_STEM, SHARED_ITEM_TAG, TREE_BASE_NAME};
use crate::error::BenchError;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Number of directories in a `b`-ary tree of depth `d`, root included.
///
/// Geometric series `(b^(d+1) - 1) / (b - 1)`, which degenerates to `d + 1`
/// for `b == 1`. Saturates instead of overflowing; [`TreeShape::new`]
/// rejects shapes that would saturate.
pub fn num_dirs_in_tree(branch_factor: u64, depth: u32) -> u64 {
    if depth == 0 || branch_factor == 0 {
        return 1;
    }
    if branch_factor == 1 {
        return u64::from(depth) + 1;
    }
    let top = branch_factor.saturating_pow(depth + 1);
    (top - 1) / (branch_factor - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeShape {
    pub branch_factor: u64,
    pub depth: u32,
}

impl TreeShape {
    pub fn new(branch_factor: u64, depth: u32) -> Result<Self, BenchError> {
        if branch_factor < 1 && depth > 0 {
            return Err(BenchError::Namespace(
                "branch factor must be at least 1 when depth > 0".to_string(),
            ));
        }
        if depth > 0 && branch_factor.checked_pow(depth + 1).is_none() {
            return Err(BenchError::Namespace(format!(
                "tree with branch factor {} and depth {} is too large",
                branch_factor, depth
            )));
        }
        Ok(Self {
            branch_factor,
            depth,
        })
    }

    pub fn num_dirs(&self) -> u64 {
        num_dirs_in_tree(self.branch_factor, self.depth)
    }

    /// Directories on the deepest level
    pub fn num_leaves(&self) -> u64 {
        if self.depth == 0 {
            1
        } else {
            self.branch_factor.saturating_pow(self.depth)
        }
    }

    /// Id of the first leaf; leaves occupy `[first_leaf, num_dirs)`
    pub fn first_leaf(&self) -> u64 {
        self.num_dirs() - self.num_leaves()
    }

    pub fn parent(&self, dir_id: u64) -> Option<u64> {
        (dir_id > 0).then(|| (dir_id - 1) / self.branch_factor)
    }

    /// Level of a directory, root = 0
    pub fn level(&self, dir_id: u64) -> u32 {
        let mut level = 0;
        let mut id = dir_id;
        while let Some(parent) = self.parent(id) {
            id = parent;
            level += 1;
        }
        level
    }

    pub fn children(&self, dir_id: u64) -> Range<u64> {
        if self.level(dir_id) >= self.depth {
            return 0..0;
        }
        let first = self.branch_factor * dir_id + 1;
        first..first + self.branch_factor
    }
}

/// Directory or file items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Dir,
    File,
}

impl ItemKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ItemKind::Dir => "dir",
            ItemKind::File => "file",
        }
    }
}

/// How tasks share the namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sharing {
    /// One tree; its item range is split into contiguous per-task blocks
    #[default]
    SharedTree,
    /// One tree per task, each holding the full item range
    UniqueDirPerTask,
    /// One tree; every task addresses the same item names
    SharedFile,
}

/// Phase roles used for neighbour offsetting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Create,
    Stat,
    Read,
    Remove,
}

impl Role {
    pub fn offset(&self) -> usize {
        match self {
            Role::Create => 0,
            Role::Stat => 1,
            Role::Read => 2,
            Role::Remove => 3,
        }
    }
}

/// Which task's items a rank works on in each role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRoles {
    pub rank: usize,
    pub stride: usize,
    pub tasks: usize,
}

impl TaskRoles {
    pub fn new(rank: usize, stride: usize, tasks: usize) -> Self {
        Self {
            rank,
            stride,
            tasks: tasks.max(1),
        }
    }

    /// `(rank + role_offset * stride) mod tasks`
    pub fn task_for(&self, role: Role) -> usize {
        (self.rank + role.offset() * self.stride) % self.tasks
    }
}

/// Resolve the per-directory item count from either knob.
///
/// `items` counts every item in one tree; it is rounded down to a multiple
/// of the directories that hold items (leaves only in leaf-only mode).
pub fn resolve_items_per_dir(
    shape: &TreeShape,
    leaf_only: bool,
    items: u64,
    items_per_dir: u64,
) -> Result<u64, BenchError> {
    if items > 0 && items_per_dir > 0 {
        return Err(BenchError::Config(
            "only specify the number of items or the number of items per directory".to_string(),
        ));
    }
    let holders = if leaf_only {
        shape.num_leaves()
    } else {
        shape.num_dirs()
    };
    let per_dir = if items_per_dir > 0 {
        items_per_dir
    } else {
        items / holders.max(1)
    };
    if per_dir == 0 {
        return Err(BenchError::Namespace(format!(
            "item count resolves to zero ({} items over {} directories)",
            items, holders
        )));
    }
    Ok(per_dir)
}

/// Immutable namespace for one iteration of one task group
#[derive(Debug, Clone)]
pub struct Namespace {
    test_dir: PathBuf,
    shape: TreeShape,
    items_per_dir: u64,
    leaf_only: bool,
    sharing: Sharing,
    tasks: usize,
}

impl Namespace {
    pub fn new(
        test_dir: impl Into<PathBuf>,
        shape: TreeShape,
        items_per_dir: u64,
        leaf_only: bool,
        sharing: Sharing,
        tasks: usize,
    ) -> Result<Self, BenchError> {
        let ns = Self {
            test_dir: test_dir.into(),
            shape,
            items_per_dir,
            leaf_only,
            sharing,
            tasks: tasks.max(1),
        };
        let holders = if leaf_only {
            shape.num_leaves()
        } else {
            shape.num_dirs()
        };
        if items_per_dir.checked_mul(holders).filter(|n| *n > 0).is_none() {
            return Err(BenchError::Namespace(format!(
                "{} items per directory over {} directories is not a usable item count",
                items_per_dir, holders
            )));
        }
        Ok(ns)
    }

    pub fn test_dir(&self) -> &Path {
        &self.test_dir
    }

    pub fn shape(&self) -> &TreeShape {
        &self.shape
    }

    pub fn sharing(&self) -> Sharing {
        self.sharing
    }

    pub fn tasks(&self) -> usize {
        self.tasks
    }

    pub fn items_per_dir(&self) -> u64 {
        self.items_per_dir
    }

    /// Items in one tree
    pub fn total_items(&self) -> u64 {
        if self.leaf_only {
            self.items_per_dir * self.shape.num_leaves()
        } else {
            self.items_per_dir * self.shape.num_dirs()
        }
    }

    /// Local index -> global item number (skips non-leaf directories)
    pub fn global_index(&self, index: u64) -> u64 {
        if self.leaf_only {
            index + self.items_per_dir * self.shape.first_leaf()
        } else {
            index
        }
    }

    /// Number of trees this namespace materialises
    pub fn num_trees(&self) -> usize {
        match self.sharing {
            Sharing::UniqueDirPerTask => self.tasks,
            Sharing::SharedTree | Sharing::SharedFile => 1,
        }
    }

    /// Range of local indices that belong to `task`
    pub fn task_range(&self, task: usize) -> Range<u64> {
        let total = self.total_items();
        match self.sharing {
            Sharing::UniqueDirPerTask | Sharing::SharedFile => 0..total,
            Sharing::SharedTree => {
                let tasks = self.tasks as u64;
                let task = task as u64 % tasks;
                let base = total / tasks;
                let extra = total % tasks;
                let start = task * base + task.min(extra);
                let len = base + u64::from(task < extra);
                start..start + len
            }
        }
    }

    /// Base name of the tree holding `task`'s items
    pub fn tree_base(&self, task: usize) -> String {
        match self.sharing {
            Sharing::UniqueDirPerTask => format!("{}.{}", TREE_BASE_NAME, task),
            Sharing::SharedTree | Sharing::SharedFile => TREE_BASE_NAME.to_string(),
        }
    }

    /// Task whose tree is used for `tree` in `0..num_trees()`
    pub fn tree_task(&self, tree: usize) -> usize {
        match self.sharing {
            Sharing::UniqueDirPerTask => tree,
            Sharing::SharedTree | Sharing::SharedFile => 0,
        }
    }

    /// Index in `0..num_trees()` of the tree holding `task`'s items
    pub fn tree_of(&self, task: usize) -> usize {
        match self.sharing {
            Sharing::UniqueDirPerTask => task % self.tasks,
            Sharing::SharedTree | Sharing::SharedFile => 0,
        }
    }

    pub fn tree_root(&self, task: usize) -> PathBuf {
        self.test_dir.join(format!("{}.0", self.tree_base(task)))
    }

    pub fn item_name(&self, kind: ItemKind, task: usize, global_index: u64) -> String {
        match self.sharing {
            Sharing::SharedFile => format!(
                "{}.{}.{}.{}",
                kind.prefix(),
                ITEM_NAME_STEM,
                SHARED_ITEM_TAG,
                global_index
            ),
            _ => format!("{}.{}.{}.{}", kind.prefix(), ITEM_NAME_STEM, task, global_index),
        }
    }

    /// Path of directory `dir_id` in `task`'s tree, by walking to the root.
    pub fn dir_path(&self, task: usize, dir_id: u64) -> PathBuf {
        let base = self.tree_base(task);
        let mut segments = Vec::new();
        let mut parent = dir_id;
        if parent > 0 {
            segments.push(format!("{}.{}", base, parent));
            while parent > self.shape.branch_factor {
                parent = (parent - 1) / self.shape.branch_factor;
                segments.push(format!("{}.{}", base, parent));
            }
        }
        let mut path = self.tree_root(task);
        for segment in segments.iter().rev() {
            path.push(segment);
        }
        path
    }

    /// Path of local item `index` of `task`.
    pub fn path_for(&self, index: u64, kind: ItemKind, task: usize) -> PathBuf {
        let global = self.global_index(index);
        let dir_id = global / self.items_per_dir;
        self.dir_path(task, dir_id)
            .join(self.item_name(kind, task, global))
    }
}

/// One directory produced by the forward tree builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDir {
    pub id: u64,
    pub level: u32,
    /// Path below the test directory, root segment first
    pub segments: Vec<String>,
}

impl TreeDir {
    pub fn path(&self, test_dir: &Path) -> PathBuf {
        let mut path = test_dir.to_path_buf();
        path.extend(&self.segments);
        path
    }
}

/// Creation-time enumeration of a tree, recursive and pre-order.
///
/// Each recursion level extends its own copy of the segment list, so
/// sibling branches never see each other's segments.
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    shape: TreeShape,
    base: String,
}

impl TreeBuilder {
    pub fn new(shape: TreeShape, base: impl Into<String>) -> Self {
        Self {
            shape,
            base: base.into(),
        }
    }

    pub fn root(&self) -> TreeDir {
        TreeDir {
            id: 0,
            level: 0,
            segments: vec![format!("{}.0", self.base)],
        }
    }

    /// Pre-order listing of the subtree rooted at `top`
    pub fn subtree(&self, top: &TreeDir) -> Vec<TreeDir> {
        let mut out = Vec::new();
        self.visit(top.clone(), &mut out);
        out
    }

    /// Every directory of the tree, pre-order, so parents precede children
    pub fn all(&self) -> Vec<TreeDir> {
        self.subtree(&self.root())
    }

    fn children_of(&self, dir: &TreeDir) -> Vec<TreeDir> {
        self.shape
            .children(dir.id)
            .map(|child| {
                let mut segments = dir.segments.clone();
                segments.push(format!("{}.{}", self.base, child));
                TreeDir {
                    id: child,
                    level: dir.level + 1,
                    segments,
                }
            })
            .collect()
    }

    fn visit(&self, dir: TreeDir, out: &mut Vec<TreeDir>) {
        let children = self.children_of(&dir);
        out.push(dir);
        for child in children {
            self.visit(child, out);
        }
    }
}

/// Seeded Fisher–Yates permutation of `[0, n)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation(Vec<u64>);

impl Permutation {
    pub fn new(n: u64, seed: u64) -> Self {
        let mut order: Vec<u64> = (0..n).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
        Self(order)
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Order in which a phase visits its items
#[derive(Debug, Clone)]
pub enum AccessOrder {
    Sequential,
    Shuffled(Permutation),
}

impl AccessOrder {
    /// Shuffled when `seed` is non-zero
    pub fn for_count(count: u64, seed: u64) -> Self {
        if seed == 0 {
            AccessOrder::Sequential
        } else {
            AccessOrder::Shuffled(Permutation::new(count, seed))
        }
    }

    /// The `k`-th offset to visit
    pub fn offset(&self, k: u64) -> u64 {
        match self {
            AccessOrder::Sequential => k,
            AccessOrder::Shuffled(p) => p.as_slice().get(k as usize).copied().unwrap_or(k),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::{HashMap, HashSet};

    fn brute_force_dirs(b: u64, d: u32) -> u64 {
        fn count(b: u64, level: u32, d: u32) -> u64 {
            if level == d {
                return 1;
            }
            1 + (0..b).map(|_| count(b, level + 1, d)).sum::<u64>()
        }
        count(b, 0, d)
    }

    #[test]
    fn test_directory_count_examples() {
        assert_eq!(num_dirs_in_tree(2, 2), 7);
        assert_eq!(num_dirs_in_tree(1, 3), 4);
        assert_eq!(num_dirs_in_tree(10, 0), 1);
        assert_eq!(num_dirs_in_tree(4, 3), 85);
    }

    #[test]
    fn test_invalid_shape() {
        assert!(TreeShape::new(0, 2).is_err());
        assert!(TreeShape::new(0, 0).is_ok());
        assert!(TreeShape::new(1 << 20, 5).is_err());
    }

    #[test]
    fn test_item_in_root_level_child() {
        let shape = TreeShape::new(3, 1).unwrap();
        let ns = Namespace::new("/t", shape, 5, false, Sharing::UniqueDirPerTask, 1).unwrap();
        assert_eq!(ns.total_items(), 20);
        assert_eq!(
            ns.path_for(12, ItemKind::File, 0),
            PathBuf::from("/t/mdtest_tree.0.0/mdtest_tree.0.2/file.mdtest.0.12")
        );
        assert_eq!(
            ns.path_for(3, ItemKind::Dir, 0),
            PathBuf::from("/t/mdtest_tree.0.0/dir.mdtest.0.3")
        );
    }

    #[test]
    fn test_deep_reverse_walk() {
        let shape = TreeShape::new(2, 2).unwrap();
        let ns = Namespace::new("/t", shape, 1, false, Sharing::SharedTree, 1).unwrap();
        // directory 5 is the first child of directory 2
        assert_eq!(
            ns.dir_path(0, 5),
            PathBuf::from("/t/mdtest_tree.0/mdtest_tree.2/mdtest_tree.5")
        );
        assert_eq!(shape.parent(5), Some(2));
        assert_eq!(shape.level(5), 2);
        assert_eq!(shape.children(5), 0..0);
    }

    #[test]
    fn test_builder_pre_order() {
        let shape = TreeShape::new(2, 2).unwrap();
        let ids: Vec<u64> = TreeBuilder::new(shape, "t").all().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![0, 1, 3, 4, 2, 5, 6]);

        let builder = TreeBuilder::new(shape, "t");
        let second = builder.subtree(&builder.all()[4]);
        assert_eq!(second.iter().map(|d| d.id).collect::<Vec<_>>(), vec![2, 5, 6]);
        assert_eq!(second[2].segments, vec!["t.0", "t.2", "t.6"]);
    }

    #[test]
    fn test_leaf_only_offsets() {
        let shape = TreeShape::new(2, 2).unwrap();
        let ns = Namespace::new("/t", shape, 10, true, Sharing::SharedTree, 1).unwrap();
        assert_eq!(ns.total_items(), 40);
        // local 0 is the first item of the first leaf (directory 3)
        assert_eq!(ns.global_index(0), 30);
        assert_eq!(
            ns.path_for(0, ItemKind::File, 0),
            PathBuf::from("/t/mdtest_tree.0/mdtest_tree.1/mdtest_tree.3/file.mdtest.0.30")
        );
    }

    #[test]
    fn test_shared_tree_partition() {
        let shape = TreeShape::new(1, 3).unwrap();
        let ns = Namespace::new("/t", shape, 10, false, Sharing::SharedTree, 3).unwrap();
        let ranges: Vec<_> = (0..3).map(|t| ns.task_range(t)).collect();
        assert_eq!(ranges, vec![0..14, 14..27, 27..40]);

        let unique = Namespace::new("/t", shape, 10, false, Sharing::UniqueDirPerTask, 3).unwrap();
        assert_eq!(unique.task_range(2), 0..40);
        assert_eq!(unique.num_trees(), 3);
        assert_eq!(unique.tree_of(2), 2);
        assert_eq!(unique.tree_task(unique.tree_of(1)), 1);
        assert_eq!(ns.tree_of(2), 0);
    }

    #[test]
    fn test_shared_file_names() {
        let shape = TreeShape::new(1, 0).unwrap();
        let ns = Namespace::new("/t", shape, 4, false, Sharing::SharedFile, 2).unwrap();
        assert_eq!(
            ns.path_for(1, ItemKind::File, 1),
            PathBuf::from("/t/mdtest_tree.0/file.mdtest.shared.1")
        );
    }

    #[test]
    fn test_task_roles() {
        let roles = TaskRoles::new(1, 1, 4);
        assert_eq!(roles.task_for(Role::Create), 1);
        assert_eq!(roles.task_for(Role::Stat), 2);
        assert_eq!(roles.task_for(Role::Read), 3);
        assert_eq!(roles.task_for(Role::Remove), 0);
        let no_stride = TaskRoles::new(3, 0, 4);
        assert_eq!(no_stride.task_for(Role::Remove), 3);
    }

    #[test]
    fn test_items_resolution() {
        let shape = TreeShape::new(2, 2).unwrap();
        assert_eq!(resolve_items_per_dir(&shape, false, 0, 5).unwrap(), 5);
        assert_eq!(resolve_items_per_dir(&shape, false, 100, 0).unwrap(), 14);
        assert_eq!(resolve_items_per_dir(&shape, true, 100, 0).unwrap(), 25);
        assert!(resolve_items_per_dir(&shape, false, 100, 5).is_err());
        assert!(resolve_items_per_dir(&shape, false, 3, 0).is_err());
    }

    #[test]
    fn test_permutation_reproducible_bijection() {
        let a = Permutation::new(10, 42);
        let b = Permutation::new(10, 42);
        assert_eq!(a, b);
        let mut sorted = a.as_slice().to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_sequential_order_is_identity() {
        let order = AccessOrder::for_count(5, 0);
        assert!(matches!(order, AccessOrder::Sequential));
        assert_eq!((0..5).map(|k| order.offset(k)).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    proptest! {
        #[test]
        fn prop_closed_form_matches_brute_force(b in 1u64..6, d in 0u32..6) {
            prop_assert_eq!(num_dirs_in_tree(b, d), brute_force_dirs(b, d));
            prop_assert_eq!(TreeBuilder::new(TreeShape::new(b, d).unwrap(), "t").all().len() as u64,
                            num_dirs_in_tree(b, d));
        }

        #[test]
        fn prop_forward_and_reverse_paths_agree(
            b in 1u64..5,
            d in 0u32..4,
            ipd in 1u64..6,
            leaf_only in any::<bool>(),
            task in 0usize..3,
        ) {
            let shape = TreeShape::new(b, d).unwrap();
            let ns = Namespace::new("/bench/test-dir.0", shape, ipd, leaf_only,
                                    Sharing::UniqueDirPerTask, 3).unwrap();
            let builder = TreeBuilder::new(shape, ns.tree_base(task));

            let mut forward = HashMap::new();
            for dir in builder.all() {
                if leaf_only && dir.level != d {
                    continue;
                }
                let dir_path = dir.path(ns.test_dir());
                for global in dir.id * ipd..(dir.id + 1) * ipd {
                    forward.insert(global, dir_path.join(ns.item_name(ItemKind::File, task, global)));
                }
            }
            prop_assert_eq!(forward.len() as u64, ns.total_items());

            let mut seen = HashSet::new();
            for index in 0..ns.total_items() {
                let reverse = ns.path_for(index, ItemKind::File, task);
                prop_assert_eq!(Some(&reverse), forward.get(&ns.global_index(index)));
                prop_assert!(seen.insert(reverse));
            }
        }

        #[test]
        fn prop_permutation_is_bijection(n in 0u64..500, seed in 1u64..u64::MAX) {
            let p = Permutation::new(n, seed);
            let distinct: HashSet<u64> = p.as_slice().iter().copied().collect();
            prop_assert_eq!(distinct.len() as u64, n);
            prop_assert!(p.as_slice().iter().all(|&i| i < n));
        }
    }
}
