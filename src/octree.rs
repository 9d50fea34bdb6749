//! Cornerstone octrees.
//!
//! An octree is stored as its sorted array of leaf boundaries, the
//! cornerstone array. For `n` leaves it holds `n + 1` keys starting with zero
//! and ending with [max_key]. The leaf `i` is the key range
//! `[tree[i], tree[i + 1])`, which is always a single aligned octree cell.
//!
//! Trees are refined by repeatedly evaluating an operation per leaf (merge,
//! keep or split) from the particle counts and rebuilding the array until
//! every leaf holds at most `bucket_size` particles and no sibling group
//! could be merged. The distributed version of the loop lives in [parallel].
//!
//! [Octree] adds the internal nodes to a cornerstone array and links them
//! by index.

pub mod parallel;

use itertools::Itertools;

use crate::backend::Backend;
use crate::constants::NSIBLINGS;
use crate::error::{ImbalanceError, Result};
use crate::sfc::{is_aligned, max_key, node_range, octal_digit, tree_level, SfcKey};

/// Marker for a node without children.
pub const NO_CHILD: usize = usize::MAX;

/// The cornerstone array of a tree consisting of the root only.
pub fn root_tree<K: SfcKey>() -> Vec<K> {
    vec![K::zero(), max_key()]
}

/// The cornerstone array of a uniform tree with all leaves on `level`.
pub fn uniform_tree<K: SfcKey>(level: u32) -> Vec<K> {
    let n = 1u64 << (3 * level);
    let range = node_range::<K>(level).as_u64();
    (0..=n).map(|i| K::from_raw(i * range)).collect()
}

/// Number of leaves of a cornerstone array.
pub fn num_leaves<K: SfcKey>(tree: &[K]) -> usize {
    tree.len().saturating_sub(1)
}

/// Level of leaf `index`.
pub fn leaf_level<K: SfcKey>(tree: &[K], index: usize) -> u32 {
    tree_level(tree[index + 1] - tree[index])
}

/// Test if an array is a valid cornerstone array.
pub fn is_cornerstone<K: SfcKey>(tree: &[K]) -> bool {
    if tree.len() < 2 || tree[0] != K::zero() || tree.last() != Some(&max_key()) {
        return false;
    }

    tree.iter().tuple_windows().all(|(&a, &b)| {
        if a >= b {
            return false;
        }
        let range = b - a;
        range.count_ones() == 1
            && range.trailing_zeros() % 3 == 0
            && is_aligned(a, tree_level(range))
    })
}

/// Index of the first key in `sorted` that is not smaller than `key`.
pub fn lower_bound<K: Ord>(sorted: &[K], key: K) -> usize {
    sorted.partition_point(|value| *value < key)
}

/// Index of the leaf containing `key`.
pub fn find_leaf<K: SfcKey>(tree: &[K], key: K) -> usize {
    debug_assert!(key < *tree.last().unwrap());
    tree.partition_point(|value| *value <= key) - 1
}

/// Count the sorted `keys` falling into each leaf.
pub fn compute_node_counts<K: SfcKey, B: Backend>(tree: &[K], keys: &[K]) -> Vec<u64> {
    B::map_indices(num_leaves(tree), |index| {
        (lower_bound(keys, tree[index + 1]) - lower_bound(keys, tree[index])) as u64
    })
}

/// Position of leaf `index` among its siblings and its level.
///
/// Returns `None` as position if the eight siblings are not all leaves.
pub(crate) fn sibling_and_level<K: SfcKey>(tree: &[K], index: usize) -> (Option<usize>, u32) {
    let level = leaf_level(tree, index);
    if level == 0 {
        return (None, 0);
    }

    let position = octal_digit(tree[index], level);
    if index < position || index - position + NSIBLINGS >= tree.len() {
        return (None, level);
    }

    let first = index - position;
    let parent_start = tree[index] - K::from_raw(position as u64) * node_range::<K>(level);
    let complete = tree[first] == parent_start
        && tree[first + NSIBLINGS] == parent_start + node_range(level - 1);

    (complete.then_some(position), level)
}

/// Operation for one leaf of a cornerstone tree.
///
/// 0 removes the leaf because its sibling group is merged into the parent,
/// 1 keeps it, and 8, 64, 512 or 4096 split it by one to four levels.
pub fn leaf_operation<K: SfcKey>(
    tree: &[K],
    counts: &[u64],
    bucket_size: u64,
    index: usize,
) -> usize {
    let (sibling, level) = sibling_and_level(tree, index);

    if let Some(position) = sibling {
        let first = index - position;
        let parent_count: u64 = counts[first..first + NSIBLINGS].iter().sum();
        if parent_count <= bucket_size {
            // The first sibling turns into the parent.
            return if position > 0 { 0 } else { 1 };
        }
    }

    let count = counts[index];
    let depth_left = K::MAX_LEVEL - level;
    if count > bucket_size * 512 && depth_left >= 4 {
        4096
    } else if count > bucket_size * 64 && depth_left >= 3 {
        512
    } else if count > bucket_size * 8 && depth_left >= 2 {
        64
    } else if count > bucket_size && depth_left >= 1 {
        8
    } else {
        1
    }
}

/// Evaluate [leaf_operation] for every leaf.
///
/// Returns the operations and whether the tree is already converged, that
/// is all operations are 1.
pub fn rebalance_decision<K: SfcKey, B: Backend>(
    tree: &[K],
    counts: &[u64],
    bucket_size: usize,
) -> (Vec<usize>, bool) {
    debug_assert_eq!(counts.len(), num_leaves(tree));
    let ops = B::map_indices(num_leaves(tree), |index| {
        leaf_operation(tree, counts, bucket_size as u64, index)
    });
    let converged = ops.iter().all(|&op| op == 1);
    (ops, converged)
}

/// Rebuild a cornerstone array according to per leaf operations.
pub fn rebalance_tree<K: SfcKey, B: Backend>(tree: &[K], ops: &[usize]) -> Vec<K> {
    debug_assert_eq!(ops.len(), num_leaves(tree));

    // Every op is the number of keys the leaf contributes to the new tree.
    let pieces = B::map_indices(ops.len(), |index| {
        let op = ops[index];
        if op == 0 {
            return Vec::new();
        }
        let start = tree[index];
        if op == 1 {
            return vec![start];
        }
        let levels = op.trailing_zeros() / 3;
        let child_range = node_range::<K>(leaf_level(tree, index) + levels);
        (0..op as u64)
            .map(|child| start + K::from_raw(child) * child_range)
            .collect()
    });

    let total = ops.iter().sum::<usize>() + 1;
    let mut new_tree = Vec::with_capacity(total);
    for piece in pieces {
        new_tree.extend(piece);
    }
    new_tree.push(max_key());
    debug_assert_eq!(new_tree.len(), total);
    new_tree
}

/// Fail if a leaf exceeds the bucket size but cannot be split any further.
pub fn check_unsplittable<K: SfcKey>(tree: &[K], counts: &[u64], bucket_size: usize) -> Result<()> {
    for (index, &count) in counts.iter().enumerate() {
        if count > bucket_size as u64 && leaf_level(tree, index) == K::MAX_LEVEL {
            return Err(ImbalanceError::Unsplittable {
                key: tree[index].as_u64(),
                count,
                bucket_size,
            }
            .into());
        }
    }
    Ok(())
}

/// One local rebalance step. Returns true if the tree was already converged.
pub fn update_octree<K: SfcKey, B: Backend>(
    keys: &[K],
    bucket_size: usize,
    tree: &mut Vec<K>,
    counts: &mut Vec<u64>,
) -> bool {
    let (ops, converged) = rebalance_decision::<K, B>(tree, counts, bucket_size);
    if !converged {
        *tree = rebalance_tree::<K, B>(tree, &ops);
        *counts = compute_node_counts::<K, B>(tree, keys);
    }
    converged
}

/// Build a balanced tree for the sorted `keys` of a single rank.
pub fn compute_octree<K: SfcKey, B: Backend>(
    keys: &[K],
    bucket_size: usize,
    max_iterations: usize,
) -> Result<(Vec<K>, Vec<u64>)> {
    let mut tree = root_tree();
    let mut counts = compute_node_counts::<K, B>(&tree, keys);

    for _ in 0..max_iterations {
        if update_octree::<K, B>(keys, bucket_size, &mut tree, &mut counts) {
            check_unsplittable(&tree, &counts, bucket_size)?;
            return Ok((tree, counts));
        }
    }

    Err(ImbalanceError::NotConverged {
        iterations: max_iterations,
    }
    .into())
}

/// Split leaves until the tree has at least `min_leaves` leaves.
///
/// The coarsest leaves are split first. Returns the tree unchanged if all
/// leaves are on the deepest level.
pub fn ensure_min_leaves<K: SfcKey, B: Backend>(tree: &[K], min_leaves: usize) -> Vec<K> {
    let mut tree = tree.to_vec();
    while num_leaves(&tree) < min_leaves {
        let coarsest = (0..num_leaves(&tree))
            .map(|index| leaf_level(&tree, index))
            .min()
            .unwrap_or(K::MAX_LEVEL);
        if coarsest == K::MAX_LEVEL {
            break;
        }
        let ops = (0..num_leaves(&tree))
            .map(|index| if leaf_level(&tree, index) == coarsest { 8 } else { 1 })
            .collect_vec();
        tree = rebalance_tree::<K, B>(&tree, &ops);
    }
    tree
}

/// An octree with all internal nodes, stored as flat arrays.
///
/// Nodes are sorted by level and, within a level, by key. The eight children
/// of a node are stored consecutively.
#[derive(Debug, Clone)]
pub struct Octree<K: SfcKey> {
    keys: Vec<K>,
    levels: Vec<u32>,
    parents: Vec<usize>,
    first_child: Vec<usize>,
    node_to_leaf: Vec<usize>,
    leaf_to_node: Vec<usize>,
    level_offsets: Vec<usize>,
}

impl<K: SfcKey> Octree<K> {
    /// Build the node table of a cornerstone array.
    pub fn from_leaves(leaves: &[K]) -> Self {
        debug_assert!(is_cornerstone(leaves));
        let n_leaves = num_leaves(leaves);

        // A leaf starting a node on a coarser level gives birth to that node.
        let mut nodes: Vec<(u32, K, usize)> = Vec::with_capacity(n_leaves + n_leaves / 7 + 1);
        for index in 0..n_leaves {
            let level = leaf_level(leaves, index);
            let key = leaves[index];
            for internal_level in 0..level {
                if is_aligned(key, internal_level) {
                    nodes.push((internal_level, key, NO_CHILD));
                }
            }
            nodes.push((level, key, index));
        }
        nodes.sort_unstable_by_key(|&(level, key, _)| (level, key));

        let n_nodes = nodes.len();
        let keys = nodes.iter().map(|node| node.1).collect_vec();
        let levels = nodes.iter().map(|node| node.0).collect_vec();
        let node_to_leaf = nodes.iter().map(|node| node.2).collect_vec();

        let mut leaf_to_node = vec![0; n_leaves];
        for (node, &leaf) in node_to_leaf.iter().enumerate() {
            if leaf != NO_CHILD {
                leaf_to_node[leaf] = node;
            }
        }

        let level_offsets = (0..=K::MAX_LEVEL + 1)
            .map(|level| levels.partition_point(|&l| l < level))
            .collect_vec();

        let mut parents = vec![NO_CHILD; n_nodes];
        let mut first_child = vec![NO_CHILD; n_nodes];
        for node in 0..n_nodes {
            if node_to_leaf[node] != NO_CHILD {
                continue;
            }
            let child_level = levels[node] as usize + 1;
            let range = level_offsets[child_level]..level_offsets[child_level + 1];
            let child = range.start + lower_bound(&keys[range.clone()], keys[node]);
            first_child[node] = child;
            for sibling in child..child + NSIBLINGS {
                parents[sibling] = node;
            }
        }

        Self {
            keys,
            levels,
            parents,
            first_child,
            node_to_leaf,
            leaf_to_node,
            level_offsets,
        }
    }

    /// Total number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.keys.len()
    }

    /// Number of leaves.
    pub fn num_leaf_nodes(&self) -> usize {
        self.leaf_to_node.len()
    }

    /// Number of internal nodes.
    pub fn num_internal_nodes(&self) -> usize {
        self.num_nodes() - self.num_leaf_nodes()
    }

    /// The root node.
    pub fn root(&self) -> usize {
        0
    }

    /// First key of a node.
    pub fn key(&self, node: usize) -> K {
        self.keys[node]
    }

    /// Level of a node.
    pub fn level(&self, node: usize) -> u32 {
        self.levels[node]
    }

    /// Key range `[first, last)` of a node.
    pub fn key_range(&self, node: usize) -> (K, K) {
        let key = self.keys[node];
        (key, key + node_range(self.levels[node]))
    }

    /// Parent of a node, `None` for the root.
    pub fn parent(&self, node: usize) -> Option<usize> {
        let parent = self.parents[node];
        (parent != NO_CHILD).then_some(parent)
    }

    /// Whether a node is a leaf.
    pub fn is_leaf(&self, node: usize) -> bool {
        self.first_child[node] == NO_CHILD
    }

    /// Child `octant` of an internal node.
    pub fn child(&self, node: usize, octant: usize) -> Option<usize> {
        let first = self.first_child[node];
        (first != NO_CHILD).then_some(first + octant)
    }

    /// Children of a node, empty for leaves.
    pub fn children(&self, node: usize) -> std::ops::Range<usize> {
        match self.first_child[node] {
            NO_CHILD => 0..0,
            first => first..first + NSIBLINGS,
        }
    }

    /// Leaf index of a node in the cornerstone array.
    pub fn leaf_index(&self, node: usize) -> Option<usize> {
        let leaf = self.node_to_leaf[node];
        (leaf != NO_CHILD).then_some(leaf)
    }

    /// Node index of leaf `leaf`.
    pub fn leaf_node(&self, leaf: usize) -> usize {
        self.leaf_to_node[leaf]
    }

    /// Index range of the nodes on `level`.
    pub fn level_range(&self, level: u32) -> std::ops::Range<usize> {
        self.level_offsets[level as usize]..self.level_offsets[level as usize + 1]
    }

    /// Find the node with first key `key` on `level`.
    pub fn locate(&self, key: K, level: u32) -> Option<usize> {
        if level > K::MAX_LEVEL {
            return None;
        }
        let range = self.level_range(level);
        let position = range.start + lower_bound(&self.keys[range.clone()], key);
        (position < range.end && self.keys[position] == key).then_some(position)
    }

    /// Combine a per leaf quantity up the tree, for example with a sum or a maximum.
    pub fn upsweep<T: Copy + Default>(
        &self,
        leaf_values: &[T],
        combine: impl Fn(T, T) -> T,
    ) -> Vec<T> {
        debug_assert_eq!(leaf_values.len(), self.num_leaf_nodes());
        let mut values = vec![T::default(); self.num_nodes()];
        for (leaf, &value) in leaf_values.iter().enumerate() {
            values[self.leaf_to_node[leaf]] = value;
        }
        // Children are always stored after their parent.
        for node in (0..self.num_nodes()).rev() {
            if let Some(first) = self.child(node, 0) {
                values[node] = values[first + 1..first + NSIBLINGS]
                    .iter()
                    .fold(values[first], |acc, &value| combine(acc, value));
            }
        }
        values
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;
    use rand::Rng;

    use super::{
        compute_node_counts, compute_octree, ensure_min_leaves, find_leaf, is_cornerstone,
        leaf_level, num_leaves, rebalance_decision, rebalance_tree, root_tree, uniform_tree,
        Octree,
    };
    use crate::backend::{HostBackend, ThreadPoolBackend};
    use crate::error::{DomainError, ImbalanceError};
    use crate::sfc::{max_key, node_range};
    use crate::tools::{generate_random_keys, seeded_rng};

    #[test]
    fn test_uniform_tree() {
        let tree = uniform_tree::<u32>(2);
        assert_eq!(num_leaves(&tree), 64);
        assert!(is_cornerstone(&tree));
        assert!(is_cornerstone(&root_tree::<u64>()));
        assert!(!is_cornerstone(&[0u32, 3, max_key()]));
        assert!(!is_cornerstone(&[0u32, 1 << 27]));
    }

    #[test]
    fn test_merge_and_split() {
        // Level one tree, all particles in the first octant.
        let tree = uniform_tree::<u32>(1);
        let counts = vec![100, 0, 0, 0, 0, 0, 0, 0];
        let (ops, converged) = rebalance_decision::<_, HostBackend>(&tree, &counts, 10);
        assert!(!converged);
        assert_eq!(ops, vec![64, 1, 1, 1, 1, 1, 1, 1]);

        let refined = rebalance_tree::<_, HostBackend>(&tree, &ops);
        assert!(is_cornerstone(&refined));
        assert_eq!(num_leaves(&refined), 64 + 7);
        assert_eq!(leaf_level(&refined, 0), 3);

        // A sparse sibling group collapses into its parent.
        let counts = vec![1; 8];
        let (ops, _) = rebalance_decision::<_, HostBackend>(&tree, &counts, 10);
        assert_eq!(ops, vec![1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(rebalance_tree::<_, HostBackend>(&tree, &ops), root_tree::<u32>());
    }

    #[test]
    fn test_compute_octree() {
        let mut rng = seeded_rng(6);
        let mut keys = generate_random_keys::<u64, _>(10_000, &mut rng);
        // A dense cluster in a corner.
        keys.extend((0..2000).map(|_| rng.gen_range(0..1u64 << 40)));
        keys.sort();

        let bucket_size = 32;
        let (tree, counts) = compute_octree::<_, HostBackend>(&keys, bucket_size, 64).unwrap();
        assert!(is_cornerstone(&tree));
        assert_eq!(counts.iter().sum::<u64>(), keys.len() as u64);
        assert!(counts.iter().all(|&count| count <= bucket_size as u64));
        assert_eq!(counts, compute_node_counts::<_, HostBackend>(&tree, &keys));

        // Converged trees have no mergeable sibling groups left.
        let (_, converged) = rebalance_decision::<_, HostBackend>(&tree, &counts, bucket_size);
        assert!(converged);

        let (pool_tree, pool_counts) =
            compute_octree::<_, ThreadPoolBackend>(&keys, bucket_size, 64).unwrap();
        assert_eq!(pool_tree, tree);
        assert_eq!(pool_counts, counts);
    }

    #[test]
    fn test_unsplittable_leaf() {
        let keys = vec![12345u32; 20];
        let result = compute_octree::<_, HostBackend>(&keys, 8, 64);
        assert!(matches!(
            result,
            Err(DomainError::Imbalance(ImbalanceError::Unsplittable { count: 20, .. }))
        ));
    }

    #[test]
    fn test_ensure_min_leaves() {
        let tree = ensure_min_leaves::<u32, HostBackend>(&root_tree(), 20);
        assert!(is_cornerstone(&tree));
        assert_eq!(num_leaves(&tree), 64);

        let tree = ensure_min_leaves::<u32, HostBackend>(&uniform_tree(1), 3);
        assert_eq!(tree, uniform_tree::<u32>(1));
    }

    #[test]
    fn test_node_table() {
        let mut rng = seeded_rng(7);
        let mut keys = generate_random_keys::<u32, _>(3000, &mut rng);
        keys.sort();
        let (tree, counts) = compute_octree::<_, HostBackend>(&keys, 16, 64).unwrap();
        let octree = Octree::from_leaves(&tree);

        assert_eq!(octree.num_leaf_nodes(), num_leaves(&tree));
        assert_eq!(octree.num_internal_nodes(), (num_leaves(&tree) - 1) / 7);
        assert_eq!(octree.key_range(octree.root()), (0, max_key()));
        assert_eq!(octree.parent(octree.root()), None);

        for leaf in 0..num_leaves(&tree) {
            let node = octree.leaf_node(leaf);
            assert!(octree.is_leaf(node));
            assert_eq!(octree.leaf_index(node), Some(leaf));
            assert_eq!(octree.key_range(node), (tree[leaf], tree[leaf + 1]));
        }

        for node in 0..octree.num_nodes() {
            for (octant, child) in octree.children(node).enumerate() {
                assert_eq!(octree.parent(child), Some(node));
                assert_eq!(octree.level(child), octree.level(node) + 1);
                assert_eq!(
                    octree.key(child),
                    octree.key(node) + octant as u32 * node_range::<u32>(octree.level(child))
                );
            }
            assert_eq!(octree.locate(octree.key(node), octree.level(node)), Some(node));
        }

        let node_counts = octree.upsweep(&counts, |a, b| a + b);
        assert_eq!(node_counts[octree.root()], keys.len() as u64);
        let first_level = octree.level_range(1).collect_vec();
        assert_eq!(first_level.len(), 8);
        assert_eq!(
            first_level.iter().map(|&node| node_counts[node]).sum::<u64>(),
            keys.len() as u64
        );

        let leaf_levels = (0..num_leaves(&tree)).map(|leaf| leaf_level(&tree, leaf)).collect_vec();
        let deepest = octree.upsweep(&leaf_levels, u32::max);
        assert_eq!(deepest[octree.root()], *leaf_levels.iter().max().unwrap());

        let key = keys[keys.len() / 2];
        let leaf = find_leaf(&tree, key);
        assert!(tree[leaf] <= key && key < tree[leaf + 1]);
    }
}
