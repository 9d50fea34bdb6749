//! Load balanced assignment of the global tree to ranks.
//!
//! Ranks receive contiguous ranges of leaves along the space filling curve.
//! The cut between rank `r - 1` and rank `r` is placed at the leaf boundary
//! whose particle prefix sum is closest to `total * r / R`. Every rank
//! computes the assignment from the same global counts and obtains the same
//! result.

use crate::error::{DomainError, Result};
use crate::octree::{find_leaf, num_leaves};
use crate::sfc::SfcKey;

/// Contiguous ranges of leaves and keys owned by each rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceCurveAssignment<K: SfcKey> {
    /// Leaf index boundaries, `num_ranks + 1` entries.
    leaf_offsets: Vec<usize>,
    /// Key boundaries, `num_ranks + 1` entries.
    keys: Vec<K>,
    /// Particle count of each rank.
    counts: Vec<u64>,
}

/// Split the leaves of `tree` into `num_ranks` ranges of similar particle count.
///
/// Cuts equidistant from two leaf boundaries go to the earlier boundary.
/// Every rank receives at least one leaf.
pub fn compute_assignment<K: SfcKey>(
    tree: &[K],
    counts: &[u64],
    num_ranks: usize,
) -> Result<SpaceCurveAssignment<K>> {
    let n_leaves = num_leaves(tree);
    debug_assert_eq!(counts.len(), n_leaves);
    if num_ranks == 0 || num_ranks > n_leaves {
        return Err(DomainError::AssignmentMismatch {
            ranks: num_ranks,
            leaves: n_leaves,
        });
    }

    let mut prefix = Vec::with_capacity(n_leaves + 1);
    prefix.push(0u64);
    for &count in counts {
        prefix.push(prefix[prefix.len() - 1] + count);
    }
    let total = prefix[n_leaves];

    let mut leaf_offsets = Vec::with_capacity(num_ranks + 1);
    leaf_offsets.push(0);
    for rank in 1..num_ranks {
        let target = (total as u128 * rank as u128 / num_ranks as u128) as u64;

        // First boundary at or after the target and its predecessor.
        let after = prefix.partition_point(|&value| value < target);
        let mut cut = after;
        if after > 0 && target - prefix[after - 1] <= prefix[after] - target {
            cut = after - 1;
        }

        // Leave at least one leaf for this rank and every following one.
        let previous = leaf_offsets[rank - 1];
        let cut = cut.max(previous + 1).min(n_leaves - (num_ranks - rank));
        leaf_offsets.push(cut);
    }
    leaf_offsets.push(n_leaves);

    let keys = leaf_offsets.iter().map(|&offset| tree[offset]).collect();
    let counts = leaf_offsets
        .windows(2)
        .map(|pair| prefix[pair[1]] - prefix[pair[0]])
        .collect();

    Ok(SpaceCurveAssignment {
        leaf_offsets,
        keys,
        counts,
    })
}

impl<K: SfcKey> SpaceCurveAssignment<K> {
    /// Number of ranks.
    pub fn num_ranks(&self) -> usize {
        self.counts.len()
    }

    /// First leaf index of `rank`.
    pub fn start_index(&self, rank: usize) -> usize {
        self.leaf_offsets[rank]
    }

    /// One past the last leaf index of `rank`.
    pub fn end_index(&self, rank: usize) -> usize {
        self.leaf_offsets[rank + 1]
    }

    /// Leaf index range of `rank`.
    pub fn leaf_range(&self, rank: usize) -> std::ops::Range<usize> {
        self.start_index(rank)..self.end_index(rank)
    }

    /// Number of leaves of `rank`.
    pub fn num_leaves(&self, rank: usize) -> usize {
        self.end_index(rank) - self.start_index(rank)
    }

    /// First key of `rank`.
    pub fn first_key(&self, rank: usize) -> K {
        self.keys[rank]
    }

    /// One past the last key of `rank`.
    pub fn last_key(&self, rank: usize) -> K {
        self.keys[rank + 1]
    }

    /// Key range `[first, last)` of `rank`.
    pub fn key_range(&self, rank: usize) -> (K, K) {
        (self.first_key(rank), self.last_key(rank))
    }

    /// Particles assigned to `rank`.
    pub fn num_particles(&self, rank: usize) -> u64 {
        self.counts[rank]
    }

    /// Particles over all ranks.
    pub fn total_particles(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// First key of every rank, `num_ranks` entries.
    pub fn rank_start_keys(&self) -> &[K] {
        &self.keys[..self.num_ranks()]
    }

    /// Rank owning `key`.
    pub fn find_rank(&self, key: K) -> usize {
        find_leaf(&self.keys, key).min(self.num_ranks() - 1)
    }
}
