//! Focused octrees.
//!
//! A focused octree is a cornerstone tree that matches the global tree
//! inside the focus region of a rank (its own key range plus everything
//! within the halo radius of it) and becomes coarser with distance
//! elsewhere, controlled by an opening angle. It is updated incrementally
//! from the previous step's focus tree by per leaf operations until a fixed
//! point is reached.

use std::ops::Range;

use crate::assignment::SpaceCurveAssignment;
use crate::backend::Backend;
use crate::error::{DomainError, Result};
use crate::geometry::{CellBounds, DomainBox};
use crate::octree::{
    find_leaf, is_cornerstone, leaf_level, lower_bound, num_leaves, rebalance_tree, root_tree,
    sibling_and_level, Octree,
};
use crate::sfc::{node_range, span_sfc_range, CurveKind, SfcKey};

/// Physical boxes of the cells covering the key range `[first, last)`.
pub fn region_bounds<K: SfcKey>(
    domain_box: &DomainBox,
    curve: CurveKind,
    first: K,
    last: K,
) -> Vec<CellBounds> {
    span_sfc_range(first, last)
        .into_iter()
        .map(|(key, level)| domain_box.cell_bounds::<K>(&curve.cell(key, level)))
        .collect()
}

/// Resolution of a focus leaf compared to the global tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Relation {
    /// The leaf contains several global leaves.
    Coarser,
    /// The leaf is a global leaf.
    Matching,
    /// The leaf lies inside a larger global leaf.
    Finer,
}

fn relation<K: SfcKey>(global_tree: &[K], key: K, level: u32) -> Relation {
    let global_level = leaf_level(global_tree, find_leaf(global_tree, key));
    match global_level.cmp(&level) {
        std::cmp::Ordering::Greater => Relation::Coarser,
        std::cmp::Ordering::Equal => Relation::Matching,
        std::cmp::Ordering::Less => Relation::Finer,
    }
}

/// Distance criteria deciding where the focus tree must be resolved.
pub struct FocusCriteria<'a> {
    /// Domain of the particles.
    pub domain_box: &'a DomainBox,
    /// Curve of the keys.
    pub curve: CurveKind,
    /// Cells covering the own key range.
    pub region: &'a [CellBounds],
    /// Halo search radius.
    pub radius: f64,
    /// Opening angle.
    pub theta: f64,
}

impl FocusCriteria<'_> {
    /// Whether the node `(key, level)` has to be resolved down to the global leaves.
    ///
    /// This holds within the halo radius of the own region and wherever the
    /// node appears under a larger angle than `theta`. A node that does not
    /// need resolution has no descendant that does.
    pub fn needs_resolution<K: SfcKey>(&self, key: K, level: u32) -> bool {
        let bounds = self.domain_box.cell_bounds::<K>(&self.curve.cell(key, level));
        let distance = self.domain_box.min_distance_to_region(&bounds, self.region);
        distance <= self.radius || distance * self.theta <= bounds.edge_length()
    }
}

/// Operation for focus leaf `index`, with the codes of [crate::octree::leaf_operation].
fn focus_operation<K: SfcKey>(
    leaves: &[K],
    index: usize,
    global_tree: &[K],
    criteria: &FocusCriteria<'_>,
) -> usize {
    let key = leaves[index];
    let (sibling, level) = sibling_and_level(leaves, index);

    match relation(global_tree, key, level) {
        // Too fine leaves are merged as soon as the sibling group is complete.
        Relation::Finer => match sibling {
            Some(position) if position > 0 => 0,
            _ => 1,
        },
        Relation::Coarser if criteria.needs_resolution(key, level) => 8,
        _ => match sibling {
            Some(position) => {
                let parent_key = key - K::from_raw(position as u64) * node_range::<K>(level);
                if !criteria.needs_resolution(parent_key, level - 1) && position > 0 {
                    0
                } else {
                    1
                }
            }
            None => 1,
        },
    }
}

/// Locally essential octree of one rank.
#[derive(Debug, Clone)]
pub struct FocusedOctree<K: SfcKey> {
    rank: usize,
    theta: f64,
    leaves: Vec<K>,
    counts: Vec<u64>,
    octree: Octree<K>,
    own_range: (K, K),
}

impl<K: SfcKey> FocusedOctree<K> {
    /// Create a focus tree consisting of the root only.
    pub fn new(rank: usize, theta: f64) -> Self {
        let leaves = root_tree();
        let octree = Octree::from_leaves(&leaves);
        Self {
            rank,
            theta,
            leaves,
            counts: vec![0],
            octree,
            own_range: (K::zero(), K::zero()),
        }
    }

    /// Update the focus tree to the current global tree and assignment.
    ///
    /// Returns the number of iterations until the leaf operations converged.
    pub fn update<B: Backend>(
        &mut self,
        global_tree: &[K],
        global_counts: &[u64],
        assignment: &SpaceCurveAssignment<K>,
        domain_box: &DomainBox,
        curve: CurveKind,
        radius: f64,
    ) -> Result<usize> {
        let (first, last) = assignment.key_range(self.rank);
        let region = region_bounds(domain_box, curve, first, last);
        let criteria = FocusCriteria {
            domain_box,
            curve,
            region: &region,
            radius,
            theta: self.theta,
        };

        let max_iterations = 4 * K::MAX_LEVEL as usize + 8;
        let mut leaves = std::mem::take(&mut self.leaves);
        let mut iterations = 0;
        loop {
            let ops = B::map_indices(num_leaves(&leaves), |index| {
                focus_operation(&leaves, index, global_tree, &criteria)
            });
            if ops.iter().all(|&op| op == 1) {
                break;
            }
            if iterations == max_iterations {
                self.leaves = leaves;
                return Err(DomainError::FocusDiverged(iterations));
            }
            leaves = rebalance_tree::<K, B>(&leaves, &ops);
            debug_assert!(is_cornerstone(&leaves));
            iterations += 1;
        }

        // Focus leaves are unions of global leaves, their counts follow from prefix sums.
        let mut prefix = Vec::with_capacity(global_counts.len() + 1);
        prefix.push(0u64);
        for &count in global_counts {
            prefix.push(prefix[prefix.len() - 1] + count);
        }
        self.counts = B::map_indices(num_leaves(&leaves), |index| {
            let start = lower_bound(global_tree, leaves[index]);
            let end = lower_bound(global_tree, leaves[index + 1]);
            prefix[end] - prefix[start]
        });

        self.octree = Octree::from_leaves(&leaves);
        self.leaves = leaves;
        self.own_range = (first, last);

        tracing::debug!(
            rank = self.rank,
            leaves = self.num_leaves(),
            iterations,
            "focused tree updated"
        );
        Ok(iterations)
    }

    /// Rank the tree is focused on.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Opening angle.
    pub fn theta(&self) -> f64 {
        self.theta
    }

    /// The cornerstone array of the focus tree.
    pub fn leaves(&self) -> &[K] {
        &self.leaves
    }

    /// Global particle count of every focus leaf.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Number of leaves.
    pub fn num_leaves(&self) -> usize {
        num_leaves(&self.leaves)
    }

    /// Linked node table of the focus tree.
    pub fn octree(&self) -> &Octree<K> {
        &self.octree
    }

    /// Key range owned by the rank.
    pub fn own_key_range(&self) -> (K, K) {
        self.own_range
    }

    /// Indices of the focus leaves inside the own key range.
    pub fn own_leaf_range(&self) -> Range<usize> {
        lower_bound(&self.leaves, self.own_range.0)..lower_bound(&self.leaves, self.own_range.1)
    }
}
