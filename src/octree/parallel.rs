//! Distributed construction of the global octree.
//!
//! Every rank holds the same cornerstone array. Each rank counts its own
//! sorted keys per leaf, the counts are summed over all ranks, and every rank
//! evaluates the same rebalance operations on the same global counts. The
//! trees therefore stay identical without ever being communicated.

use super::{
    check_unsplittable, compute_node_counts, lower_bound, num_leaves, rebalance_decision,
    rebalance_tree,
};
use crate::backend::Backend;
use crate::comm::{Communicator, ReduceOp};
use crate::error::{ImbalanceError, Result};
use crate::geometry::{BoundaryKind, DomainBox};
use crate::sfc::SfcKey;

/// Compute the global bounding box across all particles on all processes.
///
/// Only open axes are updated. An open axis without any particle keeps its
/// previous bounds, an open axis where all particles share one coordinate
/// is widened so that it keeps a positive length.
pub fn compute_global_bounding_box<C: Communicator, B: Backend>(
    coords: [&[f64]; 3],
    domain_box: &DomainBox,
    comm: &C,
) -> Result<DomainBox> {
    // Reduce the negated minima together with the maxima in one call.
    let mut extrema = [f64::MIN; 6];
    for (axis, values) in coords.iter().enumerate() {
        if let Some((lo, hi)) = B::min_max(values) {
            extrema[axis] = -lo;
            extrema[3 + axis] = hi;
        }
    }
    comm.all_reduce_f64(&mut extrema, ReduceOp::Max)?;

    let mut result = *domain_box;
    for axis in 0..3 {
        if domain_box.boundaries()[axis] != BoundaryKind::Open {
            continue;
        }
        let (lo, hi) = (-extrema[axis], extrema[3 + axis]);
        if lo > hi {
            // No particles anywhere.
            continue;
        }

        let hi = if hi > lo {
            hi
        } else {
            lo + f64::max(lo.abs(), 1.0) * 1e-9
        };
        result = result.with_bounds(axis, lo, hi)?;
    }

    tracing::debug!(global_box = %result, "computed global bounding box");
    Ok(result)
}

/// Leaf counts of the sorted local `keys`, summed over all ranks.
pub fn global_node_counts<K: SfcKey, B: Backend, C: Communicator>(
    tree: &[K],
    keys: &[K],
    comm: &C,
) -> Result<Vec<u64>> {
    let mut counts = compute_node_counts::<K, B>(tree, keys);
    comm.all_reduce_u64(&mut counts, ReduceOp::Sum)?;
    Ok(counts)
}

/// Largest entry of `values` in every leaf of `tree`, over all ranks.
///
/// `values[i]` belongs to the particle with the sorted key `keys[i]`. Leaves
/// without particles on any rank get zero.
pub fn global_leaf_max<K: SfcKey, B: Backend, C: Communicator>(
    tree: &[K],
    keys: &[K],
    values: &[f64],
    comm: &C,
) -> Result<Vec<f64>> {
    debug_assert_eq!(keys.len(), values.len());
    let mut maxima = B::map_indices(num_leaves(tree), |leaf| {
        let start = lower_bound(keys, tree[leaf]);
        let end = lower_bound(keys, tree[leaf + 1]);
        values[start..end].iter().fold(0.0, |acc: f64, &value| acc.max(value))
    });
    comm.all_reduce_f64(&mut maxima, ReduceOp::Max)?;
    Ok(maxima)
}

/// One distributed rebalance step. Returns true if the tree was already converged.
pub fn update_octree_global<K: SfcKey, B: Backend, C: Communicator>(
    keys: &[K],
    bucket_size: usize,
    tree: &mut Vec<K>,
    counts: &mut Vec<u64>,
    comm: &C,
) -> Result<bool> {
    let (ops, converged) = rebalance_decision::<K, B>(tree, counts, bucket_size);
    if !converged {
        *tree = rebalance_tree::<K, B>(tree, &ops);
        *counts = global_node_counts::<K, B, C>(tree, keys, comm)?;
    }
    Ok(converged)
}

/// Rebalance the global tree, starting from `tree`.
///
/// Returns the converged tree, its global leaf counts and the number of
/// iterations. All ranks take the same decisions, so either all succeed or
/// all fail with the same error.
pub fn compute_octree_global<K: SfcKey, B: Backend, C: Communicator>(
    keys: &[K],
    bucket_size: usize,
    tree: Vec<K>,
    max_iterations: usize,
    comm: &C,
) -> Result<(Vec<K>, Vec<u64>, usize)> {
    let mut tree = tree;
    let mut counts = global_node_counts::<K, B, C>(&tree, keys, comm)?;

    for iteration in 0..max_iterations {
        if update_octree_global::<K, B, C>(keys, bucket_size, &mut tree, &mut counts, comm)? {
            check_unsplittable(&tree, &counts, bucket_size)?;
            tracing::debug!(
                iterations = iteration,
                leaves = counts.len(),
                "global tree converged"
            );
            return Ok((tree, counts, iteration));
        }
    }

    Err(ImbalanceError::NotConverged {
        iterations: max_iterations,
    }
    .into())
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::{compute_global_bounding_box, compute_octree_global, global_leaf_max};
    use crate::backend::HostBackend;
    use crate::comm::local::LocalCluster;
    use crate::comm::Communicator;
    use crate::geometry::{BoundaryKind, DomainBox};
    use crate::octree::{compute_octree, is_cornerstone, root_tree, uniform_tree};
    use crate::tools::{generate_random_keys, seeded_rng};

    #[test]
    fn test_distributed_tree_matches_serial_tree() {
        let mut rng = seeded_rng(8);
        let mut all_keys = generate_random_keys::<u64, _>(6000, &mut rng);
        all_keys.extend((0..1000).map(|_| rng.gen_range(0..1u64 << 45)));

        let (serial_tree, serial_counts) = {
            let mut sorted = all_keys.clone();
            sorted.sort();
            compute_octree::<_, HostBackend>(&sorted, 40, 64).unwrap()
        };

        let results = LocalCluster::run(3, |comm| {
            let mut keys = all_keys
                .iter()
                .skip(comm.rank())
                .step_by(3)
                .copied()
                .collect::<Vec<_>>();
            keys.sort();
            compute_octree_global::<_, HostBackend, _>(&keys, 40, root_tree(), 64, &comm).unwrap()
        });

        for (tree, counts, _) in results {
            assert!(is_cornerstone(&tree));
            assert_eq!(tree, serial_tree);
            assert_eq!(counts, serial_counts);
        }
    }

    #[test]
    fn test_global_bounding_box() {
        let domain_box = DomainBox::new(
            [0.0; 3],
            [1.0; 3],
            [BoundaryKind::Open, BoundaryKind::Periodic, BoundaryKind::Open],
        )
        .unwrap();

        let results = LocalCluster::run(2, |comm| {
            let x = if comm.rank() == 0 { vec![-3.0, 0.5] } else { vec![2.0] };
            let y = vec![0.5; x.len()];
            // Every particle shares the same z coordinate.
            let z = vec![4.0; x.len()];
            compute_global_bounding_box::<_, HostBackend>([&x, &y, &z], &domain_box, &comm).unwrap()
        });

        for result in results {
            assert_eq!(result.lo()[0], -3.0);
            assert_eq!(result.hi()[0], 2.0);
            assert_eq!(result.lo()[1], 0.0);
            assert_eq!(result.hi()[1], 1.0);
            assert_eq!(result.lo()[2], 4.0);
            assert!(result.hi()[2] > 4.0);
        }
    }

    #[test]
    fn test_global_leaf_max() {
        let tree = uniform_tree::<u32>(1);
        let results = LocalCluster::run(2, |comm| {
            // Rank 0 holds particles in leaves 0 and 2, rank 1 in leaves 2 and 5.
            let (keys, values) = if comm.rank() == 0 {
                (vec![tree[0], tree[0] + 3, tree[2]], vec![0.5, 0.25, 1.0])
            } else {
                (vec![tree[2] + 1, tree[5]], vec![2.0, 0.125])
            };
            global_leaf_max::<_, HostBackend, _>(&tree, &keys, &values, &comm).unwrap()
        });

        for maxima in results {
            assert_eq!(maxima, vec![0.5, 0.0, 2.0, 0.0, 0.0, 0.125, 0.0, 0.0]);
        }
    }
}
