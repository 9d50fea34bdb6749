//! Halo discovery.
//!
//! Halos are found on the level of tree leaves. Every leaf of the global
//! tree carries a search radius. Leaf `b` of one rank is a halo of another
//! rank if some leaf `a` of that rank lies within `max(r_a, r_b)` of it. The
//! receiving rank evaluates this for the leaves of its focused tree, the
//! sending rank for its own global leaves. Both evaluate the same cell
//! distances with the same radii, so the leaves a rank expects from a peer
//! are exactly the leaves the peer decides to send.

use std::ops::Range;

use crate::assignment::SpaceCurveAssignment;
use crate::backend::Backend;
use crate::comm::{exchange_counts, Communicator};
use crate::error::{DomainError, Result};
use crate::focus::{region_bounds, FocusedOctree};
use crate::geometry::{CellBounds, DomainBox};
use crate::octree::{lower_bound, Octree};
use crate::sfc::{CurveKind, SfcKey};
use crate::tools::displacements;

/// Ranges of local particle indices sent to one peer.
///
/// Adjacent ranges are merged as they are added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendList {
    ranges: Vec<Range<usize>>,
}

impl SendList {
    /// Add a range. Ranges must be added in increasing order.
    pub fn push(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        match self.ranges.last_mut() {
            Some(last) if last.end == range.start => last.end = range.end,
            _ => {
                debug_assert!(self.ranges.last().map_or(true, |last| last.end < range.start));
                self.ranges.push(range)
            }
        }
    }

    /// The index ranges.
    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// Number of particles in the list.
    pub fn count(&self) -> usize {
        self.ranges.iter().map(|range| range.len()).sum()
    }

    /// Whether the list sends nothing.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Whether the key range `[start, end)` lies inside `[first, last)`.
fn contained<K: SfcKey>((start, end): (K, K), (first, last): (K, K)) -> bool {
    first <= start && end <= last
}

/// Whether the key ranges `[start, end)` and `[first, last)` overlap.
fn overlaps<K: SfcKey>((start, end): (K, K), (first, last): (K, K)) -> bool {
    start < last && first < end
}

/// Search radii of the global leaves.
///
/// Holds the global octree together with the radius of every leaf and the
/// largest radius below every node.
pub struct HaloSearch<'a, K: SfcKey> {
    octree: &'a Octree<K>,
    domain_box: &'a DomainBox,
    curve: CurveKind,
    radii: &'a [f64],
    node_radii: Vec<f64>,
}

impl<'a, K: SfcKey> HaloSearch<'a, K> {
    /// Attach one radius per leaf of `octree`.
    pub fn new(
        octree: &'a Octree<K>,
        radii: &'a [f64],
        domain_box: &'a DomainBox,
        curve: CurveKind,
    ) -> Self {
        debug_assert_eq!(radii.len(), octree.num_leaf_nodes());
        let node_radii = octree.upsweep(radii, f64::max);
        Self {
            octree,
            domain_box,
            curve,
            radii,
            node_radii,
        }
    }

    /// Largest radius of all leaves.
    pub fn max_radius(&self) -> f64 {
        self.node_radii[self.octree.root()]
    }

    /// Radius of global leaf `leaf`.
    pub fn radius(&self, leaf: usize) -> f64 {
        self.radii[leaf]
    }

    /// The global octree.
    pub fn octree(&self) -> &Octree<K> {
        self.octree
    }

    /// Global leaf index of the cell `(key, level)`, if it is a global leaf.
    pub fn global_leaf(&self, key: K, level: u32) -> Option<usize> {
        self.octree
            .locate(key, level)
            .and_then(|node| self.octree.leaf_index(node))
    }

    fn bounds(&self, octree: &Octree<K>, node: usize) -> CellBounds {
        self.domain_box
            .cell_bounds::<K>(&self.curve.cell(octree.key(node), octree.level(node)))
    }

    /// Whether global leaf `leaf` lies within `max(r_leaf, r_a)` of a leaf `a` inside `target`.
    ///
    /// `target` must start and end on leaf boundaries.
    pub fn leaf_reaches(&self, leaf: usize, target: (K, K)) -> bool {
        let octree = self.octree;
        let bounds = self.bounds(octree, octree.leaf_node(leaf));
        let own_radius = self.radii[leaf];

        let mut stack = vec![octree.root()];
        while let Some(node) = stack.pop() {
            if !overlaps(octree.key_range(node), target) {
                continue;
            }
            let distance = self.domain_box.min_distance(&bounds, &self.bounds(octree, node));
            if distance > own_radius.max(self.node_radii[node]) {
                continue;
            }
            if octree.is_leaf(node) {
                return true;
            }
            stack.extend(octree.children(node));
        }
        false
    }
}

/// Focus leaves outside the own key range that are halos of the own range.
///
/// Returns focus leaf indices in key order.
pub fn find_halo_leaves<K: SfcKey>(
    focus: &FocusedOctree<K>,
    search: &HaloSearch<'_, K>,
) -> Vec<usize> {
    let own = focus.own_key_range();
    let region = region_bounds(search.domain_box, search.curve, own.0, own.1);
    let max_radius = search.max_radius();
    let octree = focus.octree();

    let mut leaves = Vec::new();
    let mut stack = vec![octree.root()];
    while let Some(node) = stack.pop() {
        if contained(octree.key_range(node), own) {
            continue;
        }
        let bounds = search.bounds(octree, node);
        if search.domain_box.min_distance_to_region(&bounds, &region) > max_radius {
            continue;
        }
        match octree.leaf_index(node) {
            Some(leaf) => {
                // Focus leaves this close to the own range are global leaves.
                let global = search.global_leaf(octree.key(node), octree.level(node));
                debug_assert!(global.is_some());
                if global.is_some_and(|global| search.leaf_reaches(global, own)) {
                    leaves.push(leaf);
                }
            }
            // Reversed so that leaves are popped in key order.
            None => stack.extend(octree.children(node).rev()),
        }
    }
    leaves
}

/// Own global leaves that are halos of the key range of a peer.
///
/// Returns global leaf indices in key order.
pub fn find_send_leaves<K: SfcKey>(
    search: &HaloSearch<'_, K>,
    own: (K, K),
    peer: (K, K),
) -> Vec<usize> {
    let region = region_bounds(search.domain_box, search.curve, peer.0, peer.1);
    let max_radius = search.max_radius();
    let octree = search.octree;

    let mut leaves = Vec::new();
    let mut stack = vec![octree.root()];
    while let Some(node) = stack.pop() {
        if !overlaps(octree.key_range(node), own) {
            continue;
        }
        let bounds = search.bounds(octree, node);
        if search.domain_box.min_distance_to_region(&bounds, &region) > max_radius {
            continue;
        }
        match octree.leaf_index(node) {
            Some(leaf) => {
                if search.leaf_reaches(leaf, peer) {
                    leaves.push(leaf);
                }
            }
            None => stack.extend(octree.children(node).rev()),
        }
    }
    leaves
}

/// Send and receive pattern of one halo exchange.
#[derive(Debug, Clone, Default)]
pub struct HaloPlan {
    /// Focus leaves received as halos.
    halo_leaves: Vec<usize>,
    /// Particle ranges sent to each rank.
    send_lists: Vec<SendList>,
    /// Particles received from each rank.
    recv_counts: Vec<usize>,
    /// Position of the particles received from each rank in the particle arrays.
    recv_offsets: Vec<usize>,
    local_count: usize,
}

impl HaloPlan {
    /// Discover the halos of `rank`.
    ///
    /// `local_keys` are the sorted keys of the owned particles after
    /// redistribution, which all lie inside the key range of `rank`.
    pub fn build<K: SfcKey, B: Backend>(
        rank: usize,
        focus: &FocusedOctree<K>,
        search: &HaloSearch<'_, K>,
        global_tree: &[K],
        assignment: &SpaceCurveAssignment<K>,
        local_keys: &[K],
    ) -> Self {
        let num_ranks = assignment.num_ranks();

        let halo_leaves = find_halo_leaves(focus, search);
        let mut recv_counts = vec![0; num_ranks];
        for &leaf in &halo_leaves {
            let owner = assignment.find_rank(focus.leaves()[leaf]);
            debug_assert_ne!(owner, rank);
            recv_counts[owner] += focus.counts()[leaf] as usize;
        }
        let recv_offsets = displacements(&recv_counts)
            .into_iter()
            .map(|offset| offset + local_keys.len())
            .collect();

        let own = assignment.key_range(rank);
        let send_lists = B::map_indices(num_ranks, |peer| {
            let mut list = SendList::default();
            if peer == rank {
                return list;
            }
            for leaf in find_send_leaves(search, own, assignment.key_range(peer)) {
                let start = lower_bound(local_keys, global_tree[leaf]);
                let end = lower_bound(local_keys, global_tree[leaf + 1]);
                list.push(start..end);
            }
            list
        });

        tracing::debug!(
            rank,
            halo_leaves = halo_leaves.len(),
            halos = recv_counts.iter().sum::<usize>(),
            "halo discovery finished"
        );

        Self {
            halo_leaves,
            send_lists,
            recv_counts,
            recv_offsets,
            local_count: local_keys.len(),
        }
    }

    /// Compare the announced send counts of every peer with the expected receive counts.
    pub fn check_counts<C: Communicator>(&self, comm: &C) -> Result<()> {
        let counts = self
            .send_lists
            .iter()
            .map(|list| list.count() as u64)
            .collect::<Vec<_>>();
        let announced = exchange_counts(comm, &counts)?;

        for (peer, (&received, &expected)) in announced.iter().zip(&self.recv_counts).enumerate() {
            if peer != comm.rank() && received != expected as u64 {
                return Err(DomainError::HaloMismatch {
                    peer,
                    expected: expected as u64,
                    received,
                });
            }
        }
        Ok(())
    }

    /// Focus leaf indices of the halos.
    pub fn halo_leaves(&self) -> &[usize] {
        &self.halo_leaves
    }

    /// Ranges sent to `peer`.
    pub fn send_list(&self, peer: usize) -> &SendList {
        &self.send_lists[peer]
    }

    /// Particles received from `peer`.
    pub fn recv_count(&self, peer: usize) -> usize {
        self.recv_counts[peer]
    }

    /// Array position of the first particle received from `peer`.
    pub fn recv_offset(&self, peer: usize) -> usize {
        self.recv_offsets[peer]
    }

    /// Number of ranks the plan covers.
    pub fn num_ranks(&self) -> usize {
        self.recv_counts.len()
    }

    /// Owned particles.
    pub fn local_count(&self) -> usize {
        self.local_count
    }

    /// Halo particles over all peers.
    pub fn halo_count(&self) -> usize {
        self.recv_counts.iter().sum()
    }

    /// Particles sent over all peers.
    pub fn send_count(&self) -> usize {
        self.send_lists.iter().map(SendList::count).sum()
    }
}

#[cfg(test)]
mod test {
    use super::{find_halo_leaves, find_send_leaves, HaloPlan, HaloSearch, SendList};
    use crate::assignment::compute_assignment;
    use crate::backend::HostBackend;
    use crate::focus::FocusedOctree;
    use crate::geometry::{BoundaryKind, DomainBox};
    use crate::octree::{num_leaves, uniform_tree, Octree};
    use crate::sfc::CurveKind;

    #[test]
    fn test_send_list_merges_adjacent_ranges() {
        let mut list = SendList::default();
        list.push(0..3);
        list.push(3..5);
        list.push(5..5);
        list.push(7..9);

        assert_eq!(list.ranges(), &[0..5, 7..9]);
        assert_eq!(list.count(), 7);
        assert!(SendList::default().is_empty());
    }

    #[test]
    fn test_send_and_receive_leaves_agree() {
        for boundary in [BoundaryKind::Open, BoundaryKind::Periodic] {
            let domain_box = DomainBox::cube(0.0, 1.0, boundary).unwrap();
            let global_tree = uniform_tree::<u64>(2);
            let global_counts = vec![1; num_leaves(&global_tree)];
            let assignment = compute_assignment(&global_tree, &global_counts, 3).unwrap();
            let octree = Octree::from_leaves(&global_tree);
            // A few leaves search much further than the rest.
            let radii = (0..num_leaves(&global_tree))
                .map(|leaf| if leaf % 7 == 0 { 0.3 } else { 0.05 })
                .collect::<Vec<_>>();
            let search = HaloSearch::new(&octree, &radii, &domain_box, CurveKind::Hilbert);
            assert_eq!(search.max_radius(), 0.3);

            for receiver in 0..3 {
                let mut focus = FocusedOctree::<u64>::new(receiver, 0.5);
                focus
                    .update::<HostBackend>(
                        &global_tree,
                        &global_counts,
                        &assignment,
                        &domain_box,
                        CurveKind::Hilbert,
                        search.max_radius(),
                    )
                    .unwrap();

                let received = find_halo_leaves(&focus, &search)
                    .into_iter()
                    .map(|leaf| focus.leaves()[leaf])
                    .collect::<Vec<_>>();

                let mut sent = Vec::new();
                for sender in (0..3).filter(|&sender| sender != receiver) {
                    let own = assignment.key_range(sender);
                    let peer = assignment.key_range(receiver);
                    sent.extend(
                        find_send_leaves(&search, own, peer)
                            .into_iter()
                            .map(|leaf| global_tree[leaf]),
                    );
                }
                sent.sort();

                assert!(!received.is_empty());
                assert_eq!(received, sent);
            }
        }
    }

    #[test]
    fn test_leaf_radii_are_used_in_both_directions() {
        let domain_box = DomainBox::cube(0.0, 1.0, BoundaryKind::Open).unwrap();
        let global_tree = uniform_tree::<u32>(2);
        let octree = Octree::from_leaves(&global_tree);

        // On the Morton curve leaf 0 is the cell [0, 0.25)^3 and leaf 32 the
        // cell [0.5, 0.75) x [0, 0.25)^2, 0.25 apart.
        let first = (global_tree[0], global_tree[1]);
        let second = (global_tree[32], global_tree[33]);
        let far = |leaf: usize| {
            let mut radii = vec![0.0; num_leaves(&global_tree)];
            radii[leaf] = 0.25;
            radii
        };

        for radii in [far(0), far(32)] {
            let search = HaloSearch::new(&octree, &radii, &domain_box, CurveKind::Morton);
            assert_eq!(search.max_radius(), 0.25);
            assert!(search.leaf_reaches(32, first));
            assert!(search.leaf_reaches(0, second));
        }

        let radii = vec![0.2; num_leaves(&global_tree)];
        let search = HaloSearch::new(&octree, &radii, &domain_box, CurveKind::Morton);
        assert!(!search.leaf_reaches(32, first));
        assert!(!search.leaf_reaches(0, second));
        // The neighbour of leaf 32 across x = 0.5 touches it.
        assert!(search.leaf_reaches(32, (global_tree[4], global_tree[5])));

        assert_eq!(search.global_leaf(global_tree[32], 2), Some(32));
        assert_eq!(search.global_leaf(global_tree[32], 1), None);
    }

    #[test]
    fn test_plan_counts() {
        let domain_box = DomainBox::cube(0.0, 1.0, BoundaryKind::Open).unwrap();
        let global_tree = uniform_tree::<u32>(1);
        let global_counts = vec![2; 8];
        let assignment = compute_assignment(&global_tree, &global_counts, 2).unwrap();
        let octree = Octree::from_leaves(&global_tree);
        let radii = vec![0.1; 8];
        let search = HaloSearch::new(&octree, &radii, &domain_box, CurveKind::Morton);

        // Two particles at the start of each of the four own leaves.
        let local_keys = (0..4)
            .flat_map(|leaf| [global_tree[leaf], global_tree[leaf] + 1])
            .collect::<Vec<_>>();

        let mut focus = FocusedOctree::<u32>::new(0, 0.5);
        focus
            .update::<HostBackend>(
                &global_tree,
                &global_counts,
                &assignment,
                &domain_box,
                CurveKind::Morton,
                0.1,
            )
            .unwrap();

        let plan = HaloPlan::build::<u32, HostBackend>(
            0,
            &focus,
            &search,
            &global_tree,
            &assignment,
            &local_keys,
        );

        // Every octant touches the plane x = 0.5, all four remote leaves are halos.
        assert_eq!(plan.halo_leaves().len(), 4);
        assert_eq!(plan.recv_count(1), 8);
        assert_eq!(plan.recv_offset(1), 8);
        assert_eq!(plan.send_list(1).ranges(), &[0..8]);
        assert!(plan.send_list(0).is_empty());
        assert_eq!(plan.halo_count(), 8);
        assert_eq!(plan.send_count(), 8);
    }
}
