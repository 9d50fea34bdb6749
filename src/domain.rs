//! The domain decomposition driver.
//!
//! A [Domain] owns the decomposition state of one rank: the global tree and
//! its counts, the assignment of tree leaves to ranks, the focused tree and
//! the halo plan. [Domain::sync] runs one decomposition step on a
//! [ParticleSet] and leaves it with the owned particles sorted by key,
//! followed by the halo particles.
//!
//! All ranks must call [Domain::sync] together. Errors detected before any
//! particle moved are agreed upon collectively: the failing rank returns its
//! own error and every other rank returns [DomainError::PeerFailure]. Errors
//! after particles started moving leave the ranks inconsistent and abort the
//! run through [Communicator::abort].

use std::marker::PhantomData;
use std::ops::Range;

use crate::assignment::{compute_assignment, SpaceCurveAssignment};
use crate::backend::{Backend, HostBackend};
use crate::comm::{Communicator, ReduceOp};
use crate::config::{DomainConfig, HaloRadius};
use crate::constants::HALO_RADIUS_SLACK;
use crate::error::{DomainError, Result};
use crate::exchange::{exchange_halos, redistribute};
use crate::focus::FocusedOctree;
use crate::geometry::DomainBox;
use crate::halos::{HaloPlan, HaloSearch};
use crate::octree::parallel::{
    compute_global_bounding_box, compute_octree_global, global_leaf_max, global_node_counts,
};
use crate::octree::{ensure_min_leaves, num_leaves, root_tree, Octree};
use crate::particles::ParticleSet;
use crate::sfc::SfcKey;
use crate::sort::sort_particles;

/// Stage of a synchronization step. Stages are passed in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncStage {
    /// No step in progress.
    #[default]
    Idle,
    /// The global bounding box is known and positions are wrapped.
    BoundsComputed,
    /// Keys are computed and the particles are sorted.
    KeysSorted,
    /// The global tree is balanced.
    TreeRebalanced,
    /// Leaves are assigned to ranks.
    Assigned,
    /// Particles live on their owning rank.
    Redistributed,
    /// The halo plan is built and checked.
    HaloDiscovered,
    /// Halo particles are in place.
    HaloExchanged,
}

/// Summary of one synchronization step.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// Owned particles on this rank.
    pub local_count: usize,
    /// Halo particles on this rank.
    pub halo_count: usize,
    /// Owned particles over all ranks.
    pub global_particles: u64,
    /// Halo particles over all ranks.
    pub global_halos: u64,
    /// Leaves of the global tree.
    pub global_leaves: usize,
    /// Leaves of the focused tree.
    pub focus_leaves: usize,
    /// Rebalance iterations of the global tree.
    pub rebalance_iterations: usize,
    /// Update iterations of the focused tree.
    pub focus_iterations: usize,
    /// Largest halo search radius of all leaves.
    pub halo_radius: f64,
}

/// Domain decomposition state of one rank.
///
/// `K` is the key type, `B` the execution backend.
pub struct Domain<K: SfcKey, B: Backend = HostBackend> {
    rank: usize,
    num_ranks: usize,
    config: DomainConfig,
    global_box: DomainBox,
    tree: Vec<K>,
    counts: Vec<u64>,
    radii: Vec<f64>,
    octree: Octree<K>,
    assignment: Option<SpaceCurveAssignment<K>>,
    focus: FocusedOctree<K>,
    halo_plan: HaloPlan,
    stage: SyncStage,
    local_count: usize,
    halo_count: usize,
    _backend: PhantomData<B>,
}

impl<K: SfcKey, B: Backend> Domain<K, B> {
    /// Create the domain of `rank` out of `num_ranks`.
    pub fn new(rank: usize, num_ranks: usize, config: DomainConfig) -> Result<Self> {
        config.validate()?;
        if config.backend != B::KIND {
            return Err(DomainError::Config(format!(
                "configured backend {:?} does not match the domain backend {:?}",
                config.backend,
                B::KIND
            )));
        }
        if rank >= num_ranks {
            return Err(DomainError::Config(format!(
                "rank {rank} out of range for {num_ranks} ranks"
            )));
        }

        let tree = root_tree();
        let octree = Octree::from_leaves(&tree);
        Ok(Self {
            rank,
            num_ranks,
            global_box: config.domain_box,
            focus: FocusedOctree::new(rank, config.focus_theta),
            config,
            tree,
            counts: vec![0],
            radii: vec![0.0],
            octree,
            assignment: None,
            halo_plan: HaloPlan::default(),
            stage: SyncStage::Idle,
            local_count: 0,
            halo_count: 0,
            _backend: PhantomData,
        })
    }

    /// Create the domain of the calling rank of `comm`.
    pub fn for_communicator<C: Communicator>(comm: &C, config: DomainConfig) -> Result<Self> {
        Self::new(comm.rank(), comm.size(), config)
    }

    /// Run one decomposition step.
    ///
    /// Halos of a previous step are dropped first. On success the first
    /// [Domain::local_count] particles of `particles` are the owned particles
    /// sorted by key and the following [Domain::halo_count] particles are
    /// copies of particles owned by other ranks.
    pub fn sync<C: Communicator>(
        &mut self,
        comm: &C,
        particles: &mut ParticleSet<K>,
    ) -> Result<SyncReport> {
        let span = tracing::info_span!("sync", rank = self.rank);
        let _enter = span.enter();

        let result = self.run_stages(comm, particles);
        self.stage = SyncStage::Idle;
        match result {
            Ok(report) => {
                tracing::info!(
                    local = report.local_count,
                    halos = report.halo_count,
                    leaves = report.global_leaves,
                    "synchronization finished"
                );
                Ok(report)
            }
            Err(error) => {
                if error.is_fatal() {
                    tracing::error!(%error, "fatal error during synchronization");
                    comm.abort(error.abort_code());
                } else {
                    tracing::warn!(%error, "synchronization rejected");
                }
                Err(error)
            }
        }
    }

    fn run_stages<C: Communicator>(
        &mut self,
        comm: &C,
        particles: &mut ParticleSet<K>,
    ) -> Result<SyncReport> {
        let curve = self.config.curve;

        particles.truncate(particles.num_owned());
        let local = self.validate_local(comm, particles);
        self.agree_on_status(comm, local, particles)?;

        // Bounds and wrapping.
        let global_box = compute_global_bounding_box::<C, B>(
            [particles.x(), particles.y(), particles.z()],
            &self.global_box,
            comm,
        )?;
        for index in 0..particles.len() {
            let [x, y, z] = global_box.normalize(particles.position(index))?;
            particles.x_mut()[index] = x;
            particles.y_mut()[index] = y;
            particles.z_mut()[index] = z;
        }
        self.stage = SyncStage::BoundsComputed;

        // Keys.
        {
            let (keys, [x, y, z]) = particles.keys_mut_and_coordinates();
            let computed = B::map_indices(keys.len(), |index| {
                global_box.encode::<K>(curve, [x[index], y[index], z[index]])
            });
            keys.copy_from_slice(&computed);
        }
        sort_particles::<K, B>(particles)?;
        self.stage = SyncStage::KeysSorted;
        tracing::debug!(particles = particles.len(), "keys computed and sorted");

        // Global tree, refined further if there are fewer leaves than ranks.
        let (tree, counts, rebalance_iterations) = compute_octree_global::<K, B, C>(
            particles.keys(),
            self.config.bucket_size,
            self.tree.clone(),
            self.config.max_rebalance_iterations,
            comm,
        )?;
        let refined = ensure_min_leaves::<K, B>(&tree, self.num_ranks);
        let (tree, counts) = if refined.len() != tree.len() {
            let counts = global_node_counts::<K, B, C>(&refined, particles.keys(), comm)?;
            (refined, counts)
        } else {
            (tree, counts)
        };
        let octree = Octree::from_leaves(&tree);
        self.stage = SyncStage::TreeRebalanced;

        let assignment = compute_assignment(&tree, &counts, self.num_ranks)?;
        self.stage = SyncStage::Assigned;
        tracing::debug!(
            leaves = assignment.num_leaves(self.rank),
            particles = assignment.num_particles(self.rank),
            "leaves assigned"
        );

        let local_count = redistribute::<K, B, C>(particles, &assignment, comm)?;
        self.stage = SyncStage::Redistributed;

        let radii = self.compute_leaf_radii(comm, &tree, particles)?;
        let search = HaloSearch::new(&octree, &radii, &global_box, curve);
        let halo_radius = search.max_radius();
        let focus_iterations = self
            .focus
            .update::<B>(&tree, &counts, &assignment, &global_box, curve, halo_radius)?;
        let plan = HaloPlan::build::<K, B>(
            self.rank,
            &self.focus,
            &search,
            &tree,
            &assignment,
            particles.keys(),
        );
        plan.check_counts(comm)?;
        self.stage = SyncStage::HaloDiscovered;

        exchange_halos(particles, &plan, comm)?;
        self.stage = SyncStage::HaloExchanged;

        let halo_count = plan.halo_count();
        let mut totals = [local_count as u64, halo_count as u64];
        comm.all_reduce_u64(&mut totals, ReduceOp::Sum)?;

        let report = SyncReport {
            local_count,
            halo_count,
            global_particles: totals[0],
            global_halos: totals[1],
            global_leaves: num_leaves(&tree),
            focus_leaves: self.focus.num_leaves(),
            rebalance_iterations,
            focus_iterations,
            halo_radius,
        };

        self.global_box = global_box;
        self.tree = tree;
        self.counts = counts;
        self.radii = radii;
        self.octree = octree;
        self.assignment = Some(assignment);
        self.halo_plan = plan;
        self.local_count = local_count;
        self.halo_count = halo_count;
        Ok(report)
    }

    /// Checks that need no communication.
    fn validate_local<C: Communicator>(&self, comm: &C, particles: &ParticleSet<K>) -> Result<()> {
        if comm.size() != self.num_ranks || comm.rank() != self.rank {
            return Err(DomainError::Config(format!(
                "domain of rank {} out of {} used with rank {} out of {}",
                self.rank,
                self.num_ranks,
                comm.rank(),
                comm.size()
            )));
        }
        particles.check_lengths()?;
        for index in 0..particles.len() {
            let h = particles.h()[index];
            if !(h.is_finite() && h >= 0.0) {
                tracing::warn!(particle = index, h, "invalid smoothing length");
                return Err(DomainError::InvalidParticle {
                    index,
                    field: "h",
                    value: h,
                });
            }
            let position = particles.position(index);
            for (field, value) in ["x", "y", "z"].into_iter().zip(position) {
                if !value.is_finite() {
                    tracing::warn!(particle = index, field, value, "non-finite coordinate");
                    return Err(DomainError::InvalidParticle { index, field, value });
                }
            }
            if let Err(error) = self.global_box.normalize(position) {
                tracing::warn!(particle = index, %error, "invalid particle position");
                return Err(error);
            }
        }
        Ok(())
    }

    /// Combine the local validation results of all ranks.
    ///
    /// Also checks that all ranks run the same backend and hold particles
    /// with the same property layout.
    fn agree_on_status<C: Communicator>(
        &self,
        comm: &C,
        local: Result<()>,
        particles: &ParticleSet<K>,
    ) -> Result<()> {
        let failed = if local.is_err() { self.rank as u64 + 1 } else { 0 };
        let row_bytes = particles.row_bytes() as u64;
        let layout = particles.layout_fingerprint();
        let mut max = [failed, row_bytes, B::KIND.id(), layout];
        comm.all_reduce_u64(&mut max, ReduceOp::Max)?;
        let mut min = [row_bytes, B::KIND.id(), layout];
        comm.all_reduce_u64(&mut min, ReduceOp::Min)?;

        local?;
        if max[0] != 0 {
            return Err(DomainError::PeerFailure {
                rank: (max[0] - 1) as usize,
            });
        }
        if min[0] != max[1] {
            return Err(DomainError::PropertyMismatch {
                min: min[0],
                max: max[1],
            });
        }
        if min[1] != max[2] {
            return Err(DomainError::Config("ranks run different backends".to_string()));
        }
        if min[2] != max[3] {
            return Err(DomainError::LayoutMismatch);
        }
        Ok(())
    }

    /// Halo search radius of every leaf of `tree`, slightly enlarged.
    ///
    /// Per particle radii take the largest smoothing length in each leaf over
    /// all ranks, so every rank holds the same radii.
    fn compute_leaf_radii<C: Communicator>(
        &self,
        comm: &C,
        tree: &[K],
        particles: &ParticleSet<K>,
    ) -> Result<Vec<f64>> {
        let slack = 1.0 + HALO_RADIUS_SLACK;
        match self.config.halo_radius {
            HaloRadius::Fixed(radius) => Ok(vec![radius * slack; num_leaves(tree)]),
            HaloRadius::PerParticle { .. } => {
                let owned = particles.num_owned();
                let keys = &particles.keys()[..owned];
                let max_h = global_leaf_max::<K, B, C>(tree, keys, &particles.h()[..owned], comm)?;
                Ok(max_h
                    .into_iter()
                    .map(|h| self.config.halo_radius.radius(h) * slack)
                    .collect())
            }
        }
    }

    /// Rank of this domain.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks.
    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    /// The configuration.
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    /// Owned particles after the last step.
    pub fn local_count(&self) -> usize {
        self.local_count
    }

    /// Halo particles after the last step.
    pub fn halo_count(&self) -> usize {
        self.halo_count
    }

    /// Index range of the owned particles.
    pub fn owned_range(&self) -> Range<usize> {
        0..self.local_count
    }

    /// Index range of the halo particles.
    pub fn halo_range(&self) -> Range<usize> {
        self.local_count..self.local_count + self.halo_count
    }

    /// Assignment of the last step, `None` before the first step.
    pub fn assignment(&self) -> Option<&SpaceCurveAssignment<K>> {
        self.assignment.as_ref()
    }

    /// Cornerstone array of the global tree.
    pub fn global_tree(&self) -> &[K] {
        &self.tree
    }

    /// Global particle count of every leaf of the global tree.
    pub fn global_counts(&self) -> &[u64] {
        &self.counts
    }

    /// Halo search radius of every leaf of the global tree.
    pub fn leaf_radii(&self) -> &[f64] {
        &self.radii
    }

    /// Node table of the global tree.
    pub fn octree(&self) -> &Octree<K> {
        &self.octree
    }

    /// The focused tree of this rank.
    pub fn focus_tree(&self) -> &FocusedOctree<K> {
        &self.focus
    }

    /// The halo plan of the last step.
    pub fn halo_plan(&self) -> &HaloPlan {
        &self.halo_plan
    }

    /// The global box of the last step.
    pub fn global_box(&self) -> &DomainBox {
        &self.global_box
    }

    /// Current stage. [SyncStage::Idle] outside of [Domain::sync].
    pub fn stage(&self) -> SyncStage {
        self.stage
    }
}

#[cfg(test)]
mod test {
    use super::{Domain, SyncStage};
    use crate::backend::{BackendKind, HostBackend, ThreadPoolBackend};
    use crate::comm::local::LocalCluster;
    use crate::comm::Communicator;
    use crate::config::{DomainConfig, HaloRadius};
    use crate::error::DomainError;
    use crate::geometry::{BoundaryKind, DomainBox};
    use crate::particles::ParticleSet;
    use crate::tools::{generate_random_points, seeded_rng};

    #[test]
    fn test_backend_must_match_config() {
        let config = DomainConfig::default();
        assert!(Domain::<u64, HostBackend>::new(0, 1, config.clone()).is_ok());
        assert!(matches!(
            Domain::<u64, ThreadPoolBackend>::new(0, 1, config.clone()),
            Err(DomainError::Config(_))
        ));
        assert!(matches!(
            Domain::<u64, HostBackend>::new(2, 2, config),
            Err(DomainError::Config(_))
        ));
    }

    #[test]
    fn test_single_rank_has_no_halos() {
        let domain_box = DomainBox::cube(0.0, 1.0, BoundaryKind::Periodic).unwrap();
        let mut config = DomainConfig::new(domain_box);
        config.bucket_size = 8;
        config.halo_radius = HaloRadius::Fixed(0.2);

        let results = LocalCluster::run(1, |comm| {
            let mut rng = seeded_rng(3);
            let [x, y, z] = generate_random_points(200, &domain_box, &mut rng);
            let mut particles = ParticleSet::<u64>::new(x, y, z, vec![0.05; 200]).unwrap();

            let mut domain = Domain::<u64>::for_communicator(&comm, config.clone()).unwrap();
            let report = domain.sync(&comm, &mut particles).unwrap();
            assert_eq!(domain.stage(), SyncStage::Idle);
            assert_eq!(domain.halo_range(), 200..200);
            assert_eq!(domain.leaf_radii().len(), domain.global_counts().len());
            assert!(domain.leaf_radii().iter().all(|&radius| radius >= 0.2));
            (report, particles.len())
        });

        let (report, len) = &results[0];
        assert_eq!(report.local_count, 200);
        assert_eq!(report.halo_count, 0);
        assert_eq!(report.global_particles, 200);
        assert_eq!(*len, 200);
        assert!(report.global_leaves >= 200 / 8);
    }

    #[test]
    fn test_thread_pool_domain() {
        let config = DomainConfig {
            backend: BackendKind::ThreadPool,
            bucket_size: 4,
            ..DomainConfig::default()
        };

        let results = LocalCluster::run(2, |comm| {
            let mut rng = seeded_rng(10 + comm.rank());
            let domain_box = DomainBox::default();
            let [x, y, z] = generate_random_points(50, &domain_box, &mut rng);
            let mut particles = ParticleSet::<u32>::new(x, y, z, vec![0.01; 50]).unwrap();

            let mut domain =
                Domain::<u32, ThreadPoolBackend>::for_communicator(&comm, config.clone()).unwrap();
            domain.sync(&comm, &mut particles).unwrap()
        });

        assert_eq!(results[0].global_particles, 100);
        assert_eq!(results[0].local_count + results[1].local_count, 100);
    }
}
