//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;

use cornerstone_domain::tools::point_distance;
use cornerstone_domain::{
    Backend, Communicator, Domain, DomainBox, DomainConfig, LocalCluster, ParticleSet, SyncReport,
};

/// Input particles of one rank.
pub struct RankInput {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub h: Vec<f64>,
    pub ids: Vec<u64>,
}

impl RankInput {
    pub fn from_points(points: &[[f64; 3]], first_id: u64, h: f64) -> Self {
        Self {
            x: points.iter().map(|p| p[0]).collect(),
            y: points.iter().map(|p| p[1]).collect(),
            z: points.iter().map(|p| p[2]).collect(),
            h: vec![h; points.len()],
            ids: (first_id..first_id + points.len() as u64).collect(),
        }
    }

    pub fn particle_set(&self) -> ParticleSet<u64> {
        let mass = self.ids.iter().map(|&id| 2.0 * id as f64).collect::<Vec<_>>();
        ParticleSet::new(self.x.clone(), self.y.clone(), self.z.clone(), self.h.clone())
            .unwrap()
            .with_property("id", self.ids.clone())
            .unwrap()
            .with_property("mass", mass)
            .unwrap()
    }
}

/// State of one rank after a synchronization.
pub struct RankOutput {
    pub report: SyncReport,
    pub keys: Vec<u64>,
    pub ids: Vec<u64>,
    pub positions: Vec<[f64; 3]>,
    pub h: Vec<f64>,
    pub mass: Vec<f64>,
    pub global_box: DomainBox,
    pub first_key: u64,
    pub last_key: u64,
}

impl RankOutput {
    pub fn owned_ids(&self) -> &[u64] {
        &self.ids[..self.report.local_count]
    }

    pub fn halo_ids(&self) -> &[u64] {
        &self.ids[self.report.local_count..]
    }
}

fn collect<B: Backend>(
    domain: &Domain<u64, B>,
    particles: &ParticleSet<u64>,
    report: SyncReport,
) -> RankOutput {
    let assignment = domain.assignment().unwrap();
    let (first_key, last_key) = assignment.key_range(domain.rank());
    RankOutput {
        report,
        keys: particles.keys().to_vec(),
        ids: particles.property::<u64>("id").unwrap().to_vec(),
        positions: (0..particles.len()).map(|index| particles.position(index)).collect(),
        h: particles.h().to_vec(),
        mass: particles.property::<f64>("mass").unwrap().to_vec(),
        global_box: *domain.global_box(),
        first_key,
        last_key,
    }
}

/// Run `steps` synchronizations on a cluster, one input per rank and step.
pub fn run_steps<B: Backend>(config: &DomainConfig, inputs: &[Vec<RankInput>]) -> Vec<RankOutput> {
    let num_ranks = inputs[0].len();
    LocalCluster::run(num_ranks, |comm| {
        let rank = comm.rank();
        let mut domain = Domain::<u64, B>::for_communicator(&comm, config.clone()).unwrap();
        let mut output = None;
        for step in inputs {
            let mut particles = step[rank].particle_set();
            let report = domain.sync(&comm, &mut particles).unwrap();
            output = Some(collect(&domain, &particles, report));
        }
        output.unwrap()
    })
}

/// Run a single synchronization on a cluster.
pub fn run_once<B: Backend>(config: &DomainConfig, inputs: Vec<RankInput>) -> Vec<RankOutput> {
    run_steps::<B>(config, &[inputs])
}

/// Every particle appears exactly once as an owned particle, on the rank owning its key.
pub fn assert_conservation(outputs: &[RankOutput], total: usize) {
    let mut seen = HashSet::new();
    for output in outputs {
        let local = output.report.local_count;
        assert!(output.keys[..local].windows(2).all(|pair| pair[0] <= pair[1]));
        for (&key, &id) in output.keys[..local].iter().zip(output.owned_ids()) {
            assert!(output.first_key <= key && key < output.last_key);
            assert!(seen.insert(id), "particle {id} owned twice");
        }
        for (&id, &mass) in output.ids.iter().zip(&output.mass) {
            assert_eq!(mass, 2.0 * id as f64);
        }
    }
    assert_eq!(seen.len(), total);
    for output in outputs {
        assert_eq!(output.report.global_particles, total as u64);
    }
}

/// Compare the halos of every rank against a brute force neighbour search.
///
/// Every particle owned by another rank within `radius` of an owned particle
/// must be a halo. Halos are never owned particles of the same rank.
pub fn assert_halos_complete(outputs: &[RankOutput], radius: f64) {
    assert_halos_complete_with(outputs, |_, _| radius);
}

/// Like [assert_halos_complete], with the interaction radius of two particles
/// given by `pair_radius` of their smoothing lengths.
pub fn assert_halos_complete_with(outputs: &[RankOutput], pair_radius: impl Fn(f64, f64) -> f64) {
    let owned = outputs
        .iter()
        .flat_map(|output| {
            let local = output.report.local_count;
            (0..local)
                .map(|index| (output.ids[index], output.positions[index], output.h[index]))
        })
        .collect::<Vec<_>>();

    for output in outputs {
        let local = output.report.local_count;
        let own_ids = output.owned_ids().iter().copied().collect::<HashSet<_>>();
        let halo_ids = output.halo_ids().iter().copied().collect::<HashSet<_>>();
        assert_eq!(halo_ids.len(), output.report.halo_count, "duplicate halos");
        assert!(halo_ids.is_disjoint(&own_ids));

        for &(id, position, h) in owned.iter().filter(|(id, _, _)| !own_ids.contains(id)) {
            let needed = output.positions[..local]
                .iter()
                .zip(&output.h[..local])
                .any(|(&p, &own_h)| {
                    point_distance(&output.global_box, p, position) <= pair_radius(own_h, h)
                });
            if needed {
                assert!(halo_ids.contains(&id), "particle {id} missing from halos");
            }
        }
    }
}
