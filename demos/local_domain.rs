//! Decompose random particles over four ranks running as threads.

use cornerstone_domain::{
    tools::{generate_random_points, seeded_rng},
    BoundaryKind, Communicator, Domain, DomainBox, DomainConfig, HaloRadius, LocalCluster, ParticleSet,
};
use tracing_subscriber::EnvFilter;

pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let domain_box = DomainBox::cube(0.0, 1.0, BoundaryKind::Periodic).unwrap();
    let config = DomainConfig {
        bucket_size: 32,
        halo_radius: HaloRadius::Fixed(0.04),
        ..DomainConfig::new(domain_box)
    };

    // Create `npoints` per rank.
    let npoints = 5000;
    let nsteps = 3;

    let reports = LocalCluster::run(4, |comm| {
        let mut rng = seeded_rng(comm.rank());
        let [x, y, z] = generate_random_points(npoints, &domain_box, &mut rng);
        let mut particles = ParticleSet::<u64>::new(x, y, z, vec![0.02; npoints]).unwrap();
        let mut domain = Domain::<u64>::for_communicator(&comm, config.clone()).unwrap();

        let mut report = None;
        for _ in 0..nsteps {
            report = Some(domain.sync(&comm, &mut particles).unwrap());

            // Move the owned particles a little, halos are dropped by the next step.
            let owned = domain.owned_range();
            for x in &mut particles.x_mut()[owned] {
                *x += 0.01;
            }
        }
        report.unwrap()
    });

    for (rank, report) in reports.iter().enumerate() {
        println!(
            "rank {rank}: {} owned, {} halos, {} focus leaves",
            report.local_count, report.halo_count, report.focus_leaves
        );
    }
    println!(
        "{} particles in {} global leaves.",
        reports[0].global_particles, reports[0].global_leaves
    );
}
