//! Decompose random particles over the ranks of an MPI run.

use cornerstone_domain::{
    comm::mpi::MpiCommunicator,
    tools::{generate_random_points, seeded_rng},
    BoundaryKind, Domain, DomainBox, DomainConfig, ParticleSet,
};
use mpi::traits::Communicator as _;

pub fn main() {
    tracing_subscriber::fmt::init();

    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let world = universe.world();
    let comm = MpiCommunicator::new(&world);

    let domain_box = DomainBox::cube(0.0, 1.0, BoundaryKind::Open).unwrap();
    let config = DomainConfig::new(domain_box);

    // Create `npoints` per rank.
    let npoints = 10000;

    let mut rng = seeded_rng(world.rank() as usize);
    let [x, y, z] = generate_random_points(npoints, &domain_box, &mut rng);
    let mut particles = ParticleSet::<u64>::new(x, y, z, vec![0.01; npoints]).unwrap();

    let mut domain = Domain::<u64>::for_communicator(&comm, config).unwrap();
    let report = domain.sync(&comm, &mut particles).unwrap();

    println!(
        "rank {}: {} owned, {} halos",
        world.rank(),
        report.local_count,
        report.halo_count
    );
    if world.rank() == 0 {
        println!("{} particles in total.", report.global_particles);
    }
}
