//! Moving particle rows between ranks.
//!
//! A message carries whole particle rows. The rows of each array are packed
//! one array after the other, in the order keys, `x`, `y`, `z`, `h`, then the
//! properties in insertion order. Receivers unpack with the same order, so
//! all ranks must hold the same property layout.

use std::ops::Range;

use crate::assignment::SpaceCurveAssignment;
use crate::backend::Backend;
use crate::comm::{exchange_buffers, exchange_counts, Communicator, MessageTag};
use crate::error::Result;
use crate::halos::HaloPlan;
use crate::particles::{ParticleArray, ParticleSet};
use crate::sfc::SfcKey;
use crate::sort::sort_particles;
use crate::tools::{displacements, sort_to_bins};

/// Pack the rows in `ranges` of every array.
fn pack(arrays: &[&dyn ParticleArray], ranges: &[Range<usize>], row_bytes: usize) -> Vec<u8> {
    let rows: usize = ranges.iter().map(|range| range.len()).sum();
    let mut buffer = Vec::with_capacity(rows * row_bytes);
    for array in arrays {
        array.gather_bytes(ranges, &mut buffer);
    }
    buffer
}

/// Unpack `rows` rows from `buffer` into every array starting at `offset`.
fn unpack(arrays: &mut [&mut dyn ParticleArray], offset: usize, rows: usize, buffer: &[u8]) {
    let mut position = 0;
    for array in arrays.iter_mut() {
        let bytes = rows * array.element_size();
        array.scatter_bytes(offset, &buffer[position..position + bytes]);
        position += bytes;
    }
    debug_assert_eq!(position, buffer.len());
}

/// Send every owned particle to the rank owning its key.
///
/// The owned particles must be sorted by key and any halos must already be
/// dropped. On return the set holds exactly the particles in the key range
/// of the calling rank, sorted by key, all of them owned. Returns the new
/// number of particles.
pub fn redistribute<K: SfcKey, B: Backend, C: Communicator>(
    particles: &mut ParticleSet<K>,
    assignment: &SpaceCurveAssignment<K>,
    comm: &C,
) -> Result<usize> {
    let (rank, size) = (comm.rank(), comm.size());
    debug_assert_eq!(particles.len(), particles.num_owned());
    debug_assert_eq!(assignment.num_ranks(), size);

    let send_counts = sort_to_bins(particles.keys(), assignment.rank_start_keys());
    let send_offsets = displacements(&send_counts);
    let recv_counts = exchange_counts(
        comm,
        &send_counts.iter().map(|&count| count as u64).collect::<Vec<_>>(),
    )?
    .into_iter()
    .map(|count| count as usize)
    .collect::<Vec<_>>();
    let recv_offsets = displacements(&recv_counts);
    let new_len: usize = recv_counts.iter().sum();

    let row_bytes = particles.row_bytes();
    let peers = (0..size).filter(|&peer| peer != rank).collect::<Vec<_>>();
    let kept = send_offsets[rank]..send_offsets[rank] + send_counts[rank];

    let (outgoing, kept_rows) = {
        let arrays = particles.arrays();
        let outgoing = peers
            .iter()
            .map(|&peer| {
                let range = send_offsets[peer]..send_offsets[peer] + send_counts[peer];
                (peer, pack(&arrays, &[range], row_bytes))
            })
            .collect::<Vec<_>>();
        (outgoing, pack(&arrays, &[kept], row_bytes))
    };
    let incoming = peers
        .iter()
        .map(|&peer| (peer, recv_counts[peer] * row_bytes))
        .collect::<Vec<_>>();

    let messages = exchange_buffers(comm, MessageTag::Redistribute.tag(), outgoing, &incoming)?;

    // Received rows are placed in rank order, the kept rows at the own slot.
    particles.truncate(0);
    particles.resize(new_len);
    {
        let mut arrays = particles.arrays_mut();
        unpack(&mut arrays, recv_offsets[rank], recv_counts[rank], &kept_rows);
        for (&peer, message) in peers.iter().zip(&messages) {
            unpack(&mut arrays, recv_offsets[peer], recv_counts[peer], message);
        }
    }
    particles.set_num_owned(new_len);

    // Rows from different senders interleave in key order.
    sort_particles::<K, B>(particles)?;

    tracing::debug!(
        rank,
        sent = send_counts.iter().sum::<usize>() - send_counts[rank],
        received = new_len - recv_counts[rank],
        owned = new_len,
        "particles redistributed"
    );
    Ok(new_len)
}

/// Fill the halo section of `particles` according to `plan`.
///
/// The owned section is left untouched. On return the set holds
/// `plan.local_count() + plan.halo_count()` particles.
pub fn exchange_halos<K: SfcKey, C: Communicator>(
    particles: &mut ParticleSet<K>,
    plan: &HaloPlan,
    comm: &C,
) -> Result<()> {
    let rank = comm.rank();
    debug_assert_eq!(particles.num_owned(), plan.local_count());

    let row_bytes = particles.row_bytes();
    let peers = (0..comm.size()).filter(|&peer| peer != rank).collect::<Vec<_>>();

    particles.truncate(plan.local_count());
    let outgoing = {
        let arrays = particles.arrays();
        peers
            .iter()
            .map(|&peer| (peer, pack(&arrays, plan.send_list(peer).ranges(), row_bytes)))
            .collect::<Vec<_>>()
    };
    let incoming = peers
        .iter()
        .map(|&peer| (peer, plan.recv_count(peer) * row_bytes))
        .collect::<Vec<_>>();

    let messages = exchange_buffers(comm, MessageTag::Halos.tag(), outgoing, &incoming)?;

    particles.resize(plan.local_count() + plan.halo_count());
    let mut arrays = particles.arrays_mut();
    for (&peer, message) in peers.iter().zip(&messages) {
        unpack(&mut arrays, plan.recv_offset(peer), plan.recv_count(peer), message);
    }

    tracing::debug!(
        rank,
        sent = plan.send_count(),
        received = plan.halo_count(),
        "halos exchanged"
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{pack, redistribute, unpack};
    use crate::assignment::compute_assignment;
    use crate::backend::HostBackend;
    use crate::comm::local::LocalCluster;
    use crate::comm::Communicator;
    use crate::octree::uniform_tree;
    use crate::particles::{ParticleArray, ParticleSet};

    #[test]
    fn test_pack_unpack_rows() {
        let ids: Vec<u32> = vec![10, 11, 12, 13, 14];
        let values: Vec<f64> = vec![0.0, 0.5, 1.0, 1.5, 2.0];
        let buffer = pack(&[&ids as &dyn ParticleArray, &values], &[1..2, 3..5], 12);
        assert_eq!(buffer.len(), 36);

        let mut target_ids: Vec<u32> = vec![0; 4];
        let mut target_values: Vec<f64> = vec![0.0; 4];
        unpack(
            &mut [&mut target_ids as &mut dyn ParticleArray, &mut target_values],
            1,
            3,
            &buffer,
        );

        assert_eq!(target_ids, vec![0, 11, 13, 14]);
        assert_eq!(target_values, vec![0.0, 0.5, 1.5, 2.0]);
    }

    #[test]
    fn test_redistribute_moves_rows_to_owners() {
        let tree = uniform_tree::<u32>(1);
        let counts = vec![1; 8];
        let assignment = compute_assignment(&tree, &counts, 2).unwrap();

        let results = LocalCluster::run(2, |comm| {
            // Every rank starts with one particle per octant, tagged by rank.
            let n = 8;
            let rank = comm.rank() as u32;
            let mut particles =
                ParticleSet::<u32>::new(vec![0.0; n], vec![0.0; n], vec![0.0; n], vec![1.0; n])
                    .unwrap()
                    .with_property("origin", vec![rank; n])
                    .unwrap();
            {
                let (keys, _) = particles.keys_mut_and_coordinates();
                for (octant, key) in keys.iter_mut().enumerate() {
                    *key = tree[octant] + rank;
                }
            }

            let owned =
                redistribute::<u32, HostBackend, _>(&mut particles, &assignment, &comm).unwrap();
            (
                owned,
                particles.keys().to_vec(),
                particles.property::<u32>("origin").unwrap().to_vec(),
            )
        });

        for (rank, (owned, keys, origin)) in results.into_iter().enumerate() {
            assert_eq!(owned, 8);
            let (first, last) = assignment.key_range(rank);
            assert!(keys.iter().all(|&key| first <= key && key < last));
            assert!(keys.windows(2).all(|pair| pair[0] <= pair[1]));
            // Keys of rank 1 are one larger, so origins alternate.
            assert_eq!(origin, vec![0, 1, 0, 1, 0, 1, 0, 1]);
        }
    }
}
