//! Utility routines.

use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::geometry::DomainBox;
use crate::sfc::{CurveKind, SfcKey};

/// Count how many elements of a sorted sequence fall into each bin.
///
/// Bin `j` is the half open interval `[bins[j], bins[j + 1])`, the last bin
/// is unbounded above. Both sequences must be sorted and no element may be
/// smaller than `bins[0]`. As the elements are sorted, the counts fully
/// determine which element goes into which bin.
pub fn sort_to_bins<T: Ord>(sorted_keys: &[T], bins: &[T]) -> Vec<usize> {
    debug_assert!(match (bins.first(), sorted_keys.first()) {
        (Some(bin), Some(key)) => bin <= key,
        _ => true,
    });

    // Each bin ends where the next one starts. The last bin takes everything else.
    let ends = bins
        .iter()
        .skip(1)
        .map(|bin| sorted_keys.partition_point(|key| key < bin))
        .chain(std::iter::once(sorted_keys.len()))
        .collect_vec();

    let mut start = 0;
    ends.into_iter()
        .map(|end| {
            let count = end - start;
            start = end;
            count
        })
        .collect()
}

/// Exclusive prefix sum of counts.
///
/// The counts `[3, 4, 5]` give the offsets `[0, 3, 7]`.
pub fn displacements(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

/// Deterministic random number generator for tests and demos.
pub fn seeded_rng(seed: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed as u64)
}

/// Generate random Morton keys for testing.
pub fn generate_random_keys<K: SfcKey, R: Rng>(nkeys: usize, rng: &mut R) -> Vec<K> {
    let cells = 1u32 << K::MAX_LEVEL;
    (0..nkeys)
        .map(|_| {
            CurveKind::Morton.encode([
                rng.gen_range(0..cells),
                rng.gen_range(0..cells),
                rng.gen_range(0..cells),
            ])
        })
        .collect()
}

/// Generate uniformly distributed random points inside a box for testing.
///
/// Returns the coordinate arrays `[x, y, z]`.
pub fn generate_random_points<R: Rng>(
    npoints: usize,
    domain_box: &DomainBox,
    rng: &mut R,
) -> [Vec<f64>; 3] {
    let (lo, hi) = (domain_box.lo(), domain_box.hi());
    let mut coords = [
        Vec::with_capacity(npoints),
        Vec::with_capacity(npoints),
        Vec::with_capacity(npoints),
    ];

    for _ in 0..npoints {
        for (axis, values) in coords.iter_mut().enumerate() {
            values.push(rng.gen_range(lo[axis]..hi[axis]));
        }
    }

    coords
}

/// Euclidean distance of two points, honoring periodic axes of the box.
pub fn point_distance(domain_box: &DomainBox, a: [f64; 3], b: [f64; 3]) -> f64 {
    let delta = domain_box.periodic_distance(a, b);
    delta.iter().map(|d| d * d).sum::<f64>().sqrt()
}
