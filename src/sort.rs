//! Sorting particles by key.

use crate::backend::Backend;
use crate::error::{DomainError, Result};
use crate::particles::{ParticleArray, ParticleSet};
use crate::sfc::SfcKey;

/// Sort `keys` and apply the same permutation to every associated array.
///
/// The sort is stable, particles with equal keys keep their relative order.
/// Returns the permutation, `sorted[i] = unsorted[order[i]]`. Nothing is
/// modified if an array length differs from the number of keys.
pub fn sort_by_keys<K: SfcKey, B: Backend>(
    keys: &mut Vec<K>,
    arrays: &mut [&mut dyn ParticleArray],
) -> Result<Vec<usize>> {
    for (index, array) in arrays.iter().enumerate() {
        if array.len() != keys.len() {
            return Err(DomainError::ArrayLengthMismatch {
                name: format!("array {index}"),
                expected: keys.len(),
                found: array.len(),
            });
        }
    }

    let order = B::sort_permutation(keys);
    *keys = B::gather(keys, &order);
    for array in arrays.iter_mut() {
        array.reorder(&order, B::KIND);
    }

    Ok(order)
}

/// Sort all arrays of a particle set by key.
pub fn sort_particles<K: SfcKey, B: Backend>(particles: &mut ParticleSet<K>) -> Result<Vec<usize>> {
    let (keys, mut arrays) = particles.keys_and_arrays_mut();
    sort_by_keys::<K, B>(keys, &mut arrays)
}

/// Whether a key sequence is sorted.
pub fn is_sorted<K: SfcKey>(keys: &[K]) -> bool {
    keys.windows(2).all(|pair| pair[0] <= pair[1])
}
