//! Particle arrays.
//!
//! A [ParticleSet] holds the coordinates, smoothing lengths and keys of the
//! particles of one rank together with any number of named property arrays.
//! All arrays have the same length. The first `num_owned` entries are the
//! particles owned by the rank, the remaining entries are halo copies.

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::Range;

use bytemuck::Pod;

use crate::backend::BackendKind;
use crate::error::{DomainError, Result};
use crate::sfc::SfcKey;

/// A type erased column of particle data.
///
/// Implemented for every `Vec<T>` with a plain old data element type.
pub trait ParticleArray: Any + Send {
    /// Number of elements.
    fn len(&self) -> usize;

    /// Whether the array is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of one element in bytes.
    fn element_size(&self) -> usize;

    /// Name of the element type.
    fn type_name(&self) -> &'static str;

    /// Replace the contents by `self[order[i]]`.
    fn reorder(&mut self, order: &[usize], backend: BackendKind);

    /// Shorten the array.
    fn truncate(&mut self, len: usize);

    /// Grow or shrink to `len`, new elements are zeroed.
    fn resize_zeroed(&mut self, len: usize);

    /// Append the bytes of the elements in `ranges` to `out`.
    fn gather_bytes(&self, ranges: &[Range<usize>], out: &mut Vec<u8>);

    /// Overwrite elements starting at `offset` with `bytes`.
    fn scatter_bytes(&mut self, offset: usize, bytes: &[u8]);

    /// Upcast for downcasting to the concrete array.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for downcasting to the concrete array.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Pod + Send + Sync> ParticleArray for Vec<T> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn element_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn reorder(&mut self, order: &[usize], backend: BackendKind) {
        *self = backend.gather(self, order);
    }

    fn truncate(&mut self, len: usize) {
        Vec::truncate(self, len);
    }

    fn resize_zeroed(&mut self, len: usize) {
        self.resize(len, T::zeroed());
    }

    fn gather_bytes(&self, ranges: &[Range<usize>], out: &mut Vec<u8>) {
        for range in ranges {
            out.extend_from_slice(bytemuck::cast_slice(&self[range.clone()]));
        }
    }

    fn scatter_bytes(&mut self, offset: usize, bytes: &[u8]) {
        let count = bytes.len() / std::mem::size_of::<T>();
        debug_assert_eq!(count * std::mem::size_of::<T>(), bytes.len());
        let target: &mut [u8] = bytemuck::cast_slice_mut(&mut self[offset..offset + count]);
        target.copy_from_slice(bytes);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Particles of one rank.
pub struct ParticleSet<K: SfcKey> {
    keys: Vec<K>,
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    h: Vec<f64>,
    properties: Vec<(String, Box<dyn ParticleArray>)>,
    num_owned: usize,
}

fn check_length(name: &str, expected: usize, found: usize) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(DomainError::ArrayLengthMismatch {
            name: name.to_string(),
            expected,
            found,
        })
    }
}

impl<K: SfcKey> ParticleSet<K> {
    /// Create a particle set from coordinates and smoothing lengths.
    ///
    /// All particles are owned. Keys are computed by the first synchronization.
    pub fn new(x: Vec<f64>, y: Vec<f64>, z: Vec<f64>, h: Vec<f64>) -> Result<Self> {
        let n = x.len();
        check_length("y", n, y.len())?;
        check_length("z", n, z.len())?;
        check_length("h", n, h.len())?;

        Ok(Self {
            keys: vec![K::zero(); n],
            x,
            y,
            z,
            h,
            properties: Vec::new(),
            num_owned: n,
        })
    }

    /// Attach a named property array.
    ///
    /// Properties travel with their particles during redistribution and
    /// halo exchange. Adding a property replaces one of the same name.
    pub fn with_property<T: Pod + Send + Sync>(
        mut self,
        name: &str,
        values: Vec<T>,
    ) -> Result<Self> {
        check_length(name, self.len(), values.len())?;
        self.properties.retain(|(existing, _)| existing != name);
        self.properties.push((name.to_string(), Box::new(values)));
        Ok(self)
    }

    /// Total number of particles including halos.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Whether the set holds no particles.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Number of owned particles.
    pub fn num_owned(&self) -> usize {
        self.num_owned
    }

    /// Number of halo particles.
    pub fn num_halos(&self) -> usize {
        self.len() - self.num_owned
    }

    /// Keys of the particles. Valid after a synchronization.
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// x coordinates.
    pub fn x(&self) -> &[f64] {
        &self.x
    }

    /// y coordinates.
    pub fn y(&self) -> &[f64] {
        &self.y
    }

    /// z coordinates.
    pub fn z(&self) -> &[f64] {
        &self.z
    }

    /// Smoothing lengths.
    pub fn h(&self) -> &[f64] {
        &self.h
    }

    /// Mutable x coordinates.
    pub fn x_mut(&mut self) -> &mut [f64] {
        &mut self.x
    }

    /// Mutable y coordinates.
    pub fn y_mut(&mut self) -> &mut [f64] {
        &mut self.y
    }

    /// Mutable z coordinates.
    pub fn z_mut(&mut self) -> &mut [f64] {
        &mut self.z
    }

    /// Mutable smoothing lengths.
    pub fn h_mut(&mut self) -> &mut [f64] {
        &mut self.h
    }

    /// Position of particle `index`.
    pub fn position(&self, index: usize) -> [f64; 3] {
        [self.x[index], self.y[index], self.z[index]]
    }

    /// Names of the attached properties in insertion order.
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|(name, _)| name.as_str())
    }

    /// Typed access to a property. `None` if the name or type does not match.
    pub fn property<T: Pod + Send + Sync>(&self, name: &str) -> Option<&[T]> {
        self.properties
            .iter()
            .find(|(existing, _)| existing == name)
            .and_then(|(_, array)| array.as_any().downcast_ref::<Vec<T>>())
            .map(|values| values.as_slice())
    }

    /// Mutable typed access to a property.
    pub fn property_mut<T: Pod + Send + Sync>(&mut self, name: &str) -> Option<&mut [T]> {
        self.properties
            .iter_mut()
            .find(|(existing, _)| existing == name)
            .and_then(|(_, array)| array.as_any_mut().downcast_mut::<Vec<T>>())
            .map(|values| values.as_mut_slice())
    }

    /// Number of bytes one particle occupies over all arrays.
    pub fn row_bytes(&self) -> usize {
        self.arrays().iter().map(|array| array.element_size()).sum()
    }

    /// Hash of the key type and of the name and element type of every
    /// property, in order.
    ///
    /// Two sets can exchange rows only if their fingerprints are equal. The
    /// hash is stable within one build, which all ranks of a run share.
    pub fn layout_fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        std::any::type_name::<K>().hash(&mut hasher);
        for (name, array) in &self.properties {
            name.hash(&mut hasher);
            array.type_name().hash(&mut hasher);
            array.element_size().hash(&mut hasher);
        }
        hasher.finish()
    }

    /// All arrays, keys first, then coordinates, smoothing lengths and properties.
    pub(crate) fn arrays(&self) -> Vec<&dyn ParticleArray> {
        let mut arrays: Vec<&dyn ParticleArray> = vec![
            &self.keys as &dyn ParticleArray,
            &self.x,
            &self.y,
            &self.z,
            &self.h,
        ];
        arrays.extend(self.properties.iter().map(|(_, array)| array.as_ref()));
        arrays
    }

    /// Mutable view of all arrays in the order of [ParticleSet::arrays].
    pub(crate) fn arrays_mut(&mut self) -> Vec<&mut dyn ParticleArray> {
        let mut arrays: Vec<&mut dyn ParticleArray> = vec![
            &mut self.keys as &mut dyn ParticleArray,
            &mut self.x,
            &mut self.y,
            &mut self.z,
            &mut self.h,
        ];
        arrays.extend(self.properties.iter_mut().map(|(_, array)| array.as_mut()));
        arrays
    }

    /// Keys together with every other array, for sorting.
    pub(crate) fn keys_and_arrays_mut(&mut self) -> (&mut Vec<K>, Vec<&mut dyn ParticleArray>) {
        let mut arrays: Vec<&mut dyn ParticleArray> = vec![
            &mut self.x as &mut dyn ParticleArray,
            &mut self.y,
            &mut self.z,
            &mut self.h,
        ];
        arrays.extend(self.properties.iter_mut().map(|(_, array)| array.as_mut()));
        (&mut self.keys, arrays)
    }

    /// Mutable keys and read only coordinates.
    pub(crate) fn keys_mut_and_coordinates(&mut self) -> (&mut [K], [&[f64]; 3]) {
        (&mut self.keys, [&self.x, &self.y, &self.z])
    }

    /// Drop all particles beyond `len` and mark the rest as owned.
    pub(crate) fn truncate(&mut self, len: usize) {
        for array in self.arrays_mut() {
            array.truncate(len);
        }
        self.num_owned = self.num_owned.min(len);
    }

    /// Resize all arrays, new particles are zeroed.
    pub(crate) fn resize(&mut self, len: usize) {
        for array in self.arrays_mut() {
            array.resize_zeroed(len);
        }
    }

    pub(crate) fn set_num_owned(&mut self, num_owned: usize) {
        debug_assert!(num_owned <= self.len());
        self.num_owned = num_owned;
    }

    /// Check that every array has the length of the coordinate arrays.
    pub(crate) fn check_lengths(&self) -> Result<()> {
        let n = self.len();
        check_length("keys", n, self.keys.len())?;
        check_length("y", n, self.y.len())?;
        check_length("z", n, self.z.len())?;
        check_length("h", n, self.h.len())?;
        for (name, array) in &self.properties {
            check_length(name, n, array.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{ParticleArray, ParticleSet};
    use crate::backend::BackendKind;
    use crate::error::DomainError;

    #[test]
    fn test_construction() {
        let set = ParticleSet::<u64>::new(vec![0.0; 3], vec![0.0; 3], vec![0.0; 2], vec![0.0; 3]);
        assert!(matches!(
            set,
            Err(DomainError::ArrayLengthMismatch { expected: 3, found: 2, .. })
        ));

        let set = ParticleSet::<u64>::new(vec![0.0; 3], vec![0.0; 3], vec![0.0; 3], vec![0.1; 3])
            .unwrap()
            .with_property("id", vec![7u32, 8, 9])
            .unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.num_owned(), 3);
        assert_eq!(set.row_bytes(), 8 + 4 * 8 + 4);
        assert_eq!(set.property::<u32>("id"), Some(&[7u32, 8, 9][..]));
        assert!(set.property::<f64>("id").is_none());
        assert!(set.property::<u32>("mass").is_none());

        assert!(set.with_property("mass", vec![1.0f64]).is_err());
    }

    #[test]
    fn test_halo_section() {
        let mut set =
            ParticleSet::<u32>::new(vec![1.0, 2.0], vec![0.0; 2], vec![0.0; 2], vec![0.1; 2])
                .unwrap()
                .with_property("mass", vec![3.0f32, 4.0])
                .unwrap();
        assert_eq!(set.property_names().collect::<Vec<_>>(), vec!["mass"]);

        set.resize(3);
        assert_eq!(set.num_halos(), 1);
        assert_eq!(set.x(), &[1.0, 2.0, 0.0]);
        set.property_mut::<f32>("mass").unwrap()[2] = 5.0;
        set.h_mut()[2] = 0.2;
        assert!(set.check_lengths().is_ok());

        set.truncate(set.num_owned());
        assert_eq!(set.len(), 2);
        assert_eq!(set.property::<f32>("mass"), Some(&[3.0f32, 4.0][..]));
    }

    #[test]
    fn test_layout_fingerprint() {
        let base = || {
            ParticleSet::<u64>::new(vec![0.0; 2], vec![0.0; 2], vec![0.0; 2], vec![0.1; 2]).unwrap()
        };

        let mass_then_id = base()
            .with_property("mass", vec![1.0f64; 2])
            .unwrap()
            .with_property("id", vec![1u64, 2])
            .unwrap();
        let id_then_mass = base()
            .with_property("id", vec![1u64, 2])
            .unwrap()
            .with_property("mass", vec![1.0f64; 2])
            .unwrap();
        let integer_mass = base()
            .with_property("mass", vec![1u64; 2])
            .unwrap()
            .with_property("id", vec![1u64, 2])
            .unwrap();
        let same = base()
            .with_property("mass", vec![7.0f64; 2])
            .unwrap()
            .with_property("id", vec![3u64, 4])
            .unwrap();

        // Equal row sizes, different layouts.
        assert_eq!(mass_then_id.row_bytes(), id_then_mass.row_bytes());
        assert_eq!(mass_then_id.row_bytes(), integer_mass.row_bytes());
        assert_ne!(mass_then_id.layout_fingerprint(), id_then_mass.layout_fingerprint());
        assert_ne!(mass_then_id.layout_fingerprint(), integer_mass.layout_fingerprint());
        assert_eq!(mass_then_id.layout_fingerprint(), same.layout_fingerprint());
    }

    #[test]
    fn test_bytes() {
        let mut values = vec![1.5f64, 2.5, 3.5, 4.5];
        let mut bytes = Vec::new();
        values.gather_bytes(&[0..1, 2..4], &mut bytes);
        assert_eq!(bytes.len(), 24);

        values.resize_zeroed(7);
        values.scatter_bytes(4, &bytes);
        assert_eq!(values, vec![1.5, 2.5, 3.5, 4.5, 1.5, 3.5, 4.5]);

        values.reorder(&[6, 0], BackendKind::Host);
        assert_eq!(values, vec![4.5, 1.5]);
    }
}
