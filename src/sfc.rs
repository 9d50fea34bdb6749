//! Space filling curve keys and key range arithmetic.
//!
//! A key of type `K` holds `3 * K::MAX_LEVEL` bits, three bits per octree
//! level with the coarsest level in the most significant position. The
//! aligned key range `[k, k + node_range(l))` with `k` a multiple of
//! `node_range(l)` is exactly one octree cell of level `l`, both for the
//! Morton and the Hilbert curve.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use bytemuck::Pod;
use num::{PrimInt, Unsigned};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_LEVEL_32, MAX_LEVEL_64};
use crate::geometry::IntegerBox;
use crate::{hilbert, morton};

/// Integer type usable as a space filling curve key.
pub trait SfcKey:
    PrimInt + Unsigned + Pod + Hash + Debug + Display + Default + Send + Sync + 'static
{
    /// Deepest octree level representable with this key type.
    const MAX_LEVEL: u32;

    /// Convert from a 64 bit value. The value must fit.
    fn from_raw(value: u64) -> Self;

    /// Widen to 64 bits.
    fn as_u64(self) -> u64;
}

impl SfcKey for u32 {
    const MAX_LEVEL: u32 = MAX_LEVEL_32;

    fn from_raw(value: u64) -> Self {
        debug_assert!(value <= u32::MAX as u64);
        value as u32
    }

    fn as_u64(self) -> u64 {
        self as u64
    }
}

impl SfcKey for u64 {
    const MAX_LEVEL: u32 = MAX_LEVEL_64;

    fn from_raw(value: u64) -> Self {
        value
    }

    fn as_u64(self) -> u64 {
        self
    }
}

/// The space filling curve used to order particles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveKind {
    /// Z-order curve.
    Morton,
    /// Hilbert curve. Better locality, slightly more expensive to compute.
    #[default]
    Hilbert,
}

impl CurveKind {
    /// Encode grid coordinates on the deepest level.
    pub fn encode<K: SfcKey>(self, coords: [u32; 3]) -> K {
        match self {
            CurveKind::Morton => morton::encode(coords),
            CurveKind::Hilbert => hilbert::encode(coords),
        }
    }

    /// Decode a key into grid coordinates on the deepest level.
    pub fn decode<K: SfcKey>(self, key: K) -> [u32; 3] {
        match self {
            CurveKind::Morton => morton::decode(key),
            CurveKind::Hilbert => hilbert::decode(key),
        }
    }

    /// Integer box of the octree cell with first key `key` on `level`.
    pub fn cell<K: SfcKey>(self, key: K, level: u32) -> IntegerBox {
        debug_assert!(is_aligned(key, level));
        let size = 1u32 << (K::MAX_LEVEL - level);
        let anchor = self.decode(key).map(|c| c & !(size - 1));
        IntegerBox {
            lo: anchor,
            hi: anchor.map(|c| c + size),
        }
    }
}

/// Length of the key range of a node on `level`.
pub fn node_range<K: SfcKey>(level: u32) -> K {
    debug_assert!(level <= K::MAX_LEVEL);
    K::from_raw(1u64 << (3 * (K::MAX_LEVEL - level)))
}

/// One past the largest valid key. Last element of every cornerstone array.
pub fn max_key<K: SfcKey>() -> K {
    node_range(0)
}

/// Level of a node with key range length `range`.
pub fn tree_level<K: SfcKey>(range: K) -> u32 {
    debug_assert!(range.count_ones() == 1 && range.trailing_zeros() % 3 == 0);
    K::MAX_LEVEL - range.trailing_zeros() / 3
}

/// Octal digit of `key` selecting the child on `level` (1 based).
pub fn octal_digit<K: SfcKey>(key: K, level: u32) -> usize {
    debug_assert!(level >= 1 && level <= K::MAX_LEVEL);
    ((key.as_u64() >> (3 * (K::MAX_LEVEL - level))) & 7) as usize
}

/// Whether `key` is the first key of a node on `level`.
pub fn is_aligned<K: SfcKey>(key: K, level: u32) -> bool {
    key.as_u64() % node_range::<K>(level).as_u64() == 0
}

/// First key of the node on `level` containing `key`.
pub fn enclosing_key<K: SfcKey>(key: K, level: u32) -> K {
    let range = node_range::<K>(level).as_u64();
    K::from_raw(key.as_u64() / range * range)
}

/// Minimal list of aligned nodes covering the key range `[first, last)`.
///
/// Returned as `(key, level)` pairs in key order. At most `14 * MAX_LEVEL`
/// nodes are needed for any range.
pub fn span_sfc_range<K: SfcKey>(first: K, last: K) -> Vec<(K, u32)> {
    let mut nodes = Vec::new();
    let last = last.as_u64();
    let mut current = first.as_u64();

    while current < last {
        let mut level = 0;
        let mut range = 1u64 << (3 * K::MAX_LEVEL);
        while current % range != 0 || current + range > last {
            level += 1;
            range >>= 3;
        }
        nodes.push((K::from_raw(current), level));
        current += range;
    }

    nodes
}
