//! Routines for working with Morton indices.

use crate::sfc::SfcKey;

/// Spread the lower 21 bits of `value` so that two zero bits follow each bit.
fn expand_bits(value: u64) -> u64 {
    let mut x = value & 0x1fffff;
    x = (x | x << 32) & 0x001f_0000_0000_ffff;
    x = (x | x << 16) & 0x001f_0000_ff00_00ff;
    x = (x | x << 8) & 0x100f_00f0_0f00_f00f;
    x = (x | x << 4) & 0x10c3_0c30_c30c_30c3;
    x = (x | x << 2) & 0x1249_2492_4924_9249;
    x
}

/// Inverse of [expand_bits].
fn compact_bits(value: u64) -> u64 {
    let mut x = value & 0x1249_2492_4924_9249;
    x = (x ^ (x >> 2)) & 0x10c3_0c30_c30c_30c3;
    x = (x ^ (x >> 4)) & 0x100f_00f0_0f00_f00f;
    x = (x ^ (x >> 8)) & 0x001f_0000_ff00_00ff;
    x = (x ^ (x >> 16)) & 0x001f_0000_0000_ffff;
    x = (x ^ (x >> 32)) & 0x1fffff;
    x
}

/// Interleave three coordinates bitwise.
///
/// In every octal digit of the result the x bit is the most significant
/// and the z bit the least significant one.
pub(crate) fn interleave(coords: [u32; 3]) -> u64 {
    (expand_bits(coords[0] as u64) << 2)
        | (expand_bits(coords[1] as u64) << 1)
        | expand_bits(coords[2] as u64)
}

/// Inverse of [interleave].
pub(crate) fn deinterleave(key: u64) -> [u32; 3] {
    [
        compact_bits(key >> 2) as u32,
        compact_bits(key >> 1) as u32,
        compact_bits(key) as u32,
    ]
}

/// Encode grid coordinates on the deepest level as a Morton key.
///
/// Each coordinate must be smaller than `2^K::MAX_LEVEL`.
pub fn encode<K: SfcKey>(coords: [u32; 3]) -> K {
    debug_assert!(coords.iter().all(|&c| (c as u64) < (1u64 << K::MAX_LEVEL)));
    K::from_raw(interleave(coords))
}

/// Decode a Morton key into grid coordinates on the deepest level.
pub fn decode<K: SfcKey>(key: K) -> [u32; 3] {
    deinterleave(key.as_u64())
}
