//! Hilbert keys in three dimensions.
//!
//! The keys use the transposed representation of Skilling, "Programming the
//! Hilbert curve" (AIP Conf. Proc. 707, 2004). The transposed coordinates are
//! interleaved like Morton keys, so that the first `3 * l` bits of a key
//! select the octree cell of level `l` containing it.

use crate::morton::{deinterleave, interleave};
use crate::sfc::SfcKey;

/// Encode grid coordinates on the deepest level as a Hilbert key.
pub fn encode<K: SfcKey>(coords: [u32; 3]) -> K {
    let bits = K::MAX_LEVEL;
    debug_assert!(coords.iter().all(|&c| (c as u64) < (1u64 << bits)));

    let mut x = coords;
    let m: u32 = 1 << (bits - 1);

    // Inverse undo of the excess work.
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..3 {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode.
    for i in 1..3 {
        x[i] ^= x[i - 1];
    }
    let mut t = 0;
    q = m;
    while q > 1 {
        if x[2] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for xi in x.iter_mut() {
        *xi ^= t;
    }

    K::from_raw(interleave(x))
}

/// Decode a Hilbert key into grid coordinates on the deepest level.
pub fn decode<K: SfcKey>(key: K) -> [u32; 3] {
    let bits = K::MAX_LEVEL;
    let mut x = deinterleave(key.as_u64());
    let n: u32 = 1 << bits;

    // Gray decode.
    let t = x[2] >> 1;
    for i in (1..3).rev() {
        x[i] ^= x[i - 1];
    }
    x[0] ^= t;

    // Undo the excess work.
    let mut q: u32 = 2;
    while q != n {
        let p = q - 1;
        for i in (0..3).rev() {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q <<= 1;
    }

    x
}
