//! Crate wide constants.

/// Number of children of an octree node.
pub const NSIBLINGS: usize = 8;

/// Deepest octree level representable with 32 bit keys.
pub const MAX_LEVEL_32: u32 = 10;

/// Deepest octree level representable with 64 bit keys.
pub const MAX_LEVEL_64: u32 = 21;

/// Default maximum number of particles per leaf of the global tree.
pub const DEFAULT_BUCKET_SIZE: usize = 64;

/// Default opening angle of the focused tree.
pub const DEFAULT_FOCUS_THETA: f64 = 0.5;

/// Default bound on rebalance iterations of the global tree.
pub const DEFAULT_MAX_REBALANCE_ITERATIONS: usize = 64;

/// Default factor applied to the largest smoothing length to obtain the halo radius.
pub const DEFAULT_HALO_FACTOR: f64 = 2.0;

/// Relative slack added to the halo radius to absorb rounding in cell boundaries.
pub const HALO_RADIUS_SLACK: f64 = 1e-10;
