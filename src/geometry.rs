//! Geometry of the simulation domain.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};
use crate::sfc::{CurveKind, SfcKey};

/// Behaviour of the domain along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryKind {
    /// The extent follows the particles and is recomputed every step.
    #[default]
    Open,
    /// Positions wrap around with period `hi - lo`.
    Periodic,
    /// Positions must stay inside `[lo, hi]`.
    Fixed,
}

/// Half open box of integer grid coordinates on the deepest level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntegerBox {
    /// Smallest coordinate on each axis.
    pub lo: [u32; 3],
    /// One past the largest coordinate on each axis.
    pub hi: [u32; 3],
}

/// Axis aligned box in physical coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellBounds {
    /// Lower corner.
    pub lo: [f64; 3],
    /// Upper corner.
    pub hi: [f64; 3],
}

impl CellBounds {
    /// Largest edge length.
    pub fn edge_length(&self) -> f64 {
        (0..3)
            .map(|d| self.hi[d] - self.lo[d])
            .fold(0.0, f64::max)
    }
}

/// A box describes the domain in which the particles live.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomainBox {
    lo: [f64; 3],
    hi: [f64; 3],
    boundaries: [BoundaryKind; 3],
}

impl Default for DomainBox {
    /// The open unit cube.
    fn default() -> Self {
        Self {
            lo: [0.0; 3],
            hi: [1.0; 3],
            boundaries: [BoundaryKind::Open; 3],
        }
    }
}

impl DomainBox {
    /// Create a new box from its lower and upper corner.
    pub fn new(lo: [f64; 3], hi: [f64; 3], boundaries: [BoundaryKind; 3]) -> Result<Self> {
        let domain_box = Self { lo, hi, boundaries };
        domain_box.validate()?;
        Ok(domain_box)
    }

    /// Create a cube with the same bounds and boundary kind on every axis.
    pub fn cube(lo: f64, hi: f64, boundary: BoundaryKind) -> Result<Self> {
        Self::new([lo; 3], [hi; 3], [boundary; 3])
    }

    /// Check that each axis has finite bounds with `lo < hi`.
    pub fn validate(&self) -> Result<()> {
        for axis in 0..3 {
            let (lo, hi) = (self.lo[axis], self.hi[axis]);
            if !(lo.is_finite() && hi.is_finite() && lo < hi) {
                return Err(DomainError::InvalidBox { axis, lo, hi });
            }
        }
        Ok(())
    }

    /// Lower corner.
    pub fn lo(&self) -> [f64; 3] {
        self.lo
    }

    /// Upper corner.
    pub fn hi(&self) -> [f64; 3] {
        self.hi
    }

    /// Boundary kind of each axis.
    pub fn boundaries(&self) -> [BoundaryKind; 3] {
        self.boundaries
    }

    /// Edge lengths.
    pub fn lengths(&self) -> [f64; 3] {
        [0, 1, 2].map(|d| self.hi[d] - self.lo[d])
    }

    /// Replace the bounds of a single axis.
    pub fn with_bounds(&self, axis: usize, lo: f64, hi: f64) -> Result<Self> {
        let mut domain_box = *self;
        domain_box.lo[axis] = lo;
        domain_box.hi[axis] = hi;
        domain_box.validate()?;
        Ok(domain_box)
    }

    /// Map a position into the box.
    ///
    /// Periodic axes wrap into `[lo, hi)`. Open axes are left unchanged.
    /// Fixed axes are checked and a position outside `[lo, hi]` is an error.
    /// Non-finite coordinates are rejected on every axis.
    pub fn normalize(&self, position: [f64; 3]) -> Result<[f64; 3]> {
        let mut result = position;
        for axis in 0..3 {
            let (lo, hi) = (self.lo[axis], self.hi[axis]);
            let value = position[axis];
            if !value.is_finite() {
                return Err(DomainError::OutOfBounds { axis, value, lo, hi });
            }
            match self.boundaries[axis] {
                BoundaryKind::Open => (),
                BoundaryKind::Periodic => {
                    let length = hi - lo;
                    let mut wrapped = value - length * ((value - lo) / length).floor();
                    // Rounding can land exactly on the upper bound.
                    if wrapped >= hi {
                        wrapped = lo;
                    }
                    result[axis] = wrapped;
                }
                BoundaryKind::Fixed => {
                    if !(lo..=hi).contains(&value) {
                        return Err(DomainError::OutOfBounds {
                            axis,
                            value,
                            lo,
                            hi,
                        });
                    }
                }
            }
        }
        Ok(result)
    }

    /// Shortest difference vector `b - a`, taking the short way around periodic axes.
    pub fn periodic_distance(&self, a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
        let mut delta = [0.0; 3];
        for axis in 0..3 {
            let mut d = b[axis] - a[axis];
            if self.boundaries[axis] == BoundaryKind::Periodic {
                let length = self.hi[axis] - self.lo[axis];
                d -= length * (d / length).round();
            }
            delta[axis] = d;
        }
        delta
    }

    /// Integer coordinates on the deepest level of a normalized position.
    ///
    /// Values on or beyond the upper bound fall into the last cell.
    pub fn grid_coordinates<K: SfcKey>(&self, position: [f64; 3]) -> [u32; 3] {
        let cells = (1u64 << K::MAX_LEVEL) as f64;
        let last = (1u32 << K::MAX_LEVEL) - 1;
        [0, 1, 2].map(|d| {
            let scaled = (position[d] - self.lo[d]) / (self.hi[d] - self.lo[d]) * cells;
            if scaled <= 0.0 {
                0
            } else {
                (scaled as u64).min(last as u64) as u32
            }
        })
    }

    /// Key of a normalized position.
    pub fn encode<K: SfcKey>(&self, curve: CurveKind, position: [f64; 3]) -> K {
        curve.encode(self.grid_coordinates::<K>(position))
    }

    /// Physical bounds of an integer box.
    pub fn cell_bounds<K: SfcKey>(&self, cell: &IntegerBox) -> CellBounds {
        let cells = (1u64 << K::MAX_LEVEL) as f64;
        let mut bounds = CellBounds {
            lo: [0.0; 3],
            hi: [0.0; 3],
        };
        for d in 0..3 {
            let unit = (self.hi[d] - self.lo[d]) / cells;
            bounds.lo[d] = self.lo[d] + cell.lo[d] as f64 * unit;
            bounds.hi[d] = self.lo[d] + cell.hi[d] as f64 * unit;
        }
        bounds
    }

    /// Minimum distance between two boxes inside the domain.
    ///
    /// Periodic axes consider the images shifted by one period. The distance
    /// never increases when either box grows.
    pub fn min_distance(&self, a: &CellBounds, b: &CellBounds) -> f64 {
        fn gap(a_lo: f64, a_hi: f64, b_lo: f64, b_hi: f64) -> f64 {
            (a_lo - b_hi).max(b_lo - a_hi).max(0.0)
        }

        let mut squared = 0.0;
        for d in 0..3 {
            let mut g = gap(a.lo[d], a.hi[d], b.lo[d], b.hi[d]);
            if self.boundaries[d] == BoundaryKind::Periodic {
                let length = self.hi[d] - self.lo[d];
                g = g
                    .min(gap(a.lo[d], a.hi[d], b.lo[d] - length, b.hi[d] - length))
                    .min(gap(a.lo[d], a.hi[d], b.lo[d] + length, b.hi[d] + length));
            }
            squared += g * g;
        }
        squared.sqrt()
    }

    /// Minimum distance from a box to a region made of several boxes.
    pub fn min_distance_to_region(&self, cell: &CellBounds, region: &[CellBounds]) -> f64 {
        region
            .iter()
            .map(|other| self.min_distance(cell, other))
            .fold(f64::INFINITY, f64::min)
    }
}

impl std::fmt::Display for DomainBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(lo: [{}, {}, {}], hi: [{}, {}, {}], boundaries: {:?})",
            self.lo[0],
            self.lo[1],
            self.lo[2],
            self.hi[0],
            self.hi[1],
            self.hi[2],
            self.boundaries
        )
    }
}
