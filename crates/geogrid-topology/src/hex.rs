//! Hexagonal cells in axial coordinates.
//!
//! Axial coordinates use two axes (q, r) at 60 degrees, with an implicit
//! third axis s = -q - r. Cells are pointy-top hexagons of a fixed edge
//! length; a [`Location`] maps to exactly one cell.

use std::ops::{Add, Neg, Sub};

use crate::Location;

const SQRT_3: f64 = 1.732_050_807_568_877_2;

/// A hex cell on the plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HexCell {
    /// First axial coordinate
    pub q: i64,
    /// Second axial coordinate
    pub r: i64,
}

impl HexCell {
    /// Cell containing the origin.
    pub const ORIGIN: Self = Self { q: 0, r: 0 };

    /// The six planar neighbor directions.
    pub const PLANAR_DIRECTIONS: [Self; 6] = [
        Self { q: 1, r: 0 },  // East
        Self { q: 1, r: -1 }, // Northeast
        Self { q: 0, r: -1 }, // Northwest
        Self { q: -1, r: 0 }, // West
        Self { q: -1, r: 1 }, // Southwest
        Self { q: 0, r: 1 },  // Southeast
    ];

    /// Create a new cell.
    pub const fn new(q: i64, r: i64) -> Self {
        Self { q, r }
    }

    /// Implicit third axis: s = -q - r.
    pub const fn s(&self) -> i64 {
        -self.q - self.r
    }

    /// Cell containing `location` for hexagons of edge length `size`.
    pub fn containing(location: Location, size: f64) -> Self {
        let q = (SQRT_3 / 3.0 * location.x - location.y / 3.0) / size;
        let r = (2.0 / 3.0 * location.y) / size;
        Self::round(q, r)
    }

    /// Center of this cell for hexagons of edge length `size`.
    pub fn center(&self, size: f64) -> Location {
        let q = self.q as f64;
        let r = self.r as f64;
        Location {
            x: size * (SQRT_3 * q + SQRT_3 / 2.0 * r),
            y: size * (1.5 * r),
        }
    }

    /// Cube rounding of fractional axial coordinates.
    fn round(q: f64, r: f64) -> Self {
        let s = -q - r;
        let mut rq = q.round();
        let mut rr = r.round();
        let rs = s.round();

        let dq = (rq - q).abs();
        let dr = (rr - r).abs();
        let ds = (rs - s).abs();

        if dq > dr && dq > ds {
            rq = -rr - rs;
        } else if dr > ds {
            rr = -rq - rs;
        }

        Self {
            q: rq as i64,
            r: rr as i64,
        }
    }

    /// Hexagonal distance: max(|dq|, |dr|, |ds|).
    pub fn distance(&self, other: &Self) -> u64 {
        let dq = (self.q - other.q).unsigned_abs();
        let dr = (self.r - other.r).unsigned_abs();
        let ds = ((self.q - other.q) + (self.r - other.r)).unsigned_abs();
        dq.max(dr).max(ds)
    }

    /// All six planar neighbors.
    pub fn neighbors(&self) -> [Self; 6] {
        Self::PLANAR_DIRECTIONS.map(|d| *self + d)
    }
}

impl Add for HexCell {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            q: self.q + other.q,
            r: self.r + other.r,
        }
    }
}

impl Sub for HexCell {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Self {
            q: self.q - other.q,
            r: self.r - other.r,
        }
    }
}

impl Neg for HexCell {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Self {
            q: -self.q,
            r: -self.r,
        }
    }
}

impl std::fmt::Display for HexCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.q, self.r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s_axis_constraint() {
        for c in [HexCell::new(0, 0), HexCell::new(1, -1), HexCell::new(-3, 5)] {
            assert_eq!(c.q + c.r + c.s(), 0);
        }
    }

    #[test]
    fn neighbors_at_distance_one() {
        let origin = HexCell::ORIGIN;
        for n in origin.neighbors() {
            assert_eq!(n.distance(&origin), 1);
        }
    }

    #[test]
    fn center_maps_back_to_cell() {
        for size in [0.5, 1.0, 7.25] {
            for q in -4..=4 {
                for r in -4..=4 {
                    let cell = HexCell::new(q, r);
                    assert_eq!(HexCell::containing(cell.center(size), size), cell);
                }
            }
        }
    }

    #[test]
    fn nearby_points_share_a_cell() {
        let size = 10.0;
        let a = HexCell::containing(Location::new(0.1, 0.2), size);
        let b = HexCell::containing(Location::new(-0.3, 0.1), size);
        assert_eq!(a, HexCell::ORIGIN);
        assert_eq!(a, b);
    }

    #[test]
    fn addition_subtraction() {
        let a = HexCell::new(1, 2);
        let b = HexCell::new(4, -1);
        assert_eq!(a + b, HexCell::new(5, 1));
        assert_eq!(a - b, HexCell::new(-3, 3));
        assert_eq!(a + (-b), a - b);
    }
}
