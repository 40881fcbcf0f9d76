//! Hex-cell proximity adjacency.
//!
//! Points are bucketed into [`HexCell`]s of a fixed size. Two points are
//! neighbors when their cells are equal or planar neighbors, so the overlay
//! follows the hexagonal tiling of the plane. Points with no other point in
//! reach stay isolated; such nodes simply serve every query locally.

use std::collections::{BTreeSet, HashMap};

use crate::{Adjacency, Edge, HexCell, Location, DEFAULT_CELL_SIZE};

#[derive(Debug, Clone)]
pub struct HexProximity {
    cell_size: f64,
    points: Vec<Location>,
}

impl HexProximity {
    /// Create a proximity adjacency over cells of `cell_size`.
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size,
            points: Vec::new(),
        }
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Cell of the point at `index`.
    pub fn cell_of(&self, index: usize) -> Option<HexCell> {
        self.points
            .get(index)
            .map(|p| HexCell::containing(*p, self.cell_size))
    }
}

impl Default for HexProximity {
    fn default() -> Self {
        Self::new(DEFAULT_CELL_SIZE)
    }
}

impl Adjacency for HexProximity {
    fn add_point(&mut self, location: Location) -> usize {
        self.points.push(location);
        self.points.len() - 1
    }

    fn compute_adjacency(&self) -> BTreeSet<Edge> {
        let mut buckets: HashMap<HexCell, Vec<usize>> = HashMap::new();
        for (i, p) in self.points.iter().enumerate() {
            buckets
                .entry(HexCell::containing(*p, self.cell_size))
                .or_default()
                .push(i);
        }

        let mut edges = BTreeSet::new();
        for (cell, members) in &buckets {
            let nearby = std::iter::once(*cell).chain(cell.neighbors());
            for other_cell in nearby {
                let Some(others) = buckets.get(&other_cell) else {
                    continue;
                };
                for &a in members {
                    for &b in others {
                        if a != b {
                            edges.insert(Edge::new(a, b));
                        }
                    }
                }
            }
        }

        edges
    }

    fn reset(&mut self) {
        self.points.clear();
    }

    fn len(&self) -> usize {
        self.points.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn same_cell_points_are_linked() {
        let mut hex = HexProximity::new(10.0);
        hex.add_point(Location::new(0.0, 0.0));
        hex.add_point(Location::new(1.0, 1.0));
        assert_eq!(hex.cell_of(0), hex.cell_of(1));
        assert!(hex.compute_adjacency().contains(&Edge(0, 1)));
    }

    #[test]
    fn adjacent_cells_are_linked() {
        let size = 1.0;
        let mut hex = HexProximity::new(size);
        hex.add_point(HexCell::ORIGIN.center(size));
        hex.add_point(HexCell::new(1, 0).center(size));
        assert_eq!(hex.compute_adjacency().into_iter().collect::<Vec<_>>(), vec![Edge(0, 1)]);
    }

    #[test]
    fn distant_cells_are_not_linked() {
        let size = 1.0;
        let mut hex = HexProximity::new(size);
        hex.add_point(HexCell::ORIGIN.center(size));
        hex.add_point(HexCell::new(3, 0).center(size));
        hex.add_point(HexCell::new(-2, 2).center(size));
        assert!(hex.compute_adjacency().is_empty());
    }

    proptest! {
        #[test]
        fn linked_points_are_within_one_cell(
            points in prop::collection::vec((-20.0f64..20.0, -20.0f64..20.0), 0..60),
            size in 0.5f64..5.0,
        ) {
            let mut hex = HexProximity::new(size);
            for (x, y) in &points {
                hex.add_point(Location::new(*x, *y));
            }
            for edge in hex.compute_adjacency() {
                prop_assert!(edge.0 < edge.1);
                let a = hex.cell_of(edge.0).unwrap();
                let b = hex.cell_of(edge.1).unwrap();
                prop_assert!(a.distance(&b) <= 1);
            }
        }
    }
}
