//! Adjacency collaborator interface and the k-nearest implementation.

use std::collections::BTreeSet;
use std::str::FromStr;

use crate::{HexProximity, Location, DEFAULT_CELL_SIZE, PLANAR_CONNECTIONS};

/// Undirected edge between two point indices, stored with the lower index first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge(pub usize, pub usize);

impl Edge {
    /// Normalized edge between `a` and `b`.
    pub fn new(a: usize, b: usize) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }

    /// The endpoint opposite `index`, if `index` is on this edge.
    pub fn other(&self, index: usize) -> Option<usize> {
        if self.0 == index {
            Some(self.1)
        } else if self.1 == index {
            Some(self.0)
        } else {
            None
        }
    }
}

/// Computes neighbor relations over a set of points.
///
/// Points are identified by the index [`add_point`](Self::add_point) returns,
/// which is their insertion order since the last [`reset`](Self::reset).
pub trait Adjacency: Send + Sync {
    /// Add a point; returns its index.
    fn add_point(&mut self, location: Location) -> usize;

    /// Undirected edges between added points. Never contains self-loops.
    fn compute_adjacency(&self) -> BTreeSet<Edge>;

    /// Forget all points.
    fn reset(&mut self);

    /// Number of points added.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Each point links to its `k` closest points; the result is symmetrized.
///
/// Ties are broken by the lower index so the output is deterministic.
#[derive(Debug, Clone)]
pub struct NearestNeighbors {
    k: usize,
    points: Vec<Location>,
}

impl NearestNeighbors {
    /// Create an adjacency linking each point to its `k` nearest.
    pub fn new(k: usize) -> Self {
        Self {
            k,
            points: Vec::new(),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

impl Default for NearestNeighbors {
    fn default() -> Self {
        Self::new(PLANAR_CONNECTIONS)
    }
}

impl Adjacency for NearestNeighbors {
    fn add_point(&mut self, location: Location) -> usize {
        self.points.push(location);
        self.points.len() - 1
    }

    fn compute_adjacency(&self) -> BTreeSet<Edge> {
        let mut edges = BTreeSet::new();
        let mut others: Vec<(f64, usize)> = Vec::with_capacity(self.points.len());

        for (i, point) in self.points.iter().enumerate() {
            others.clear();
            others.extend(
                self.points
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(j, other)| (point.distance_squared(other), j)),
            );
            others.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            for &(_, j) in others.iter().take(self.k) {
                edges.insert(Edge::new(i, j));
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

/// Selects an [`Adjacency`] implementation by name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdjacencyKind {
    /// [`NearestNeighbors`] with the given fanout.
    Nearest { k: usize },
    /// [`HexProximity`] with the given cell edge length.
    Hex { cell_size: f64 },
}

impl AdjacencyKind {
    /// Instantiate an empty collaborator of this kind.
    pub fn build(&self) -> Box<dyn Adjacency> {
        match *self {
            Self::Nearest { k } => Box::new(NearestNeighbors::new(k)),
            Self::Hex { cell_size } => Box::new(HexProximity::new(cell_size)),
        }
    }
}

impl Default for AdjacencyKind {
    fn default() -> Self {
        Self::Nearest {
            k: PLANAR_CONNECTIONS,
        }
    }
}

impl std::fmt::Display for AdjacencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nearest { k } => write!(f, "nearest:{k}"),
            Self::Hex { cell_size } => write!(f, "hex:{cell_size}"),
        }
    }
}

/// Parses `nearest`, `nearest:<k>`, `hex` or `hex:<cell_size>`.
impl FromStr for AdjacencyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (s.trim(), None),
        };

        match name {
            "nearest" => {
                let k = match arg {
                    Some(a) => a.parse().map_err(|e| format!("bad fanout {a:?}: {e}"))?,
                    None => PLANAR_CONNECTIONS,
                };
                Ok(Self::Nearest { k })
            }
            "hex" => {
                let cell_size = match arg {
                    Some(a) => a.parse().map_err(|e| format!("bad cell size {a:?}: {e}"))?,
                    None => DEFAULT_CELL_SIZE,
                };
                if !(cell_size > 0.0 && f64::is_finite(cell_size)) {
                    return Err(format!("cell size must be positive, got {cell_size}"));
                }
                Ok(Self::Hex { cell_size })
            }
            other => Err(format!("unknown adjacency {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn line(n: usize) -> NearestNeighbors {
        let mut nn = NearestNeighbors::new(1);
        for i in 0..n {
            nn.add_point(Location::new(i as f64, 0.0));
        }
        nn
    }

    #[test]
    fn edge_is_normalized() {
        assert_eq!(Edge::new(3, 1), Edge(1, 3));
        assert_eq!(Edge::new(1, 3).other(1), Some(3));
        assert_eq!(Edge::new(1, 3).other(3), Some(1));
        assert_eq!(Edge::new(1, 3).other(2), None);
    }

    #[test]
    fn indices_follow_insertion_order() {
        let mut nn = NearestNeighbors::default();
        assert_eq!(nn.add_point(Location::new(0.0, 0.0)), 0);
        assert_eq!(nn.add_point(Location::new(1.0, 0.0)), 1);
        assert_eq!(nn.len(), 2);
        nn.reset();
        assert!(nn.is_empty());
        assert_eq!(nn.add_point(Location::new(5.0, 5.0)), 0);
    }

    #[test]
    fn single_nearest_on_a_line() {
        // Each point's closest is its successor or predecessor; ties go to the lower index.
        let edges = line(4).compute_adjacency();
        let expected: BTreeSet<Edge> = [Edge(0, 1), Edge(1, 2), Edge(2, 3)].into_iter().collect();
        assert_eq!(edges, expected);
    }

    #[test]
    fn empty_and_single_point_have_no_edges() {
        assert!(line(0).compute_adjacency().is_empty());
        assert!(line(1).compute_adjacency().is_empty());
    }

    #[test]
    fn fanout_larger_than_population_links_everyone() {
        let mut nn = NearestNeighbors::new(10);
        for i in 0..4 {
            nn.add_point(Location::new(i as f64, (i * i) as f64));
        }
        assert_eq!(nn.compute_adjacency().len(), 6);
    }

    #[test]
    fn parse_kinds() {
        assert_eq!("nearest".parse::<AdjacencyKind>().unwrap(), AdjacencyKind::Nearest { k: 6 });
        assert_eq!("nearest:3".parse::<AdjacencyKind>().unwrap(), AdjacencyKind::Nearest { k: 3 });
        assert_eq!("hex".parse::<AdjacencyKind>().unwrap(), AdjacencyKind::Hex { cell_size: 1.0 });
        assert_eq!("hex:2.5".parse::<AdjacencyKind>().unwrap(), AdjacencyKind::Hex { cell_size: 2.5 });
        assert!("hex:-1".parse::<AdjacencyKind>().is_err());
        assert!("voronoi".parse::<AdjacencyKind>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for kind in [AdjacencyKind::Nearest { k: 4 }, AdjacencyKind::Hex { cell_size: 0.5 }] {
            assert_eq!(kind.to_string().parse::<AdjacencyKind>().unwrap(), kind);
        }
    }

    proptest! {
        #[test]
        fn nearest_edges_are_symmetric_and_loop_free(
            points in prop::collection::vec((-100.0f64..100.0, -100.0f64..100.0), 0..40),
            k in 1usize..8,
        ) {
            let mut nn = NearestNeighbors::new(k);
            for (x, y) in &points {
                nn.add_point(Location::new(*x, *y));
            }
            let edges = nn.compute_adjacency();

            for edge in &edges {
                prop_assert!(edge.0 < edge.1);
                prop_assert!(edge.1 < points.len());
            }

            // Every point with company gets at least one neighbor.
            if points.len() > 1 {
                for i in 0..points.len() {
                    prop_assert!(edges.iter().any(|e| e.other(i).is_some()));
                }
            }
        }
    }
}
