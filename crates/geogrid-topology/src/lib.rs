//! GeoGrid Topology
//!
//! Planar locations and the neighbor adjacency of the GeoGrid cache overlay.
//!
//! # Adjacency as a collaborator
//!
//! The grid never decides by itself which cache nodes are neighbors. It feeds
//! node locations into an [`Adjacency`] implementation and reads back a set of
//! undirected [`Edge`]s between point indices:
//!
//! ```text
//! add_point(a) → 0
//! add_point(b) → 1
//! add_point(c) → 2
//! compute_adjacency() → {(0,1), (1,2)}
//! ```
//!
//! Two implementations ship with the crate:
//!
//! - [`NearestNeighbors`]: every point links to its `k` closest points, and the
//!   relation is symmetrized. Default `k` is the hexagonal degree of 6.
//! - [`HexProximity`]: points are bucketed into axial hex cells; points in the
//!   same cell or in one of the 6 planar neighbor cells are linked.

mod adjacency;
mod hex;
mod location;
mod proximity;

pub use adjacency::{Adjacency, AdjacencyKind, Edge, NearestNeighbors};
pub use hex::HexCell;
pub use location::Location;
pub use proximity::HexProximity;

/// Planar neighbors of a hex cell (and the default nearest-neighbor fanout).
pub const PLANAR_CONNECTIONS: usize = 6;

/// Default edge length of a hex cell, in location units.
pub const DEFAULT_CELL_SIZE: f64 = 1.0;
