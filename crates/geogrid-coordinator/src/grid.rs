//! The coordinator's view of the grid: node records and their neighbor sets.
//!
//! Neighbor sets are always materialized from the adjacency collaborator's
//! edge set, so they are symmetric. Every rebuild bumps the epoch; nodes use
//! it to discard stale neighbor lists.

use std::collections::{BTreeSet, HashMap};

use geogrid_protocol::{NeighborInfo, NodeAddress};
use geogrid_topology::{Adjacency, Location};

/// One admitted node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub address: NodeAddress,
    pub location: Location,
    pub neighbors: BTreeSet<NodeAddress>,
}

/// A neighbor list that must be pushed to `address`.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborUpdate {
    pub address: NodeAddress,
    pub epoch: u64,
    pub neighbors: Vec<NeighborInfo>,
}

/// Node records plus the adjacency collaborator that links them.
pub struct Grid {
    adjacency: Box<dyn Adjacency>,
    records: HashMap<NodeAddress, NodeRecord>,
    /// Insertion order; index `i` is point `i` of the collaborator.
    order: Vec<NodeAddress>,
    epoch: u64,
}

impl Grid {
    /// Create an empty grid linked by `adjacency`.
    pub fn new(adjacency: Box<dyn Adjacency>) -> Self {
        Self {
            adjacency,
            records: HashMap::new(),
            order: Vec::new(),
            epoch: 0,
        }
    }

    /// Add a record without neighbors. Returns false if the address is taken.
    pub fn insert(&mut self, address: NodeAddress, location: Location) -> bool {
        if self.records.contains_key(&address) {
            return false;
        }
        self.order.push(address.clone());
        self.records.insert(
            address.clone(),
            NodeRecord {
                address,
                location,
                neighbors: BTreeSet::new(),
            },
        );
        true
    }

    /// Recompute every neighbor set from scratch. Returns the new epoch.
    pub fn rebuild(&mut self) -> u64 {
        self.adjacency.reset();
        for address in &self.order {
            if let Some(record) = self.records.get(address) {
                self.adjacency.add_point(record.location);
            }
        }
        let edges = self.adjacency.compute_adjacency();

        for record in self.records.values_mut() {
            record.neighbors.clear();
        }
        for edge in edges {
            let (Some(a), Some(b)) = (self.order.get(edge.0), self.order.get(edge.1)) else {
                tracing::warn!(?edge, points = self.order.len(), "Adjacency returned an edge out of range");
                continue;
            };
            if a == b {
                continue;
            }
            let (a, b) = (a.clone(), b.clone());
            if let Some(record) = self.records.get_mut(&a) {
                record.neighbors.insert(b.clone());
            }
            if let Some(record) = self.records.get_mut(&b) {
                record.neighbors.insert(a);
            }
        }

        self.epoch += 1;
        tracing::debug!(nodes = self.order.len(), epoch = self.epoch, "Grid rebuilt");
        self.epoch
    }

    /// Grow the grid by one node.
    ///
    /// Returns the updates to push: the new node first, then every existing
    /// node whose neighbor set changed. `None` if the address is taken.
    pub fn add_node(&mut self, address: NodeAddress, location: Location) -> Option<Vec<NeighborUpdate>> {
        if !self.insert(address.clone(), location) {
            return None;
        }
        let before: HashMap<NodeAddress, BTreeSet<NodeAddress>> = self
            .records
            .iter()
            .map(|(addr, record)| (addr.clone(), record.neighbors.clone()))
            .collect();

        let epoch = self.rebuild();

        let mut updates = vec![self.update_for(&address, epoch)];
        for existing in &self.order {
            if *existing == address {
                continue;
            }
            let changed = match (before.get(existing), self.records.get(existing)) {
                (Some(old), Some(record)) => *old != record.neighbors,
                _ => false,
            };
            if changed {
                updates.push(self.update_for(existing, epoch));
            }
        }
        Some(updates)
    }

    fn update_for(&self, address: &NodeAddress, epoch: u64) -> NeighborUpdate {
        NeighborUpdate {
            address: address.clone(),
            epoch,
            neighbors: self.neighbors_of(address),
        }
    }

    /// Neighbor list of `address` as sent on the wire.
    pub fn neighbors_of(&self, address: &NodeAddress) -> Vec<NeighborInfo> {
        let Some(record) = self.records.get(address) else {
            return Vec::new();
        };
        record
            .neighbors
            .iter()
            .filter_map(|n| self.records.get(n))
            .map(|n| NeighborInfo {
                address: n.address.clone(),
                location: n.location,
            })
            .collect()
    }

    pub fn record(&self, address: &NodeAddress) -> Option<&NodeRecord> {
        self.records.get(address)
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.records.contains_key(address)
    }

    /// Records in insertion order.
    pub fn records(&self) -> Vec<NodeRecord> {
        self.order
            .iter()
            .filter_map(|a| self.records.get(a).cloned())
            .collect()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
