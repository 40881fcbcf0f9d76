//! Query routing decision.
//!
//! A node serves a query itself unless it is overloaded and allowed to pass
//! the query on. Forwarding picks a neighbor uniformly at random.

use geogrid_protocol::{NeighborInfo, NodeAddress, QueryMessage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// What to do with a query.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Serve it here and deliver the result to the client.
    Local,
    /// Send it on to this neighbor.
    Forward(NodeAddress),
}

/// Load-aware router.
#[derive(Debug)]
pub struct QueryRouter {
    threshold: f64,
    propagation: bool,
    rng: StdRng,
}

impl QueryRouter {
    /// Create a router seeded from system entropy.
    pub fn new(threshold: f64, propagation: bool) -> Self {
        Self {
            threshold,
            propagation,
            rng: StdRng::from_entropy(),
        }
    }

    /// Router with reproducible neighbor selection.
    pub fn seeded(threshold: f64, propagation: bool, seed: u64) -> Self {
        Self {
            threshold,
            propagation,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Decide where `query` goes given the node's current `load`.
    ///
    /// On a forward the query is charged one hop by `hop` before it leaves.
    pub fn route(
        &mut self,
        load: f64,
        query: &mut QueryMessage,
        neighbors: &[NeighborInfo],
        hop: &NodeAddress,
    ) -> RouteDecision {
        if load < self.threshold || !self.propagation || !query.can_propagate() {
            return RouteDecision::Local;
        }
        let Some(next) = neighbors.choose(&mut self.rng) else {
            return RouteDecision::Local;
        };
        query.record_hop(hop.clone());
        RouteDecision::Forward(next.address.clone())
    }
}
