//! Coordinator configuration.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::str::FromStr;

use geogrid_topology::AdjacencyKind;

use crate::error::{Error, Result};

/// Configuration for the grid coordinator.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Address the coordinator accepts node connections on.
    pub listen_addr: SocketAddr,
    /// Number of nodes admitted during signup.
    pub capacity: NonZeroUsize,
    /// Nodes that may be added by subdivision once the grid runs.
    pub growth_limit: usize,
    /// Adjacency collaborator used to link nodes.
    pub adjacency: AdjacencyKind,
}

impl AdminConfig {
    /// Create a config with growth disabled and the default adjacency.
    pub fn new(listen_addr: SocketAddr, capacity: NonZeroUsize) -> Self {
        Self {
            listen_addr,
            capacity,
            growth_limit: 0,
            adjacency: AdjacencyKind::default(),
        }
    }

    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        let listen_addr = env_or("GRID_LISTEN_ADDR", "0.0.0.0:7000")?;
        let capacity = env_or("GRID_CAPACITY", "4")?;
        let growth_limit = env_or("GRID_GROWTH_LIMIT", "0")?;
        let adjacency = env_or("GRID_ADJACENCY", "nearest")?;

        Ok(Self {
            listen_addr,
            capacity,
            growth_limit,
            adjacency,
        })
    }

    #[must_use]
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    #[must_use]
    pub fn with_growth_limit(mut self, limit: usize) -> Self {
        self.growth_limit = limit;
        self
    }

    #[must_use]
    pub fn with_adjacency(mut self, adjacency: AdjacencyKind) -> Self {
        self.adjacency = adjacency;
        self
    }
}

/// Parse `key` from the environment, falling back to `default` when unset.
fn env_or<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid {key}={raw:?}: {e}")))
}
