//! Cache node configuration.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use geogrid_protocol::NodeAddress;
use geogrid_topology::Location;

use crate::error::{Error, Result};

/// Configuration for a cache node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address to accept neighbor and client connections on.
    pub listen_addr: SocketAddr,
    /// Host announced to the coordinator. The port is the bound listen port.
    pub advertise_host: String,
    /// Coordinator to JOIN.
    pub coordinator: NodeAddress,
    /// This node's position on the grid plane.
    pub location: Location,
    /// Forward queries to neighbors when overloaded.
    pub propagation: bool,
    /// Take part in grid growth and report load to the coordinator.
    pub scaling: bool,
    /// Keep one channel per client instead of one per result.
    pub reuse_client_connections: bool,
    /// Delay injected before every forward to a neighbor.
    pub fake_latency: Duration,
    /// Events per window that count as a load of 1.0.
    pub load_limit: u32,
    /// Sliding window of the load estimate.
    pub load_window: Duration,
    /// Load at or above which queries are forwarded.
    pub load_threshold: f64,
    /// Period of LOAD reports when scaling is on.
    pub load_report_interval: Duration,
    /// Seed for neighbor selection. Random when unset.
    pub routing_seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7100)),
            advertise_host: "127.0.0.1".to_string(),
            coordinator: NodeAddress::new("127.0.0.1", 7000),
            location: Location::ORIGIN,
            propagation: true,
            scaling: false,
            reuse_client_connections: true,
            fake_latency: Duration::ZERO,
            load_limit: 100,
            load_window: Duration::from_millis(1000),
            load_threshold: 1.0,
            load_report_interval: Duration::from_secs(1),
            routing_seed: None,
        }
    }
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let routing_seed = match std::env::var("NODE_ROUTING_SEED") {
            Ok(raw) => Some(parse("NODE_ROUTING_SEED", &raw)?),
            Err(_) => None,
        };

        let config = Self {
            listen_addr: env_or("NODE_LISTEN_ADDR", defaults.listen_addr)?,
            advertise_host: std::env::var("NODE_ADVERTISE_HOST").unwrap_or(defaults.advertise_host),
            coordinator: env_or("NODE_COORDINATOR_ADDR", defaults.coordinator)?,
            location: env_or("NODE_LOCATION", defaults.location)?,
            propagation: env_or("NODE_PROPAGATION", defaults.propagation)?,
            scaling: env_or("NODE_SCALING", defaults.scaling)?,
            reuse_client_connections: env_or(
                "NODE_REUSE_CLIENT_CONNECTIONS",
                defaults.reuse_client_connections,
            )?,
            fake_latency: Duration::from_millis(env_or("NODE_FAKE_LATENCY_MS", 0u64)?),
            load_limit: env_or("NODE_LOAD_LIMIT", defaults.load_limit)?,
            load_window: Duration::from_millis(env_or("NODE_LOAD_WINDOW_MS", 1000u64)?),
            load_threshold: env_or("NODE_LOAD_THRESHOLD", defaults.load_threshold)?,
            load_report_interval: Duration::from_millis(env_or("NODE_LOAD_REPORT_MS", 1000u64)?),
            routing_seed,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.load_limit == 0 {
            return Err(Error::Config("load limit must be positive".into()));
        }
        if self.load_window.is_zero() {
            return Err(Error::Config("load window must be positive".into()));
        }
        if !self.load_threshold.is_finite() {
            return Err(Error::Config(format!("load threshold {} is not finite", self.load_threshold)));
        }
        if !self.location.is_finite() {
            return Err(Error::Config(format!("location {} is not finite", self.location)));
        }
        if self.scaling && self.load_report_interval.is_zero() {
            return Err(Error::Config("load report interval must be positive".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    #[must_use]
    pub fn with_coordinator(mut self, coordinator: NodeAddress) -> Self {
        self.coordinator = coordinator;
        self
    }

    #[must_use]
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    #[must_use]
    pub fn with_propagation(mut self, enabled: bool) -> Self {
        self.propagation = enabled;
        self
    }

    #[must_use]
    pub fn with_scaling(mut self, enabled: bool) -> Self {
        self.scaling = enabled;
        self
    }

    #[must_use]
    pub fn with_reuse_client_connections(mut self, enabled: bool) -> Self {
        self.reuse_client_connections = enabled;
        self
    }

    #[must_use]
    pub fn with_fake_latency(mut self, latency: Duration) -> Self {
        self.fake_latency = latency;
        self
    }

    #[must_use]
    pub fn with_load(mut self, limit: u32, window: Duration, threshold: f64) -> Self {
        self.load_limit = limit;
        self.load_window = window;
        self.load_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_load_report_interval(mut self, interval: Duration) -> Self {
        self.load_report_interval = interval;
        self
    }

    #[must_use]
    pub fn with_routing_seed(mut self, seed: u64) -> Self {
        self.routing_seed = Some(seed);
        self
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid {key}={raw:?}: {e}")))
}

/// Parse `key` from the environment, or return `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse(key, &raw),
        Err(_) => Ok(default),
    }
}
