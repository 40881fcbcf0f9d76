//! Harness for end-to-end GeoGrid tests.
//!
//! Everything binds to `127.0.0.1:0`, so tests can run in parallel.

use std::future::Future;
use std::num::NonZeroUsize;
use std::time::Duration;

use geogrid_coordinator::{AdminConfig, AdminNode};
use geogrid_node::{CacheNode, NodeConfig};
use geogrid_protocol::{bind_listener, NodeAddress};
use geogrid_topology::Location;
use tokio::task::JoinHandle;

/// Upper bound for any single step of a scenario.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// A coordinator serving on a loopback port.
pub struct TestCoordinator {
    pub admin: AdminNode,
    pub address: NodeAddress,
    pub server: JoinHandle<geogrid_coordinator::Result<()>>,
}

impl TestCoordinator {
    /// Serve a coordinator admitting `capacity` nodes and `growth_limit`
    /// more by subdivision.
    pub fn spawn(capacity: usize, growth_limit: usize) -> geogrid_protocol::Result<Self> {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let config = AdminConfig::new(loopback(), capacity).with_growth_limit(growth_limit);
        let admin = AdminNode::new(config);

        let listener = bind_listener(loopback())?;
        let address = NodeAddress::from(listener.local_addr()?);
        let server = {
            let admin = admin.clone();
            tokio::spawn(async move { admin.serve(listener).await })
        };
        Ok(Self {
            admin,
            address,
            server,
        })
    }

    /// Node config pointing at this coordinator.
    pub fn node_config(&self, location: Location) -> NodeConfig {
        NodeConfig::default()
            .with_listen_addr(loopback())
            .with_coordinator(self.address.clone())
            .with_location(location)
    }

    /// Bind a node; it does not JOIN until started.
    pub fn node(&self, config: NodeConfig) -> geogrid_node::Result<CacheNode> {
        CacheNode::bind(config)
    }
}

pub fn loopback() -> std::net::SocketAddr {
    std::net::SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Await `future`, failing the test after [`STEP_TIMEOUT`].
pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    match tokio::time::timeout(STEP_TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("timed out: {what}"),
    }
}

/// Poll `condition` every 10ms until it holds or [`STEP_TIMEOUT`] passes.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    within(what, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}
