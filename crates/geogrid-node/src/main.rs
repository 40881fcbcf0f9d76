//! Cache node binary
//!
//! Usage: `cache-node [coordinator_addr] [x,y]`. Positional arguments override
//! `NODE_COORDINATOR_ADDR` and `NODE_LOCATION`; behavior flags come from the
//! `NODE_*` environment.

use geogrid_node::{CacheNode, NodeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Used when `RUST_LOG` is unset. `geogrid` covers the telemetry target.
const DEFAULT_LOG_FILTER: &str = "cache_node=info,geogrid_node=info,geogrid_protocol=info,geogrid=info";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = NodeConfig::from_env()?;
    let mut args = std::env::args().skip(1);
    if let Some(coordinator) = args.next() {
        config.coordinator = coordinator.parse()?;
    }
    if let Some(location) = args.next() {
        config.location = location.parse()?;
    }

    tracing::info!(
        coordinator = %config.coordinator,
        location = %config.location,
        propagation = config.propagation,
        scaling = config.scaling,
        "Starting cache node"
    );

    let node = CacheNode::bind(config)?;
    tokio::select! {
        ran = node.run() => ran?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, closing node");
            node.close().await;
        }
    }

    Ok(())
}
