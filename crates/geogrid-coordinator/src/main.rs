//! Grid coordinator binary
//!
//! Usage: `grid-admin [listen_port] [capacity]`. Positional arguments override
//! `GRID_LISTEN_ADDR`'s port and `GRID_CAPACITY`.

use geogrid_coordinator::{AdminConfig, AdminNode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Used when `RUST_LOG` is unset. `geogrid` covers the telemetry target.
const DEFAULT_LOG_FILTER: &str = "grid_admin=info,geogrid_coordinator=info,geogrid_protocol=info,geogrid=info";

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

    let mut config = AdminConfig::from_env()?;
    let mut args = std::env::args().skip(1);
    if let Some(port) = args.next() {
        config.listen_addr.set_port(port.parse()?);
    }
    if let Some(capacity) = args.next() {
        config.capacity = capacity.parse()?;
    }

    tracing::info!(
        addr = %config.listen_addr,
        capacity = config.capacity.get(),
        growth_limit = config.growth_limit,
        "Starting grid coordinator"
    );

    let admin = AdminNode::new(config);
    tokio::select! {
        served = admin.run() => served?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting the grid down");
            admin.shutdown().await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_library_crates() {
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
        assert!(DEFAULT_LOG_FILTER.contains("geogrid_coordinator=info"));
        assert!(DEFAULT_LOG_FILTER.contains("geogrid_protocol=info"));
    }
}
