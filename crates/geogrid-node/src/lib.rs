//! GeoGrid Node - Cache Node Runtime
//!
//! A cache node is one cell of the GeoGrid overlay. It joins the coordinator,
//! learns its neighbors and then answers location-tagged queries, passing
//! them on to a random neighbor while it is overloaded.
//!
//! # Architecture
//!
//! - **Node**: the lifecycle state machine and all channel handling
//! - **Load**: sliding-window event-rate estimate
//! - **Router**: the pure forward-or-serve decision
//! - **Client**: injects queries and collects results
//!
//! # Example
//!
//! ```no_run
//! use geogrid_node::{CacheNode, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::from_env()?;
//!     let node = CacheNode::bind(config)?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod load;
pub mod node;
pub mod router;

pub use client::{QueryClient, QueryOutcome};
pub use config::NodeConfig;
pub use error::{Error, Result};
pub use load::LoadTracker;
pub use node::{Admission, CacheNode, NodeState};
pub use router::{QueryRouter, RouteDecision};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
