//! GeoGrid Coordinator - Admission and Grid Bootstrap
//!
//! The coordinator is the one well-known address of a GeoGrid. Cache nodes
//! connect to it and send JOIN; it admits a fixed number of them, links them
//! with an adjacency collaborator and pushes each node its neighbor list.
//!
//! # Lifecycle
//!
//! ```text
//! Signup --(capacity reached)--> Running --(shutdown)--> Shutdown
//! ```
//!
//! - **Signup**: JOINs are admitted until capacity. Duplicates and overflow
//!   are refused with a CONFIRM status.
//! - **Running**: the grid is built once; every node gets ADD_TO_GRID, then
//!   ACTIVATE after all acknowledged. Load reports are collected and the grid
//!   may grow one node at a time through SUBDIVISION_REQUEST.
//! - **Shutdown**: SHUTDOWN is broadcast and the listener stops.

pub mod admin;
pub mod admission;
pub mod config;
pub mod error;
pub mod grid;
pub mod state;

pub use admin::{Activation, AdminNode};
pub use admission::{Admitted, JoinRequest, JoinRequestManager, Rejection};
pub use config::AdminConfig;
pub use error::{Error, Result};
pub use grid::{Grid, NeighborUpdate, NodeRecord};
pub use state::{GridPhase, GridState, PhaseTracker};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
