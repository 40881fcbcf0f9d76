//! Error types for geogrid-coordinator.

use thiserror::Error;

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the coordinator.
#[derive(Debug, Error)]
pub enum Error {
    /// Messaging failure.
    #[error("protocol error: {0}")]
    Protocol(#[from] geogrid_protocol::Error),

    /// The grid is in the wrong phase for the requested operation.
    #[error("invalid grid phase: expected {expected}, got {actual}")]
    InvalidPhase {
        expected: &'static str,
        actual: String,
    },

    /// Bad configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
