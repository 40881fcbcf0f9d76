//! Error types for cache nodes.

use geogrid_protocol::MessageKind;
use thiserror::Error;

use crate::node::NodeState;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in a cache node or query client.
#[derive(Debug, Error)]
pub enum Error {
    /// Messaging error
    #[error("Protocol error: {0}")]
    Protocol(#[from] geogrid_protocol::Error),

    /// The coordinator refused the node.
    #[error("Admission rejected with status {status}: {reason}")]
    AdmissionRejected { status: i32, reason: String },

    /// A message arrived that is not valid in the node's state.
    #[error("Protocol violation: {kind} received in state {state}")]
    ProtocolViolation { state: NodeState, kind: MessageKind },

    /// A node refused a query.
    #[error("Query refused: {0}")]
    QueryRefused(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
