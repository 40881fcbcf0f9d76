//! Error types for geogrid-protocol.

use thiserror::Error;

/// Result type for geogrid-protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on a messaging channel.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection is gone; the channel cannot be used again.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A payload could not be encoded or decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    /// A node address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// IO error outside of an established channel (binding, accepting).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the error means the channel is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportFailure(_))
    }
}
