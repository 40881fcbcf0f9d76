//! Wire taxonomy: message kinds and the envelope that carries them.
//!
//! Every message travels inside an [`Envelope`] serialized as one line of
//! JSON. The payload is internally tagged by `kind`:
//!
//! ```text
//! {"id":7,"response_expected":true,"payload":{"kind":"JOIN","address":{...},"location":{...}}}
//! {"id":7,"response_expected":false,"payload":{"kind":"CONFIRM","status":0}}
//! ```

use geogrid_topology::Location;
use serde::{Deserialize, Serialize};

use crate::address::NodeAddress;
use crate::error::Result;

/// Correlation id pairing a request with its response.
pub type CorrelationId = u64;

/// Id carried by one-way notifications. Never allocated for a request.
pub const NOTIFICATION_ID: CorrelationId = 0;

/// CONFIRM status: success.
pub const STATUS_OK: i32 = 0;
/// CONFIRM status: the address was already admitted.
pub const STATUS_DUPLICATE: i32 = 1;
/// CONFIRM status: the grid reached capacity.
pub const STATUS_FULL: i32 = 2;
/// CONFIRM status: the coordinator is no longer in signup.
pub const STATUS_NOT_SIGNUP: i32 = 3;
/// CONFIRM status: the message is not valid in the receiver's state.
pub const STATUS_PROTOCOL_VIOLATION: i32 = 4;
/// CONFIRM status: a growth request was refused.
pub const STATUS_GROWTH_REJECTED: i32 = 5;

/// Address and location of a neighbor, as pushed by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborInfo {
    pub address: NodeAddress,
    pub location: Location,
}

/// A location-tagged query travelling through the grid.
///
/// A query follows exactly one path: it is mutated in place at every hop and
/// never copied into two forwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMessage {
    pub id: u64,
    pub location: Location,
    /// Where the result is delivered.
    pub client: NodeAddress,
    /// Remaining forwards.
    pub ttl: u32,
    /// Cleared when the query must be served by the next node that sees it.
    pub propagate: bool,
    /// Nodes that forwarded this query, in order.
    #[serde(default)]
    pub debug_path: Vec<NodeAddress>,
}

impl QueryMessage {
    /// Create a fresh query with propagation allowed and an empty path.
    pub fn new(id: u64, location: Location, client: NodeAddress, ttl: u32) -> Self {
        Self {
            id,
            location,
            client,
            ttl,
            propagate: true,
            debug_path: Vec::new(),
        }
    }

    /// Whether another forward is allowed.
    pub fn can_propagate(&self) -> bool {
        self.propagate && self.ttl > 0
    }

    /// Account for a forward by `hop`: append it to the path and spend one ttl.
    ///
    /// When the ttl runs out propagation is disabled for good, so the receiver
    /// serves the query whatever its own load.
    pub fn record_hop(&mut self, hop: NodeAddress) {
        self.debug_path.push(hop);
        self.ttl = self.ttl.saturating_sub(1);
        if self.ttl == 0 {
            self.propagate = false;
        }
    }
}

/// Message kinds exchanged between coordinator, nodes and clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Node asks to be admitted.
    Join {
        address: NodeAddress,
        location: Location,
    },
    /// Generic acknowledgment; `status` 0 is success.
    Confirm {
        status: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Coordinator pushes a node's neighbor list.
    AddToGrid {
        epoch: u64,
        neighbors: Vec<NeighborInfo>,
    },
    /// Coordinator tells a node to start serving.
    Activate,
    /// A query to route or serve.
    QueryMessage(QueryMessage),
    /// Result delivered to the client.
    QueryResult {
        id: u64,
        debug_path: Vec<NodeAddress>,
    },
    /// Load telemetry.
    Load { address: NodeAddress, load: f64 },
    /// A node asks to be added to a running grid.
    SubdivisionRequest {
        address: NodeAddress,
        location: Location,
    },
    /// Replacement neighbor list after the grid grew.
    SubdivisionCommit {
        epoch: u64,
        neighbors: Vec<NeighborInfo>,
    },
    /// Node applied (or skipped as stale) a commit.
    SubdivisionConfirm { epoch: u64 },
    /// Coordinator is shutting the grid down.
    Shutdown,
}

impl Message {
    /// Successful CONFIRM.
    pub fn ok() -> Self {
        Self::Confirm {
            status: STATUS_OK,
            text: None,
        }
    }

    /// CONFIRM with a status and explanation.
    pub fn confirm(status: i32, text: impl Into<String>) -> Self {
        Self::Confirm {
            status,
            text: Some(text.into()),
        }
    }

    /// Discriminator, for logging and error reporting.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Join { .. } => MessageKind::Join,
            Self::Confirm { .. } => MessageKind::Confirm,
            Self::AddToGrid { .. } => MessageKind::AddToGrid,
            Self::Activate => MessageKind::Activate,
            Self::QueryMessage(_) => MessageKind::QueryMessage,
            Self::QueryResult { .. } => MessageKind::QueryResult,
            Self::Load { .. } => MessageKind::Load,
            Self::SubdivisionRequest { .. } => MessageKind::SubdivisionRequest,
            Self::SubdivisionCommit { .. } => MessageKind::SubdivisionCommit,
            Self::SubdivisionConfirm { .. } => MessageKind::SubdivisionConfirm,
            Self::Shutdown => MessageKind::Shutdown,
        }
    }

    /// CONFIRM status, if this is a CONFIRM.
    pub fn status(&self) -> Option<i32> {
        match self {
            Self::Confirm { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for CONFIRM with status 0 and for SUBDIVISION_CONFIRM.
    pub fn is_ack(&self) -> bool {
        matches!(
            self,
            Self::Confirm {
                status: STATUS_OK,
                ..
            } | Self::SubdivisionConfirm { .. }
        )
    }
}

/// Message discriminator without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Join,
    Confirm,
    AddToGrid,
    Activate,
    QueryMessage,
    QueryResult,
    Load,
    SubdivisionRequest,
    SubdivisionCommit,
    SubdivisionConfirm,
    Shutdown,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Join => "JOIN",
            Self::Confirm => "CONFIRM",
            Self::AddToGrid => "ADD_TO_GRID",
            Self::Activate => "ACTIVATE",
            Self::QueryMessage => "QUERY_MESSAGE",
            Self::QueryResult => "QUERY_RESULT",
            Self::Load => "LOAD",
            Self::SubdivisionRequest => "SUBDIVISION_REQUEST",
            Self::SubdivisionCommit => "SUBDIVISION_COMMIT",
            Self::SubdivisionConfirm => "SUBDIVISION_CONFIRM",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

/// Wire wrapper around a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: CorrelationId,
    /// Set on requests. Responses and notifications never expect a reply.
    pub response_expected: bool,
    pub payload: Message,
}

impl Envelope {
    /// Wrap a request that expects one response.
    pub fn request(id: CorrelationId, payload: Message) -> Self {
        Self {
            id,
            response_expected: true,
            payload,
        }
    }

    /// Wrap the response to request `id`.
    pub fn response(id: CorrelationId, payload: Message) -> Self {
        Self {
            id,
            response_expected: false,
            payload,
        }
    }

    /// Wrap a one-way message.
    pub fn notification(payload: Message) -> Self {
        Self {
            id: NOTIFICATION_ID,
            response_expected: false,
            payload,
        }
    }

    /// Encode as a single JSON line (without the trailing newline).
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}
